//! Serialized model format.
//!
//! A model file is an 8 byte magic, a little-endian `u32` format version and
//! a bincode body. All maps are ordered so that equal graphs always encode to
//! identical bytes.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hashing::fnv1a_hash;
use crate::tensor::{TensorData, TensorInfo};

const MAGIC: &[u8; 8] = b"FGMODEL\0";
const VERSION: u32 = 1;

pub const IR_VERSION: u32 = 6;
pub const OPSET_VERSION: u32 = 11;
pub const PRODUCER_NAME: &str = "ferrograph";

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("model bytes do not start with the model magic")]
    BadMagic,
    #[error("unsupported model format version {0} (expected {VERSION})")]
    UnsupportedVersion(u32),
    #[error("model bytes truncated")]
    Truncated,
    #[error("failed to decode model: {0}")]
    Decode(#[from] bincode::Error),
    #[error("failed to access model file: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Int(i64),
    Ints(Vec<i64>),
    Float(f32),
    Floats(Vec<f32>),
    String(String),
    Strings(Vec<String>),
    Tensor(TensorProto),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorProto {
    pub name: String,
    pub info: TensorInfo,
    pub data: TensorData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueInfoProto {
    pub name: String,
    pub info: TensorInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeProto {
    pub name: String,
    pub op_type: String,
    pub domain: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl NodeProto {
    pub fn attr(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    pub fn attr_int(&self, name: &str) -> Option<i64> {
        match self.attributes.get(name) {
            Some(AttributeValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn attr_ints(&self, name: &str) -> Option<&[i64]> {
        match self.attributes.get(name) {
            Some(AttributeValue::Ints(v)) => Some(v),
            _ => None,
        }
    }

    pub fn attr_float(&self, name: &str) -> Option<f32> {
        match self.attributes.get(name) {
            Some(AttributeValue::Float(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn attr_strings(&self, name: &str) -> Option<&[String]> {
        match self.attributes.get(name) {
            Some(AttributeValue::Strings(v)) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphProto {
    pub name: String,
    pub nodes: Vec<NodeProto>,
    pub inputs: Vec<ValueInfoProto>,
    pub outputs: Vec<ValueInfoProto>,
    pub initializers: Vec<TensorProto>,
    pub value_info: Vec<ValueInfoProto>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProto {
    pub ir_version: u32,
    pub producer_name: String,
    pub opset_version: u32,
    pub graph: GraphProto,
}

impl ModelProto {
    pub fn new(graph: GraphProto) -> Self {
        Self {
            ir_version: IR_VERSION,
            producer_name: PRODUCER_NAME.to_string(),
            opset_version: OPSET_VERSION,
            graph,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        let body = bincode::serialize(self)?;
        let mut bytes = Vec::with_capacity(MAGIC.len() + 4 + body.len());
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        if bytes.len() < MAGIC.len() + 4 {
            return Err(ProtoError::Truncated);
        }
        if &bytes[..MAGIC.len()] != MAGIC {
            return Err(ProtoError::BadMagic);
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[MAGIC.len()..MAGIC.len() + 4]);
        let version = u32::from_le_bytes(version);
        if version != VERSION {
            return Err(ProtoError::UnsupportedVersion(version));
        }
        Ok(bincode::deserialize(&bytes[MAGIC.len() + 4..])?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ProtoError> {
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProtoError> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Human readable rendering for debugging; not a stable format.
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn fingerprint(&self) -> Result<u64, ProtoError> {
        Ok(fnv1a_hash(&self.to_bytes()?))
    }

    pub fn initializer_mut(&mut self, name: &str) -> Option<&mut TensorProto> {
        self.graph
            .initializers
            .iter_mut()
            .find(|init| init.name == name)
    }
}
