use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Element type of a tensor.
///
/// Floating point types are held as `f32` on the host, integer and boolean
/// types as `i32` (or `i64` for [`DataType::Int64`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DataType {
    Float,
    Float16,
    Double,
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint32,
    Bool,
}

impl DataType {
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Float => "FLOAT",
            DataType::Float16 => "FLOAT16",
            DataType::Double => "DOUBLE",
            DataType::Int8 => "INT8",
            DataType::Int16 => "INT16",
            DataType::Int32 => "INT32",
            DataType::Int64 => "INT64",
            DataType::Uint8 => "UINT8",
            DataType::Uint32 => "UINT32",
            DataType::Bool => "BOOL",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_uppercase().as_str() {
            "FLOAT" | "FLOAT32" => DataType::Float,
            "FLOAT16" | "HALF" => DataType::Float16,
            "DOUBLE" | "FLOAT64" => DataType::Double,
            "INT8" => DataType::Int8,
            "INT16" => DataType::Int16,
            "INT32" => DataType::Int32,
            "INT64" => DataType::Int64,
            "UINT8" => DataType::Uint8,
            "UINT32" => DataType::Uint32,
            "BOOL" => DataType::Bool,
            _ => return None,
        })
    }

    /// Size of one element on the device.
    pub fn nbytes(&self) -> usize {
        match self {
            DataType::Int8 | DataType::Uint8 | DataType::Bool => 1,
            DataType::Float16 | DataType::Int16 => 2,
            DataType::Float | DataType::Int32 | DataType::Uint32 => 4,
            DataType::Double | DataType::Int64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::Float | DataType::Float16 | DataType::Double)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Dtype and shape of a tensor. An empty shape is a scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorInfo {
    pub dtype: DataType,
    pub shape: Vec<i64>,
}

impl TensorInfo {
    pub fn new(dtype: DataType, shape: impl Into<Vec<i64>>) -> Self {
        Self {
            dtype,
            shape: shape.into(),
        }
    }

    pub fn float(shape: impl Into<Vec<i64>>) -> Self {
        Self::new(DataType::Float, shape)
    }

    pub fn scalar(dtype: DataType) -> Self {
        Self::new(dtype, Vec::new())
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn nelms(&self) -> usize {
        self.shape.iter().map(|&d| d.max(0) as usize).product()
    }

    pub fn nbytes(&self) -> usize {
        self.nelms() * self.dtype.nbytes()
    }

    pub fn with_shape(&self, shape: impl Into<Vec<i64>>) -> Self {
        Self::new(self.dtype, shape)
    }

    pub fn with_dtype(&self, dtype: DataType) -> Self {
        Self::new(dtype, self.shape.clone())
    }

    /// Normalizes a possibly negative axis into `[0, rank)`.
    pub fn axis(&self, axis: i64) -> Result<usize> {
        let rank = self.rank() as i64;
        let resolved = if axis < 0 { axis + rank } else { axis };
        if resolved < 0 || resolved >= rank.max(1) {
            return Err(Error::shape(format!(
                "axis {axis} is out of range for tensor of rank {rank}"
            )));
        }
        Ok(resolved as usize)
    }
}

impl fmt::Display for TensorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.dtype, self.shape)
    }
}

/// Numpy-style broadcast of two shapes.
pub fn np_broadcast(a: &[i64], b: &[i64]) -> Result<Vec<i64>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i + a.len() >= rank { a[i + a.len() - rank] } else { 1 };
        let db = if i + b.len() >= rank { b[i + b.len() - rank] } else { 1 };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => {
                return Err(Error::shape(format!(
                    "np broadcasting failed, frames {a:?} and {b:?} are not aligned"
                )))
            }
        };
    }
    Ok(out)
}

/// Host element storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorData {
    F32(Vec<f32>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl TensorData {
    pub fn zeros(dtype: DataType, len: usize) -> Self {
        match dtype {
            DataType::Int64 => TensorData::I64(vec![0; len]),
            d if d.is_float() => TensorData::F32(vec![0.0; len]),
            _ => TensorData::I32(vec![0; len]),
        }
    }

    /// Converts `values` into the storage used for `dtype`.
    pub fn from_f32(dtype: DataType, values: Vec<f32>) -> Self {
        match dtype {
            DataType::Int64 => TensorData::I64(values.into_iter().map(|v| v as i64).collect()),
            d if d.is_float() => TensorData::F32(values),
            _ => TensorData::I32(values.into_iter().map(|v| v as i32).collect()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn matches_dtype(&self, dtype: DataType) -> bool {
        matches!(
            (self, dtype),
            (TensorData::I64(_), DataType::Int64)
                | (TensorData::F32(_), DataType::Float | DataType::Float16 | DataType::Double)
                | (
                    TensorData::I32(_),
                    DataType::Int8
                        | DataType::Int16
                        | DataType::Int32
                        | DataType::Uint8
                        | DataType::Uint32
                        | DataType::Bool
                )
        )
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            TensorData::F32(v) => v.clone(),
            TensorData::I32(v) => v.iter().map(|&x| x as f32).collect(),
            TensorData::I64(v) => v.iter().map(|&x| x as f32).collect(),
        }
    }

    pub fn to_i64_vec(&self) -> Vec<i64> {
        match self {
            TensorData::F32(v) => v.iter().map(|&x| x as i64).collect(),
            TensorData::I32(v) => v.iter().map(|&x| i64::from(x)).collect(),
            TensorData::I64(v) => v.clone(),
        }
    }

    /// Copies `len` elements starting at `offset`.
    pub fn slice(&self, offset: usize, len: usize) -> Option<TensorData> {
        let end = offset.checked_add(len)?;
        if end > self.len() {
            return None;
        }
        Some(match self {
            TensorData::F32(v) => TensorData::F32(v[offset..end].to_vec()),
            TensorData::I32(v) => TensorData::I32(v[offset..end].to_vec()),
            TensorData::I64(v) => TensorData::I64(v[offset..end].to_vec()),
        })
    }

    /// Overwrites elements starting at `offset` with `src`. Returns false when
    /// the storage kinds differ or `src` does not fit.
    pub fn write_at(&mut self, offset: usize, src: &TensorData) -> bool {
        if offset + src.len() > self.len() {
            return false;
        }
        match (self, src) {
            (TensorData::F32(dst), TensorData::F32(s)) => {
                dst[offset..offset + s.len()].copy_from_slice(s)
            }
            (TensorData::I32(dst), TensorData::I32(s)) => {
                dst[offset..offset + s.len()].copy_from_slice(s)
            }
            (TensorData::I64(dst), TensorData::I64(s)) => {
                dst[offset..offset + s.len()].copy_from_slice(s)
            }
            _ => return false,
        }
        true
    }

    /// Element-wise `self += other` for float storage.
    pub fn accumulate(&mut self, other: &TensorData) -> bool {
        match (self, other) {
            (TensorData::F32(dst), TensorData::F32(src)) if dst.len() == src.len() => {
                for (d, s) in dst.iter_mut().zip(src) {
                    *d += *s;
                }
                true
            }
            (TensorData::I32(dst), TensorData::I32(src)) if dst.len() == src.len() => {
                for (d, s) in dst.iter_mut().zip(src) {
                    *d += *s;
                }
                true
            }
            (TensorData::I64(dst), TensorData::I64(src)) if dst.len() == src.len() => {
                for (d, s) in dst.iter_mut().zip(src) {
                    *d += *s;
                }
                true
            }
            _ => false,
        }
    }
}

/// A tensor value held on the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostTensor {
    pub info: TensorInfo,
    pub data: TensorData,
}

impl HostTensor {
    pub fn new(info: TensorInfo, data: TensorData) -> Result<Self> {
        if data.len() != info.nelms() {
            return Err(Error::shape(format!(
                "tensor of {info} needs {} elements, got {}",
                info.nelms(),
                data.len()
            )));
        }
        if !data.matches_dtype(info.dtype) {
            return Err(Error::shape(format!(
                "host storage does not match dtype {}",
                info.dtype
            )));
        }
        Ok(Self { info, data })
    }

    pub fn from_f32(shape: impl Into<Vec<i64>>, values: Vec<f32>) -> Result<Self> {
        Self::new(TensorInfo::float(shape), TensorData::F32(values))
    }

    pub fn from_i32(shape: impl Into<Vec<i64>>, values: Vec<i32>) -> Result<Self> {
        Self::new(
            TensorInfo::new(DataType::Int32, shape),
            TensorData::I32(values),
        )
    }

    pub fn from_i64(shape: impl Into<Vec<i64>>, values: Vec<i64>) -> Result<Self> {
        Self::new(
            TensorInfo::new(DataType::Int64, shape),
            TensorData::I64(values),
        )
    }

    pub fn scalar_f32(value: f32) -> Self {
        Self {
            info: TensorInfo::scalar(DataType::Float),
            data: TensorData::F32(vec![value]),
        }
    }

    pub fn zeros(info: TensorInfo) -> Self {
        let data = TensorData::zeros(info.dtype, info.nelms());
        Self { info, data }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.data.to_f32_vec()
    }

    pub fn to_i64_vec(&self) -> Vec<i64> {
        self.data.to_i64_vec()
    }

    pub fn shape(&self) -> &[i64] {
        &self.info.shape
    }

    /// Reinterprets the tensor with a new shape of equal element count.
    pub fn reshaped(mut self, shape: impl Into<Vec<i64>>) -> Result<Self> {
        let info = self.info.with_shape(shape);
        if info.nelms() != self.data.len() {
            return Err(Error::shape(format!(
                "cannot view {} elements as {info}",
                self.data.len()
            )));
        }
        self.info = info;
        Ok(self)
    }
}

/// Declared infos for stream tensors, keyed by tensor name.
///
/// Passed to a session to declare or override the shapes of inputs whose
/// model declaration is incomplete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputShapeInfo {
    infos: BTreeMap<String, TensorInfo>,
}

impl InputShapeInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: impl Into<String>, info: TensorInfo) -> &mut Self {
        self.infos.insert(id.into(), info);
        self
    }

    pub fn get(&self, id: &str) -> Option<&TensorInfo> {
        self.infos.get(id)
    }

    pub fn has(&self, id: &str) -> bool {
        self.infos.contains_key(id)
    }

    pub fn as_map(&self) -> &BTreeMap<String, TensorInfo> {
        &self.infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_follows_numpy_rules() {
        assert_eq!(np_broadcast(&[4, 1, 4], &[3, 1]).ok(), Some(vec![4, 3, 4]));
        assert_eq!(np_broadcast(&[], &[2, 2]).ok(), Some(vec![2, 2]));
        assert!(np_broadcast(&[2, 3], &[4, 3]).is_err());
    }

    #[test]
    fn scalar_has_one_element() {
        let info = TensorInfo::scalar(DataType::Float);
        assert_eq!(info.nelms(), 1);
        assert_eq!(info.nbytes(), 4);
    }

    #[test]
    fn rejects_mismatched_storage() {
        assert!(HostTensor::new(TensorInfo::float([2]), TensorData::I32(vec![1, 2])).is_err());
        assert!(HostTensor::from_f32([3], vec![1.0, 2.0]).is_err());
    }

    #[test]
    fn slice_and_write_roundtrip_through_offsets() {
        let mut data = TensorData::F32(vec![0.0; 4]);
        assert!(data.write_at(2, &TensorData::F32(vec![5.0, 6.0])));
        assert!(!data.write_at(3, &TensorData::F32(vec![1.0, 1.0])));
        assert_eq!(data.slice(1, 3), Some(TensorData::F32(vec![0.0, 5.0, 6.0])));
    }
}
