use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ir::TensorId;
use crate::tensor::TensorInfo;

/// How the per-batch values of an anchor are returned to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnchorReturnType {
    /// Every micro-batch.
    All,
    /// Only the last micro-batch of a step.
    Final,
    /// Every n-th micro-batch.
    EveryN(usize),
    /// Sum over the micro-batches of a step.
    Sum,
}

impl AnchorReturnType {
    pub fn name(&self) -> &'static str {
        match self {
            AnchorReturnType::All => "ALL",
            AnchorReturnType::Final => "FINAL",
            AnchorReturnType::EveryN(_) => "EVERYN",
            AnchorReturnType::Sum => "SUM",
        }
    }

    /// Number of values returned per step.
    pub fn returns_per_step(&self, batches_per_step: usize) -> usize {
        match self {
            AnchorReturnType::All => batches_per_step,
            AnchorReturnType::EveryN(n) => batches_per_step / (*n).max(1),
            AnchorReturnType::Final | AnchorReturnType::Sum => 1,
        }
    }

    /// Whether the value of micro-batch `batch` (0-based within a step) is
    /// written out.
    pub fn writes_batch(&self, batch: usize, batches_per_step: usize) -> bool {
        match self {
            AnchorReturnType::All => true,
            AnchorReturnType::EveryN(n) => (batch + 1) % (*n).max(1) == 0,
            AnchorReturnType::Final | AnchorReturnType::Sum => batch + 1 == batches_per_step,
        }
    }

    /// Host buffer info for an anchor of `info`: a leading dimension of
    /// returns per step, dropped when it is 1.
    pub fn buffer_info(&self, batches_per_step: usize, info: &TensorInfo) -> TensorInfo {
        let returns = self.returns_per_step(batches_per_step);
        if returns == 1 {
            return info.clone();
        }
        let mut shape = Vec::with_capacity(info.rank() + 1);
        shape.push(returns as i64);
        shape.extend_from_slice(&info.shape);
        info.with_shape(shape)
    }
}

impl fmt::Display for AnchorReturnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnchorReturnType::EveryN(n) => write!(f, "EVERYN({n})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Batches per step and the anchored tensors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFlow {
    batches_per_step: usize,
    anchors: BTreeMap<TensorId, AnchorReturnType>,
}

impl DataFlow {
    pub fn new<I, S>(batches_per_step: usize, anchors: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, AnchorReturnType)>,
        S: Into<TensorId>,
    {
        if batches_per_step == 0 {
            return Err(Error::config("batchesPerStep must be greater than 0"));
        }
        let mut map = BTreeMap::new();
        for (id, art) in anchors {
            let id = id.into();
            if let AnchorReturnType::EveryN(n) = art {
                if n == 0 {
                    return Err(Error::config(format!(
                        "EVERYN return period for '{id}' must be greater than 0"
                    )));
                }
                if batches_per_step % n != 0 {
                    return Err(Error::config(format!(
                        "EVERYN return period {n} for '{id}' must divide batchesPerStep ({batches_per_step})"
                    )));
                }
            }
            map.insert(id, art);
        }
        Ok(Self {
            batches_per_step,
            anchors: map,
        })
    }

    pub fn batches_per_step(&self) -> usize {
        self.batches_per_step
    }

    pub fn anchors(&self) -> impl Iterator<Item = (&TensorId, &AnchorReturnType)> {
        self.anchors.iter()
    }

    pub fn anchor_ids(&self) -> impl Iterator<Item = &TensorId> {
        self.anchors.keys()
    }

    pub fn art(&self, id: &str) -> Option<AnchorReturnType> {
        self.anchors.get(id).copied()
    }

    pub fn is_anchored(&self, id: &str) -> bool {
        self.anchors.contains_key(id)
    }

    pub fn num_anchors(&self) -> usize {
        self.anchors.len()
    }
}
