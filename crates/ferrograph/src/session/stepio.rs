//! Host side of the per-step data exchange.
//!
//! For every micro-batch the session asks a [`StepIo`] for one batch of each
//! input stream and hands it anchor values to store. Array-backed stepios keep
//! a cursor per tensor that advances by one batch on completion and wraps
//! around at the end of the buffer.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::ir::TensorId;
use crate::tensor::{HostTensor, TensorData, TensorInfo};

use super::anchors::Anchors;

pub trait StepIo {
    /// Data for the current micro-batch of input `id`, laid out as `info`.
    fn input(&mut self, id: &str, info: &TensorInfo) -> Result<TensorData>;

    /// Marks the current batch of `id` as consumed.
    fn input_complete(&mut self, id: &str) -> Result<()>;

    /// Stores one value of anchor `id` at its cursor.
    fn output(&mut self, id: &str, value: &TensorData) -> Result<()>;

    /// Checks total buffer sizes before a step starts. `inputs` and `outputs`
    /// map tensor ids to the element count expected for a whole step.
    fn assert_num_elements(
        &self,
        _inputs: &BTreeMap<TensorId, usize>,
        _outputs: &BTreeMap<TensorId, usize>,
    ) -> Result<()> {
        Ok(())
    }
}

fn missing(id: &str, map: &str) -> Error {
    Error::StepIo(format!("No tensor {id} provided in StepIO's {map}"))
}

fn advance(cursor: &mut usize, step: usize, len: usize) {
    *cursor += step;
    if *cursor >= len {
        *cursor = 0;
    }
}

/// Reads inputs from host tensors of shape `[bps, *shape]` and writes anchors
/// into the buffers from `init_anchor_arrays`.
pub struct ArrayStepIo<'a> {
    inputs: BTreeMap<TensorId, &'a HostTensor>,
    outputs: &'a mut Anchors,
    in_cursors: BTreeMap<TensorId, (usize, usize)>,
    out_cursors: BTreeMap<TensorId, usize>,
}

impl<'a> ArrayStepIo<'a> {
    pub fn new<I, S>(inputs: I, outputs: &'a mut Anchors) -> Self
    where
        I: IntoIterator<Item = (S, &'a HostTensor)>,
        S: Into<TensorId>,
    {
        Self {
            inputs: inputs.into_iter().map(|(id, t)| (id.into(), t)).collect(),
            outputs,
            in_cursors: BTreeMap::new(),
            out_cursors: BTreeMap::new(),
        }
    }
}

impl StepIo for ArrayStepIo<'_> {
    fn input(&mut self, id: &str, info: &TensorInfo) -> Result<TensorData> {
        let tensor = self.inputs.get(id).ok_or_else(|| missing(id, "inputs"))?;
        let nelms = info.nelms();
        let (offset, _) = self.in_cursors.get(id).copied().unwrap_or((0, nelms));
        let data = tensor.data.slice(offset, nelms).ok_or_else(|| {
            Error::StepIo(format!(
                "Input {id} holds {} elements, too few for a batch of {info} at offset {offset}",
                tensor.data.len()
            ))
        })?;
        self.in_cursors.insert(id.to_string(), (offset, nelms));
        Ok(data)
    }

    fn input_complete(&mut self, id: &str) -> Result<()> {
        let len = self
            .inputs
            .get(id)
            .ok_or_else(|| missing(id, "inputs"))?
            .data
            .len();
        let cursor = self
            .in_cursors
            .get_mut(id)
            .ok_or_else(|| Error::StepIo(format!("inComplete called for {id} before in")))?;
        advance(&mut cursor.0, cursor.1, len);
        Ok(())
    }

    fn output(&mut self, id: &str, value: &TensorData) -> Result<()> {
        let buffer = self
            .outputs
            .get_mut(id)
            .ok_or_else(|| missing(id, "outputs"))?;
        let len = buffer.data.len();
        let cursor = self.out_cursors.entry(id.to_string()).or_insert(0);
        if !buffer.data.write_at(*cursor, value) {
            return Err(Error::StepIo(format!(
                "Output buffer for {id} holds {len} elements and cannot take {} more at offset {}",
                value.len(),
                *cursor
            )));
        }
        advance(cursor, value.len(), len);
        Ok(())
    }

    fn assert_num_elements(
        &self,
        inputs: &BTreeMap<TensorId, usize>,
        outputs: &BTreeMap<TensorId, usize>,
    ) -> Result<()> {
        for (id, &expected) in inputs {
            let tensor = self.inputs.get(id).ok_or_else(|| missing(id, "inputs"))?;
            if tensor.data.len() != expected {
                return Err(Error::StepIo(format!(
                    "Unexpected number of input elements for {id}. Expected {expected}, but received {}.",
                    tensor.data.len()
                )));
            }
        }
        for (id, &expected) in outputs {
            let buffer = self.outputs.get(id).ok_or_else(|| missing(id, "outputs"))?;
            if buffer.data.len() != expected {
                return Err(Error::StepIo(format!(
                    "Unexpected number of output elements for {id}. Expected {expected}, but received {}.",
                    buffer.data.len()
                )));
            }
        }
        Ok(())
    }
}

/// A stepio driven by user closures.
pub struct CallbackStepIo<I, O>
where
    I: FnMut(&str, &TensorInfo) -> anyhow::Result<TensorData>,
    O: FnMut(&str, &TensorData) -> anyhow::Result<()>,
{
    input: I,
    output: O,
}

impl<I, O> CallbackStepIo<I, O>
where
    I: FnMut(&str, &TensorInfo) -> anyhow::Result<TensorData>,
    O: FnMut(&str, &TensorData) -> anyhow::Result<()>,
{
    pub fn new(input: I, output: O) -> Self {
        Self { input, output }
    }
}

impl<I, O> StepIo for CallbackStepIo<I, O>
where
    I: FnMut(&str, &TensorInfo) -> anyhow::Result<TensorData>,
    O: FnMut(&str, &TensorData) -> anyhow::Result<()>,
{
    fn input(&mut self, id: &str, info: &TensorInfo) -> Result<TensorData> {
        let data = (self.input)(id, info).map_err(Error::Callback)?;
        if data.len() != info.nelms() || !data.matches_dtype(info.dtype) {
            return Err(Error::StepIo(format!(
                "Callback for {id} returned {} elements that do not fit {info}",
                data.len()
            )));
        }
        Ok(data)
    }

    fn input_complete(&mut self, _id: &str) -> Result<()> {
        Ok(())
    }

    fn output(&mut self, id: &str, value: &TensorData) -> Result<()> {
        (self.output)(id, value).map_err(Error::Callback)
    }
}

/// Host buffers for reading and writing named weights.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightsIo {
    weights: BTreeMap<TensorId, HostTensor>,
}

impl WeightsIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<TensorId>, buffer: HostTensor) -> &mut Self {
        self.weights.insert(id.into(), buffer);
        self
    }

    pub fn get(&self, id: &str) -> Option<&HostTensor> {
        self.weights.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.weights.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &TensorId> {
        self.weights.keys()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&TensorId, &HostTensor)> {
        self.weights.iter()
    }

    pub(crate) fn buffer_mut(&mut self, id: &str) -> Result<&mut HostTensor> {
        self.weights
            .get_mut(id)
            .ok_or_else(|| Error::StepIo(format!("No tensor {id} provided in WeightsIO's weights")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_cursor_wraps_per_batch() {
        let x = HostTensor::from_f32([2, 2], vec![1.0, 2.0, 3.0, 4.0]).expect("x");
        let mut anchors = Anchors::default();
        let mut io = ArrayStepIo::new([("x", &x)], &mut anchors);
        let info = TensorInfo::float([2]);
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(io.input("x", &info).expect("in").to_f32_vec());
            io.input_complete("x").expect("complete");
        }
        assert_eq!(seen, vec![vec![1.0, 2.0], vec![3.0, 4.0], vec![1.0, 2.0]]);
    }

    #[test]
    fn missing_input_is_named() {
        let mut anchors = Anchors::default();
        let mut io = ArrayStepIo::new(Vec::<(String, &HostTensor)>::new(), &mut anchors);
        let err = io
            .input("data", &TensorInfo::float([1]))
            .expect_err("missing");
        assert_eq!(err.to_string(), "No tensor data provided in StepIO's inputs");
    }
}
