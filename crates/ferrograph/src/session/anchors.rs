use std::collections::BTreeMap;

use crate::ir::TensorId;
use crate::tensor::HostTensor;

/// Host buffers for anchored tensors, as allocated by
/// [`Session::init_anchor_arrays`](super::Session::init_anchor_arrays).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Anchors {
    buffers: BTreeMap<TensorId, HostTensor>,
}

impl Anchors {
    pub(crate) fn new(buffers: BTreeMap<TensorId, HostTensor>) -> Self {
        Self { buffers }
    }

    pub fn get(&self, id: &str) -> Option<&HostTensor> {
        self.buffers.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut HostTensor> {
        self.buffers.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.buffers.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &TensorId> {
        self.buffers.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TensorId, &HostTensor)> {
        self.buffers.iter()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<TensorId, HostTensor> {
        self.buffers
    }
}
