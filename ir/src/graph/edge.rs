use crate::tensor::TensorMeta;

use super::NodeId;

/// Port indices plus the tensor flowing on one edge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdgeAttr {
    pub src_out_port: usize,
    pub dst_in_port: usize,
    pub tensor: TensorMeta,
}

impl EdgeAttr {
    pub fn new(src_out_port: usize, dst_in_port: usize) -> Self {
        Self { src_out_port, dst_in_port, tensor: TensorMeta::default() }
    }

    pub fn with_tensor(mut self, tensor: TensorMeta) -> Self {
        self.tensor = tensor;
        self
    }

    /// Same tensor, different ports.
    pub fn with_ports(&self, src_out_port: usize, dst_in_port: usize) -> Self {
        Self { src_out_port, dst_in_port, tensor: self.tensor.clone() }
    }
}

/// Owned snapshot of one edge `(src, dst, key, attr)`.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeRef {
    pub src: NodeId,
    pub dst: NodeId,
    pub key: u32,
    pub attr: EdgeAttr,
}

impl EdgeRef {
    pub fn src_out_port(&self) -> usize {
        self.attr.src_out_port
    }

    pub fn dst_in_port(&self) -> usize {
        self.attr.dst_in_port
    }

    pub fn tensor(&self) -> &TensorMeta {
        &self.attr.tensor
    }

    /// `(src, dst, Some(key))`, the form accepted by `remove_edges_from`.
    pub fn triple(&self) -> (NodeId, NodeId, Option<u32>) {
        (self.src, self.dst, Some(self.key))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Edge {
    pub(crate) src: NodeId,
    pub(crate) dst: NodeId,
    pub(crate) key: u32,
    pub(crate) attr: EdgeAttr,
}

impl Edge {
    pub(crate) fn snapshot(&self) -> EdgeRef {
        EdgeRef { src: self.src, dst: self.dst, key: self.key, attr: self.attr.clone() }
    }
}
