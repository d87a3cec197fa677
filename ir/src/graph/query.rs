//! Read-only views over a node's edges: tensors, shapes, constant operands and the port invariant.

use itertools::Itertools;
use snafu::ensure;

use super::{Graph, NodeId};
use crate::error::{PortConflictSnafu, Result};
use crate::op::Op;
use crate::tensor::{Array, TensorMeta};

impl Graph {
    /// In-edge tensors in `dst_in_port` order.
    pub fn input_tensors(&self, id: NodeId) -> Vec<TensorMeta> {
        self.sorted_in_edges(id).into_iter().map(|e| e.attr.tensor).collect()
    }

    pub fn input_shapes(&self, id: NodeId) -> Vec<Option<Vec<usize>>> {
        self.sorted_in_edges(id).iter().map(|e| e.attr.tensor.shape()).collect()
    }

    /// One tensor per distinct `src_out_port`, in port order.
    pub fn output_tensors(&self, id: NodeId) -> Vec<TensorMeta> {
        let mut tensors = Vec::new();
        let mut last_port = None;
        for edge in self.sorted_out_edges(id) {
            if last_port != Some(edge.attr.src_out_port) {
                last_port = Some(edge.attr.src_out_port);
                tensors.push(edge.attr.tensor);
            }
        }
        tensors
    }

    pub fn output_shapes(&self, id: NodeId) -> Vec<Option<Vec<usize>>> {
        self.output_tensors(id).iter().map(TensorMeta::shape).collect()
    }

    /// Distinct `src_out_port`s in ascending order.
    pub fn out_ports(&self, id: NodeId) -> Vec<usize> {
        self.sorted_out_edges(id).iter().map(|e| e.attr.src_out_port).dedup().collect()
    }

    /// Value produced by a constant-like node.
    pub fn const_value(&self, id: NodeId) -> Option<&Array> {
        match self.op(id)? {
            Op::Constant(c) => Some(&c.value),
            Op::IrConstant(c) => Some(&c.weights),
            _ => None,
        }
    }

    /// Constant operand on `port`, from a constant producer or a constant edge tensor.
    pub fn in_const(&self, id: NodeId, port: usize) -> Option<Array> {
        let edge = self.sorted_in_edges(id).into_iter().find(|e| e.attr.dst_in_port == port)?;
        if let Some(value) = self.const_value(edge.src) {
            return Some(value.clone());
        }
        match edge.attr.tensor {
            TensorMeta { is_const: true, value: Some(value), .. } => Some(value),
            _ => None,
        }
    }

    /// `(producer, dst_in_port, value)` for every in-edge fed by a constant-like node.
    pub fn sorted_in_consts(&self, id: NodeId) -> Vec<(NodeId, usize, Array)> {
        self.sorted_in_edges(id)
            .into_iter()
            .filter_map(|e| self.const_value(e.src).map(|v| (e.src, e.attr.dst_in_port, v.clone())))
            .collect()
    }

    /// No two in-edges share a `dst_in_port` unless the operator is variadic.
    pub fn check_ports(&self, id: NodeId) -> Result<()> {
        if self.op_type(id).is_some_and(|t| t.is_variadic()) {
            return Ok(());
        }
        for (a, b) in self.sorted_in_edges(id).iter().tuple_windows() {
            ensure!(
                a.attr.dst_in_port != b.attr.dst_in_port,
                PortConflictSnafu { node: self.name(id), port: b.attr.dst_in_port }
            );
        }
        Ok(())
    }
}
