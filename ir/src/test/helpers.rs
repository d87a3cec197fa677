//! Small graph builders shared by the unit tests of this crate and of the pass library.

use graft_dtype::DType;
use ndarray::IxDyn;

use crate::graph::{EdgeAttr, Framework, Graph, NodeId};
use crate::op::{self, Op};
use crate::tensor::{Array, TensorMeta};

pub fn graph() -> Graph {
    Graph::new("test", Framework::Onnx)
}

pub fn array(shape: &[usize], values: Vec<f64>) -> Array {
    Array::from_shape_vec(IxDyn(shape), values).expect("values must fill the shape")
}

pub fn scalar(value: f64) -> Array {
    Array::from_elem(IxDyn(&[]), value)
}

pub fn vector(values: &[f64]) -> Array {
    array(&[values.len()], values.to_vec())
}

pub fn node(graph: &mut Graph, name: &str, op: impl Into<Op>) -> NodeId {
    graph.add_op_node(name, op)
}

/// `Input` node with a known shape.
pub fn input(graph: &mut Graph, name: &str, shape: &[usize]) -> NodeId {
    graph.add_op_node(name, op::Input { shape: Some(shape.to_vec()), dtype: Some(DType::Float32) })
}

pub fn constant(graph: &mut Graph, name: &str, value: Array) -> NodeId {
    graph.add_op_node(name, op::Constant { value, dtype: DType::Float32 })
}

pub fn link(graph: &mut Graph, src: NodeId, dst: NodeId, src_out_port: usize, dst_in_port: usize) -> u32 {
    graph.add_edge(src, dst, EdgeAttr::new(src_out_port, dst_in_port)).expect("endpoints exist")
}

/// Edge whose tensor has a known float32 shape.
pub fn link_shaped(
    graph: &mut Graph,
    src: NodeId,
    dst: NodeId,
    src_out_port: usize,
    dst_in_port: usize,
    shape: &[usize],
) -> u32 {
    let tensor = TensorMeta::new().with_shape(shape.to_vec()).with_dtype(DType::Float32);
    graph.add_edge(src, dst, EdgeAttr::new(src_out_port, dst_in_port).with_tensor(tensor)).expect("endpoints exist")
}

/// Constant node feeding `dst` on `dst_in_port`, with the value mirrored on the edge tensor.
pub fn const_operand(graph: &mut Graph, name: &str, dst: NodeId, dst_in_port: usize, value: Array) -> NodeId {
    let src = constant(graph, name, value.clone());
    let tensor = TensorMeta::constant(value, DType::Float32);
    graph.add_edge(src, dst, EdgeAttr::new(0, dst_in_port).with_tensor(tensor)).expect("endpoints exist");
    src
}

/// `Out` sink fed by `src`, with `src` registered as a model output.
pub fn output(graph: &mut Graph, src: NodeId, shape: &[usize]) -> NodeId {
    let name = graph.get_valid_node_name(&format!("{}_out", graph.name(src)));
    let out = graph.add_op_node(name, op::Out {});
    link_shaped(graph, src, out, 0, 0, shape);
    let mut outputs = graph.output_names().to_vec();
    outputs.push(src);
    graph.set_output_names(outputs).expect("output is live");
    out
}

pub fn op_type_of(graph: &Graph, name: &str) -> Option<crate::op::OpType> {
    graph.id(name).and_then(|id| graph.op_type(id))
}

pub fn assert_ports_unique(graph: &Graph) {
    for node in graph.nodes() {
        if let Err(err) = graph.check_ports(node) {
            panic!("{err}\n{}", graph.tree(node));
        }
    }
}

pub fn assert_outputs_live(graph: &Graph) {
    graph.validate_outputs().expect("every output refers to a live node");
}
