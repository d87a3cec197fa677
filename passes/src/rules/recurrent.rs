//! Recurrent cell decomposition.
//!
//! Source GRU/LSTM nodes carry their parameters on constant in-ports and use the ONNX tensor layouts
//! (`[T, B, I]` with `layout = 0`, `[B, T, I]` with `layout = 1`). Target cells are batch-major and
//! unidirectional: `X: [B, T, I]`, initial states `[B, H]`, outputs `Y: [B, T, H]` and final states `[B, H]`.
//! Reshapes and transposes around the cell restore the source output layouts, so consumers keep reading the
//! tensors they were built for.

use graft_dtype::DType;
use graft_ir::op::{self, Op};
use graft_ir::tensor::{Array, TensorMeta};
use graft_ir::{EdgeRef, Graph, NodeId, OpFilter, single_node_matcher};
use ndarray::{Axis, IxDyn, concatenate};

use crate::common::{add_constant, connect, dims_i64, drop_in_ports, fresh_name, shaped};
use crate::error::{Attempt, Result, Skip};
use crate::rewrite::{apply_matches, require_const, require_in_edge, require_op, unsupported};

const SEQUENCE_LENS_PORT: usize = 4;
const INITIAL_STATE_PORT: usize = 5;
const PEEPHOLE_PORT: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellKind {
    Gru,
    Lstm,
}

impl CellKind {
    fn gates(self) -> usize {
        match self {
            Self::Gru => 3,
            Self::Lstm => 4,
        }
    }

    /// Hidden state, plus the cell state for LSTM.
    fn states(self) -> usize {
        match self {
            Self::Gru => 1,
            Self::Lstm => 2,
        }
    }
}

/// Validated view of a source recurrent node. Built before any mutation.
struct Cell {
    kind: CellKind,
    layout: i64,
    batch: usize,
    time_steps: usize,
    input_size: usize,
    hidden_size: usize,
    activations: Vec<String>,
    linear_before_reset: bool,
    /// `[W | R]` per direction, forward first.
    weights: Vec<Array>,
    biases: Vec<Array>,
    data: EdgeRef,
    initial_states: Vec<Option<EdgeRef>>,
    /// Consumers of each used out-port.
    consumers: Vec<(usize, Vec<EdgeRef>)>,
}

impl Cell {
    fn target_op(&self, direction: usize, name: &str) -> Op {
        let (weights, biases) = (self.weights[direction].clone(), self.biases[direction].clone());
        match self.kind {
            CellKind::Gru => op::IrGru {
                time_steps: self.time_steps,
                input_size: self.input_size,
                hidden_size: self.hidden_size,
                direction: name.to_string(),
                activations: self.activations.clone(),
                linear_before_reset: self.linear_before_reset,
                weights,
                biases,
                weights_offset: None,
                biases_offset: None,
            }
            .into(),
            CellKind::Lstm => op::IrLstm {
                time_steps: self.time_steps,
                input_size: self.input_size,
                hidden_size: self.hidden_size,
                direction: name.to_string(),
                activations: self.activations.clone(),
                weights,
                biases,
                weights_offset: None,
                biases_offset: None,
            }
            .into(),
        }
    }

    fn state_shape(&self) -> Vec<usize> {
        vec![self.batch, self.hidden_size]
    }

    fn sequence_shape(&self) -> Vec<usize> {
        vec![self.batch, self.time_steps, self.hidden_size]
    }
}

fn inspect(graph: &Graph, node: NodeId, directions: usize) -> std::result::Result<Cell, Skip> {
    let (kind, hidden_size, layout, activations, linear_before_reset) = match require_op(graph, node)? {
        Op::Gru(g) => (CellKind::Gru, g.hidden_size, g.layout, g.activations.clone(), g.linear_before_reset),
        Op::Lstm(l) => (CellKind::Lstm, l.hidden_size, l.layout, l.activations.clone(), false),
        other => return Err(unsupported(node, format!("{} is not a recurrent cell", other.op_type()))),
    };
    let data = require_in_edge(graph, node, 0)?;
    let shape = data.tensor().shape().ok_or(Skip::MissingShape { node })?;
    let [d0, d1, input_size] = shape[..] else {
        return Err(unsupported(node, format!("expected a rank-3 input, got {shape:?}")));
    };
    let (time_steps, batch) = if layout == 0 { (d0, d1) } else { (d1, d0) };

    if require_in_edge(graph, node, SEQUENCE_LENS_PORT).is_ok() {
        let lens = require_const(graph, node, SEQUENCE_LENS_PORT)?;
        if lens.iter().any(|&l| l as usize != time_steps) {
            return Err(unsupported(node, "sequence lengths differ from the time steps"));
        }
    }
    if kind == CellKind::Lstm && require_in_edge(graph, node, PEEPHOLE_PORT).is_ok() {
        return Err(unsupported(node, "peepholes are not supported"));
    }

    let gated = kind.gates() * hidden_size;
    let w = require_const(graph, node, 1)?;
    let r = require_const(graph, node, 2)?;
    if w.shape() != [directions, gated, input_size] || r.shape() != [directions, gated, hidden_size] {
        return Err(unsupported(node, format!("unexpected parameter shapes {:?} and {:?}", w.shape(), r.shape())));
    }
    let b = match require_in_edge(graph, node, 3) {
        Ok(_) => Some(require_const(graph, node, 3)?),
        Err(_) => None,
    };
    if b.as_ref().is_some_and(|b| b.shape() != [directions, 2 * gated]) {
        return Err(unsupported(node, "unexpected bias shape"));
    }

    let mut weights = Vec::with_capacity(directions);
    let mut biases = Vec::with_capacity(directions);
    for d in 0..directions {
        let (wd, rd) = (w.index_axis(Axis(0), d), r.index_axis(Axis(0), d));
        weights.push(concatenate(Axis(1), &[wd, rd]).map_err(|e| unsupported(node, e.to_string()))?);
        biases.push(match &b {
            Some(b) => b.index_axis(Axis(0), d).to_owned(),
            None => Array::zeros(IxDyn(&[2 * gated])),
        });
    }

    let initial_states: Vec<Option<EdgeRef>> =
        (0..kind.states()).map(|s| require_in_edge(graph, node, INITIAL_STATE_PORT + s).ok()).collect();
    let edges = graph.sorted_out_edges(node);
    let consumers: Vec<(usize, Vec<EdgeRef>)> = graph
        .out_ports(node)
        .into_iter()
        .map(|port| (port, edges.iter().filter(|e| e.src_out_port() == port).cloned().collect()))
        .collect();
    Ok(Cell {
        kind,
        layout,
        batch,
        time_steps,
        input_size,
        hidden_size,
        activations,
        linear_before_reset,
        weights,
        biases,
        data,
        initial_states,
        consumers,
    })
}

/// Producer port together with the tensor it emits.
#[derive(Debug, Clone)]
struct Port {
    node: NodeId,
    port: usize,
    tensor: TensorMeta,
}

impl Port {
    fn of(node: NodeId, port: usize, shape: Vec<usize>) -> Self {
        Self { node, port, tensor: shaped(shape) }
    }

    fn from_edge(edge: &EdgeRef) -> Self {
        Self { node: edge.src, port: edge.src_out_port(), tensor: edge.tensor().clone() }
    }
}

/// Add a node after `inputs` (bound to in-ports `0..`) producing `shape` on out-port 0.
fn emit(
    graph: &mut Graph,
    base: NodeId,
    suffix: &str,
    op: impl Into<Op>,
    inputs: &[&Port],
    shape: Vec<usize>,
) -> Result<Port> {
    let node = graph.add_op_node(fresh_name(graph, base, suffix), op);
    for (dst_in_port, input) in inputs.iter().enumerate() {
        connect(graph, input.node, input.port, node, dst_in_port, input.tensor.clone())?;
    }
    Ok(Port::of(node, 0, shape))
}

fn reshape(graph: &mut Graph, base: NodeId, suffix: &str, input: &Port, shape: Vec<usize>) -> Result<Port> {
    emit(graph, base, suffix, op::IrReshape { dim: dims_i64(&shape) }, &[input], shape)
}

fn transpose(graph: &mut Graph, base: NodeId, suffix: &str, input: &Port, perm: &[usize]) -> Result<Port> {
    let shape = input.tensor.shape().unwrap_or_default();
    let out = if shape.len() == perm.len() { graft_ir::tensor::permute_vec(&shape, perm) } else { shape };
    emit(graph, base, suffix, op::IrTranspose { perm: perm.to_vec() }, &[input], out)
}

fn zeros(graph: &mut Graph, base: NodeId, suffix: &str, shape: Vec<usize>) -> Port {
    let node = add_constant(graph, base, suffix, Array::zeros(IxDyn(&shape)));
    Port { node, port: 0, tensor: TensorMeta::constant(Array::zeros(IxDyn(&shape)), DType::Float32) }
}

/// Every consumer in `edges` reads from `to` instead, keeping its in-port and tensor.
fn rehome(graph: &mut Graph, edges: &[EdgeRef], to: &Port) -> Result<()> {
    for edge in edges {
        graph.remove_edge(edge.src, edge.dst, Some(edge.key));
        graph.add_edge(to.node, edge.dst, edge.attr.with_ports(to.port, edge.dst_in_port()))?;
    }
    Ok(())
}

/// Batch-major view of the sequence input.
fn batch_major_input(graph: &mut Graph, node: NodeId, cell: &Cell) -> Result<Port> {
    let input = Port::from_edge(&cell.data);
    if cell.layout == 0 { transpose(graph, node, "input_transpose", &input, &[1, 0, 2]) } else { Ok(input) }
}

/// Restore the source layout of a `[B, T, D, H]` sequence output.
fn sequence_out(graph: &mut Graph, node: NodeId, cell: &Cell, seq: &Port) -> Result<Port> {
    if cell.layout == 0 { transpose(graph, node, "y_transpose", seq, &[1, 2, 0, 3]) } else { Ok(seq.clone()) }
}

/// Restore the source layout of a `[B, D, H]` state output.
fn state_out(graph: &mut Graph, node: NodeId, cell: &Cell, state: &Port, suffix: &str) -> Result<Port> {
    if cell.layout == 0 { transpose(graph, node, suffix, state, &[1, 0, 2]) } else { Ok(state.clone()) }
}

fn finish(graph: &mut Graph, node: NodeId, cell: &Cell, finals: &[(usize, Port)]) -> Result<()> {
    for (port, consumers) in &cell.consumers {
        if let Some((_, to)) = finals.iter().find(|(p, _)| p == port) {
            rehome(graph, consumers, to)?;
        }
    }
    let mut outputs: Vec<NodeId> = Vec::with_capacity(finals.len());
    for (_, to) in finals {
        if !outputs.contains(&to.node) {
            outputs.push(to.node);
        }
    }
    if !outputs.is_empty() {
        graph.replace_output_with_many(node, &outputs)?;
    }
    Ok(())
}

fn used_ports(cell: &Cell) -> Vec<usize> {
    let ports: Vec<usize> = cell.consumers.iter().map(|(p, _)| *p).collect();
    if ports.is_empty() { vec![0] } else { ports }
}

fn direction_of(op: &Op) -> Option<&str> {
    match op {
        Op::Gru(g) => Some(&g.direction),
        Op::Lstm(l) => Some(&l.direction),
        _ => None,
    }
}

fn is_bidirectional(op: &Op) -> bool {
    direction_of(op).is_some_and(|d| d.eq_ignore_ascii_case("bidirectional"))
}

fn convert_uni(graph: &mut Graph, node: NodeId) -> Attempt {
    let direction = direction_of(require_op(graph, node)?).unwrap_or_default().to_lowercase();
    let cell = inspect(graph, node, 1)?;

    drop_in_ports(graph, node, |_| true);
    let input = batch_major_input(graph, node, &cell)?;
    connect(graph, input.node, input.port, node, 0, input.tensor.clone())?;
    for (s, state) in cell.initial_states.iter().enumerate() {
        let state = match state {
            Some(edge) => reshape(graph, node, "state_reshape", &Port::from_edge(edge), cell.state_shape())?,
            None => zeros(graph, node, "initial_state", cell.state_shape()),
        };
        connect(graph, state.node, state.port, node, 1 + s, state.tensor.clone())?;
    }

    let (b, t, h) = (cell.batch, cell.time_steps, cell.hidden_size);
    let mut finals = Vec::new();
    for port in used_ports(&cell) {
        let last = if port == 0 {
            let y = reshape(graph, node, "y_reshape", &Port::of(node, 0, cell.sequence_shape()), vec![b, t, 1, h])?;
            sequence_out(graph, node, &cell, &y)?
        } else {
            let state = Port::of(node, port, cell.state_shape());
            let state = reshape(graph, node, "state_out_reshape", &state, vec![b, 1, h])?;
            state_out(graph, node, &cell, &state, "state_out_transpose")?
        };
        finals.push((port, last));
    }
    finish(graph, node, &cell, &finals)?;
    let direction = if direction.is_empty() { "forward" } else { direction.as_str() };
    graph.set_op(node, cell.target_op(0, direction));
    Ok(())
}

fn convert_bi(graph: &mut Graph, node: NodeId) -> Attempt {
    let cell = inspect(graph, node, 2)?;
    let (b, t, h) = (cell.batch, cell.time_steps, cell.hidden_size);

    let input = batch_major_input(graph, node, &cell)?;
    let mut fw_states = Vec::new();
    let mut bw_states = Vec::new();
    for state in &cell.initial_states {
        match state {
            Some(edge) => {
                let batch_major = state_out(graph, node, &cell, &Port::from_edge(edge), "state_transpose")?;
                let split = emit(
                    graph,
                    node,
                    "state_split",
                    op::IrSplit { axis: 1, split: vec![1, 1] },
                    &[&batch_major],
                    vec![b, 1, h],
                )?;
                let bw_half = Port::of(split.node, 1, vec![b, 1, h]);
                fw_states.push(reshape(graph, node, "state_reshape_fw", &split, cell.state_shape())?);
                bw_states.push(reshape(graph, node, "state_reshape_bw", &bw_half, cell.state_shape())?);
            }
            None => {
                fw_states.push(zeros(graph, node, "initial_state_fw", cell.state_shape()));
                bw_states.push(zeros(graph, node, "initial_state_bw", cell.state_shape()));
            }
        }
    }

    let fw_inputs: Vec<&Port> = std::iter::once(&input).chain(&fw_states).collect();
    let fw = emit(graph, node, "fw", cell.target_op(0, "forward"), &fw_inputs, cell.sequence_shape())?;
    let reverse = op::IrReverseSequence { batch_axis: 0, time_axis: 1 };
    let reversed = emit(graph, node, "bw_reverse1", reverse.clone(), &[&input], vec![b, t, cell.input_size])?;
    let bw_inputs: Vec<&Port> = std::iter::once(&reversed).chain(&bw_states).collect();
    let bw = emit(graph, node, "bw", cell.target_op(1, "forward"), &bw_inputs, cell.sequence_shape())?;
    let bw_seq = emit(graph, node, "bw_reverse2", reverse, &[&bw], cell.sequence_shape())?;

    let fw_y = reshape(graph, node, "fw_reshape", &fw, vec![b, t, 1, h])?;
    let bw_y = reshape(graph, node, "bw_reshape", &bw_seq, vec![b, t, 1, h])?;
    let seq = emit(graph, node, "seq_concat", op::IrConcat { axis: 2 }, &[&fw_y, &bw_y], vec![b, t, 2, h])?;

    let mut finals = Vec::new();
    for port in used_ports(&cell) {
        let last = match port {
            0 => sequence_out(graph, node, &cell, &seq)?,
            1 => {
                let last_step = op::IrSlice {
                    starts: vec![0, t as i64 - 1, 0, 0],
                    ends: dims_i64(&[b, t, 1, h]),
                    steps: Vec::new(),
                };
                let first_step =
                    op::IrSlice { starts: vec![0, 0, 1, 0], ends: dims_i64(&[b, 1, 2, h]), steps: Vec::new() };
                let fw_h = emit(graph, node, "fw_state_slice", last_step, &[&seq], vec![b, 1, 1, h])?;
                let bw_h = emit(graph, node, "bw_state_slice", first_step, &[&seq], vec![b, 1, 1, h])?;
                let concat = op::IrConcat { axis: 2 };
                let both = emit(graph, node, "state_concat", concat, &[&fw_h, &bw_h], vec![b, 1, 2, h])?;
                let both = reshape(graph, node, "state_reshape", &both, vec![b, 2, h])?;
                state_out(graph, node, &cell, &both, "state_out_transpose")?
            }
            _ => {
                let (fw_c, bw_c) = (Port::of(fw.node, 2, cell.state_shape()), Port::of(bw.node, 2, cell.state_shape()));
                let fw_c = reshape(graph, node, "fw_cell_reshape", &fw_c, vec![b, 1, h])?;
                let bw_c = reshape(graph, node, "bw_cell_reshape", &bw_c, vec![b, 1, h])?;
                let concat = op::IrConcat { axis: 1 };
                let both = emit(graph, node, "cell_concat", concat, &[&fw_c, &bw_c], vec![b, 2, h])?;
                state_out(graph, node, &cell, &both, "cell_out_transpose")?
            }
        };
        finals.push((port, last));
    }
    finish(graph, node, &cell, &finals)?;
    graph.remove_node(node);
    Ok(())
}

/// Unidirectional GRU becomes `IrGru` with per-direction parameters squeezed and `[W | R]` concatenated.
#[tracing::instrument(skip_all)]
pub fn convert_uni_gru(graph: &mut Graph) -> Result<bool> {
    let filter = OpFilter::Where(|op| matches!(op, Op::Gru(_)) && !is_bidirectional(op));
    let matches = single_node_matcher(graph, filter);
    apply_matches(graph, "convert_uni_gru", matches, |graph, m| convert_uni(graph, m["target"]))
}

#[tracing::instrument(skip_all)]
pub fn convert_uni_lstm(graph: &mut Graph) -> Result<bool> {
    let filter = OpFilter::Where(|op| matches!(op, Op::Lstm(_)) && !is_bidirectional(op));
    let matches = single_node_matcher(graph, filter);
    apply_matches(graph, "convert_uni_lstm", matches, |graph, m| convert_uni(graph, m["target"]))
}

/// Bidirectional GRU is split into a forward cell and a backward cell wrapped in sequence reversals.
///
/// The per-direction sequences are concatenated on a new direction axis; the final hidden state is sliced back
/// out of that concatenation (last step forward, first step backward).
#[tracing::instrument(skip_all)]
pub fn convert_bi_gru(graph: &mut Graph) -> Result<bool> {
    let filter = OpFilter::Where(|op| matches!(op, Op::Gru(_)) && is_bidirectional(op));
    let matches = single_node_matcher(graph, filter);
    apply_matches(graph, "convert_bi_gru", matches, |graph, m| convert_bi(graph, m["target"]))
}

#[tracing::instrument(skip_all)]
pub fn convert_bi_lstm(graph: &mut Graph) -> Result<bool> {
    let filter = OpFilter::Where(|op| matches!(op, Op::Lstm(_)) && is_bidirectional(op));
    let matches = single_node_matcher(graph, filter);
    apply_matches(graph, "convert_bi_lstm", matches, |graph, m| convert_bi(graph, m["target"]))
}
