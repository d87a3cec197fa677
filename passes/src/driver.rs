//! Pass driver.
//!
//! Runs the rewrite library over one graph in a fixed order. The front phase folds constant operands and
//! quantized patterns before the source kinds are lowered. The back phase fuses, renames and legalizes, with
//! a bounded cleanup loop that sinks transposes through layout-unaware operators for frameworks whose models
//! arrive with explicit layout conversions.

use graft_ir::{Framework, Graph, OpType, ShapeInference};

use crate::config::{DriverConfig, PassOptions};
use crate::error::{Error, Result};
use crate::plugin::PluginRegistry;
use crate::rules::{activation, broadcast, detection, fusion, layout, legalize, quantize, recurrent, rename, space};

type Pass = fn(&mut Graph) -> Result<bool>;

/// Which passes rewrote something, in run order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PassReport {
    /// One entry per pass run that applied at least one match.
    pub applied: Vec<&'static str>,
    /// Layout cleanup iterations executed, including recovered ones.
    pub layout_iterations: usize,
    /// Layout iterations that failed and were resumed after shape inference.
    pub recovered: usize,
}

impl PassReport {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, pass: &'static str, applied: bool) -> bool {
        if applied {
            self.applied.push(pass);
        }
        applied
    }

    /// Whether `pass` applied at least once.
    pub fn contains(&self, pass: &str) -> bool {
        self.applied.iter().any(|&p| p == pass)
    }

    pub fn count(&self, pass: &str) -> usize {
        self.applied.iter().filter(|&&p| p == pass).count()
    }

    fn merge(&mut self, other: PassReport) {
        self.applied.extend(other.applied);
        self.layout_iterations += other.layout_iterations;
        self.recovered += other.recovered;
    }
}

fn run_all(graph: &mut Graph, report: &mut PassReport, passes: &[(&'static str, Pass)]) -> Result<bool> {
    let mut changed = false;
    for &(name, pass) in passes {
        changed |= report.record(name, pass(graph)?);
    }
    Ok(changed)
}

// ============================================================================
// FRONT PHASE
// ============================================================================

const FRONT: &[(&str, Pass)] = &[
    ("fuse_weights_const", quantize::fuse_weights_const),
    ("convert_special_prelu", quantize::convert_special_prelu),
    ("merge_sequence_construct_and_at", quantize::merge_sequence_construct_and_at),
    ("merge_q_unary", quantize::merge_q_unary),
];

/// Fold constant operands into attributes and collapse quantized patterns, before any lowering.
#[tracing::instrument(skip_all, fields(graph = %graph.name, model = options.model_name_or(&graph.name)))]
pub fn front_passes(graph: &mut Graph, options: &PassOptions) -> Result<PassReport> {
    let mut report = PassReport::new();
    run_all(graph, &mut report, FRONT)?;
    tracing::debug!(applied = report.applied.len(), "front phase done");
    Ok(report)
}

// ============================================================================
// BACK PHASE
// ============================================================================

const ARITHMETIC: &[(&str, Pass)] = &[
    ("remove_identity", fusion::remove_identity),
    ("merge_squared_diff", fusion::merge_squared_diff),
    ("merge_square", fusion::merge_square),
    ("merge_square2", fusion::merge_square2),
    ("multidirectional_broadcasting", broadcast::multidirectional_broadcasting),
];

const RECURRENT: &[(&str, Pass)] = &[
    ("convert_uni_gru", recurrent::convert_uni_gru),
    ("convert_bi_gru", recurrent::convert_bi_gru),
    ("convert_uni_lstm", recurrent::convert_uni_lstm),
    ("convert_bi_lstm", recurrent::convert_bi_lstm),
];

const STRUCTURAL: &[(&str, Pass)] = &[
    ("merge_b2s", space::merge_b2s),
    ("merge_s2b", space::merge_s2b),
    ("merge_rsqrt", fusion::merge_rsqrt),
    ("merge_not_equal", fusion::merge_not_equal),
    ("merge_greater_less_equal_or", fusion::merge_greater_less_equal_or),
    ("split_crd_d2s", space::split_crd_d2s),
    ("split_expand", broadcast::split_expand),
];

const RENAMES: &[(&str, Pass)] = &[
    ("rename_argminmax", rename::rename_argminmax),
    ("rename_bitwise", rename::rename_bitwise),
    ("rename_bn", rename::rename_bn),
    ("rename_cast", rename::rename_cast),
    ("rename_conv", rename::rename_conv),
    ("rename_logical", rename::rename_logical),
    ("rename_mul_add_max_min", rename::rename_mul_add_max_min),
    ("rename_pool", rename::rename_pool),
    ("rename_reduce", rename::rename_reduce),
    ("rename_reshape", rename::rename_reshape),
    ("rename_slice", rename::rename_slice),
    ("rename_softmax", rename::rename_softmax),
    ("rename_split", rename::rename_split),
    ("rename_tile", rename::rename_tile),
    ("simple_rename", rename::simple_rename),
];

// Relu fusion reads the source kinds, so it runs before activations are renamed.
const ACTIVATIONS: &[(&str, Pass)] = &[
    ("fuse_relu", activation::fuse_relu),
    ("rename_activations", rename::rename_activations),
    ("fuse_clip", activation::fuse_clip),
];

fn remove_useless_reshape_transpose(graph: &mut Graph) -> Result<bool> {
    layout::remove_useless_op(graph, &[OpType::IrReshape, OpType::IrTranspose])
}

fn remove_useless_transpose(graph: &mut Graph) -> Result<bool> {
    layout::remove_useless_op(graph, &[OpType::IrTranspose])
}

const LAYOUT_PRELUDE: &[(&str, Pass)] = &[
    ("remove_redundant_reshape", layout::remove_redundant_reshape),
    ("remove_redundant_transpose", layout::remove_redundant_transpose),
    ("remove_useless_op", remove_useless_reshape_transpose),
    ("fuse_const", legalize::fuse_const),
    ("remove_const", legalize::remove_const),
];

const LAYOUT_SINKS: &[(&str, Pass)] = &[
    ("sink_transpose_through_split", layout::sink_transpose_through_split),
    ("sink_transpose_through_concat", layout::sink_transpose_through_concat),
    ("sink_transpose_through_special_reshape", layout::sink_transpose_through_special_reshape),
    ("sink_transpose_through_tile", layout::sink_transpose_through_tile),
    ("sink_single_transpose", layout::sink_single_transpose),
    ("sink_double_transpose", layout::sink_double_transpose),
    ("sink_transpose_with_const", layout::sink_transpose_with_const),
];

const LAYOUT_CLEANUPS: &[(&str, Pass)] = &[
    ("remove_redundant_transpose_pro", layout::remove_redundant_transpose_pro),
    ("remove_redundant_transpose", layout::remove_redundant_transpose),
    ("remove_useless_op", remove_useless_transpose),
];

const LEGALIZE: &[(&str, Pass)] = &[
    ("insert_cast_if_must", legalize::insert_cast_if_must),
    ("remove_redundant_cast", legalize::remove_redundant_cast),
];

fn uses_layout_loop(framework: Framework) -> bool {
    matches!(framework, Framework::Onnx | Framework::Caffe)
}

/// One sweep of the layout loop. Failures are tagged with the pass that raised them.
fn layout_iteration(graph: &mut Graph, report: &mut PassReport) -> Result<bool> {
    let mut changed = false;
    let mut step = |graph: &mut Graph, name: &'static str, pass: Pass| -> Result<()> {
        let applied = pass(graph).map_err(|e| e.in_layout_pass(name))?;
        changed |= report.record(name, applied);
        Ok(())
    };
    step(graph, "remove_redundant_reshape", layout::remove_redundant_reshape)?;
    for &(sink_name, sink) in LAYOUT_SINKS {
        step(graph, sink_name, sink)?;
        for &(name, cleanup) in LAYOUT_CLEANUPS {
            step(graph, name, cleanup)?;
        }
    }
    Ok(changed)
}

/// Bounded transpose-sinking loop.
///
/// Runs at most [`DriverConfig::layout_iterations_for`] sweeps and stops early once a sweep changes nothing.
/// A recoverable failure re-runs shape inference and moves on to the next sweep unless strict handling is
/// requested; any other failure is returned.
#[tracing::instrument(skip_all, fields(graph = %graph.name, nodes = graph.len()))]
pub fn layout_loop(
    graph: &mut Graph,
    config: &DriverConfig,
    infer: &dyn ShapeInference,
    report: &mut PassReport,
) -> Result<()> {
    let iterations = config.layout_iterations_for(graph.len());
    for iteration in 0..iterations {
        report.layout_iterations += 1;
        match layout_iteration(graph, report) {
            Ok(false) => {
                tracing::debug!(iteration, "layout fixpoint reached");
                break;
            }
            Ok(true) => {}
            Err(error @ Error::Recoverable { .. }) if !config.strict_layout => {
                tracing::warn!(iteration, %error, "layout sweep failed, re-running shape inference");
                report.recovered += 1;
                infer.infer(graph)?;
            }
            Err(error) => return Err(error),
        }
    }
    Ok(())
}

/// Lower, fuse and legalize the graph for the target.
#[tracing::instrument(skip_all, fields(graph = %graph.name, framework = ?graph.framework))]
pub fn back_passes(
    graph: &mut Graph,
    options: &PassOptions,
    config: &DriverConfig,
    infer: &dyn ShapeInference,
    plugins: &PluginRegistry,
) -> Result<PassReport> {
    let mut report = PassReport::new();

    // =========================================================================
    // Stage 1: source-level fusions, while the source kinds are still visible
    // =========================================================================
    run_all(graph, &mut report, ARITHMETIC)?;
    run_all(graph, &mut report, RECURRENT)?;
    run_all(graph, &mut report, STRUCTURAL)?;

    // =========================================================================
    // Stage 2: lowering to target kinds
    // =========================================================================
    run_all(graph, &mut report, RENAMES)?;
    run_all(graph, &mut report, ACTIVATIONS)?;
    let grouped = fusion::merge_group_conv(graph, config.max_groups)?;
    report.record("merge_group_conv", grouped);
    let head = detection::detection_post_process(graph, options)?;
    report.record("detection_post_process", head);
    let pooled = space::merge_s2b_pool_b2s(graph)?;
    report.record("merge_s2b_pool_b2s", pooled);

    // =========================================================================
    // Stage 3: layout cleanup
    // =========================================================================
    run_all(graph, &mut report, LAYOUT_PRELUDE)?;
    if uses_layout_loop(graph.framework) {
        layout_loop(graph, config, infer, &mut report)?;
    }

    // =========================================================================
    // Stage 4: legalization and weight layout
    // =========================================================================
    run_all(graph, &mut report, LEGALIZE)?;
    let preprocess = legalize::insert_preprocess(graph, plugins)?;
    report.record("insert_preprocess", preprocess);
    let trimmed = legalize::trim_weights(graph)?;
    report.record("trim_weights", trimmed);

    tracing::debug!(
        applied = report.applied.len(),
        layout_iterations = report.layout_iterations,
        recovered = report.recovered,
        nodes = graph.len(),
        "back phase done"
    );
    Ok(report)
}

/// Front phase, then back phase.
pub fn run_passes(
    graph: &mut Graph,
    options: &PassOptions,
    config: &DriverConfig,
    infer: &dyn ShapeInference,
    plugins: &PluginRegistry,
) -> Result<PassReport> {
    let mut report = front_passes(graph, options)?;
    report.merge(back_passes(graph, options, config, infer, plugins)?);
    Ok(report)
}
