//! Detection head synthesis.
//!
//! The network body of a detection model ends in raw box and class predictions. These rules append the decode
//! and non-max suppression stages the target runtime expects, then make the new heads the model outputs. Each
//! head is planned on the unchanged graph first; a graph that does not fit the expected output layout is left
//! alone with a warning.

use graft_ir::op::{self, Activation, Op};
use graft_ir::tensor::{Array, TensorMeta};
use graft_ir::{Graph, NodeId, clear_redundant_nodes};
use ndarray::IxDyn;

use crate::common::{connect, dims_i64, fresh_name, shaped};
use crate::config::{AnchorFormat, DetectionPostprocess, PassOptions};
use crate::error::{Result, Skip};
use crate::rewrite::unsupported;

type Plan<T> = std::result::Result<T, Skip>;

/// YOLOv2 VOC anchors, in grid cells.
pub const YOLO2_ANCHORS: [f64; 10] = [1.08, 1.19, 3.42, 4.41, 6.63, 11.38, 9.42, 5.11, 16.62, 10.52];
const YOLO2_BOXES_PER_GRID: usize = 5;
const YOLO2_GRIDS: [usize; 2] = [13, 12];

/// YOLOv3 anchors in pixels, coarsest scale first.
pub const YOLO3_FULL_ANCHORS: [[f64; 6]; 3] = [
    [116.0, 90.0, 156.0, 198.0, 373.0, 326.0],
    [30.0, 61.0, 62.0, 45.0, 59.0, 119.0],
    [10.0, 13.0, 16.0, 30.0, 33.0, 23.0],
];
pub const YOLO3_TINY_ANCHORS: [[f64; 6]; 2] =
    [[81.0, 82.0, 135.0, 169.0, 373.0, 319.0], [10.0, 14.0, 23.0, 27.0, 37.0, 58.0]];
const YOLO3_STRIDES: [f64; 3] = [32.0, 16.0, 8.0];
const YOLO3_BOXES_PER_GRID: usize = 3;

const NMS_OUTPUTS: usize = 4;
/// `(region out-port, nms in-port)`: boxes, box counts, scores and class ids.
const REGION_TO_NMS: [(usize, usize); 4] = [(0, 3), (1, 0), (2, 1), (4, 2)];
const REGION_FUSED_PORTS: usize = 5;

/// Append the detection head named by `options.detection_postprocess`.
///
/// Returns `false` when no head is configured, or when the graph outputs do not have the layout the head needs.
#[tracing::instrument(skip_all, fields(head = ?options.detection_postprocess))]
pub fn detection_post_process(graph: &mut Graph, options: &PassOptions) -> Result<bool> {
    let Some(kind) = options.detection_postprocess else {
        return Ok(false);
    };
    let applied = match kind {
        DetectionPostprocess::Ssd | DetectionPostprocess::SsdResnet => ssd(graph, options, kind),
        DetectionPostprocess::Yolo2 => yolo2(graph, options),
        DetectionPostprocess::Yolo3Tiny | DetectionPostprocess::Yolo3Full => yolo3(graph, options, kind),
        DetectionPostprocess::CaffeFasterrcnn => {
            tracing::warn!(head = %kind, "no head synthesis for this detection model");
            return Ok(false);
        }
    };
    match applied {
        Ok(outputs) => {
            graph.set_output_names(outputs)?;
            let removed = clear_redundant_nodes(graph);
            tracing::debug!(head = %kind, removed, "detection head appended");
            Ok(true)
        }
        Err(Rejected::Skip(skip)) => {
            tracing::warn!(head = %kind, %skip, "detection head not appended");
            Ok(false)
        }
        Err(Rejected::Graph(error)) => Err(error.into()),
    }
}

enum Rejected {
    Skip(Skip),
    Graph(graft_ir::Error),
}

impl From<Skip> for Rejected {
    fn from(skip: Skip) -> Self {
        Self::Skip(skip)
    }
}

impl From<graft_ir::Error> for Rejected {
    fn from(error: graft_ir::Error) -> Self {
        Self::Graph(error)
    }
}

type Head = std::result::Result<Vec<NodeId>, Rejected>;

fn output_shape(graph: &Graph, node: NodeId) -> Plan<Vec<usize>> {
    graph.output_shapes(node).into_iter().next().flatten().ok_or(Skip::MissingShape { node })
}

fn model_outputs<const N: usize>(graph: &Graph) -> Plan<[NodeId; N]> {
    graph
        .output_names()
        .try_into()
        .map_err(|_| Skip::OutputCount { expected: N, found: graph.output_names().len() })
}

/// New node fed by `src:0` through an edge carrying `link`.
fn append(
    graph: &mut Graph,
    src: NodeId,
    suffix: &str,
    op: impl Into<Op>,
    link: TensorMeta,
) -> Result<NodeId, graft_ir::Error> {
    let node = graph.add_op_node(fresh_name(graph, src, suffix), op);
    connect(graph, src, 0, node, 0, link)?;
    Ok(node)
}

fn named_node(graph: &mut Graph, name: String, op: impl Into<Op>) -> NodeId {
    let name = graph.get_valid_node_name(&name);
    graph.add_op_node(name, op)
}

/// `Out` sink on `src:port`.
fn add_out(graph: &mut Graph, src: NodeId, port: usize, suffix: &str) -> Result<NodeId, graft_ir::Error> {
    let out = graph.add_op_node(fresh_name(graph, src, suffix), op::Out {});
    connect(graph, src, port, out, 0, TensorMeta::new())?;
    Ok(out)
}

fn detach_consumers(graph: &mut Graph, node: NodeId) {
    let edges: Vec<_> = graph.sorted_out_edges(node).iter().map(|e| e.triple()).collect();
    graph.remove_edges_from(edges);
}

fn add_nms(graph: &mut Graph, options: &PassOptions, prefix: &str) -> Result<NodeId, graft_ir::Error> {
    let (image_width, image_height) = options.image_size_or_default();
    let nms = named_node(
        graph,
        format!("{prefix}_nms"),
        op::IrNms {
            image_width,
            image_height,
            iou_threshold: options.iou_threshold_or_default(),
            max_box_num: options.max_box_num,
            center_point_box: 0,
        },
    );
    for port in 0..NMS_OUTPUTS {
        add_out(graph, nms, port, &format!("out_{port}"))?;
    }
    Ok(nms)
}

// ============================================================================
// SSD
// ============================================================================

struct SsdPlan {
    class: NodeId,
    box_: NodeId,
    /// Flat `[batch, 1, boxes * k]` predictions to unflatten first, with their target dims.
    reshapes: Vec<(NodeId, Vec<usize>)>,
    class_shape: Vec<usize>,
    box_shape: Vec<usize>,
    class_num: usize,
    swap_coordinates: bool,
    needs_softmax: bool,
    anchors: Array,
}

fn plan_ssd(graph: &Graph, options: &PassOptions, kind: DetectionPostprocess) -> Plan<SsdPlan> {
    let [mut out1, mut out2] = model_outputs::<2>(graph)?;
    let (mut shape1, mut shape2) = (output_shape(graph, out1)?, output_shape(graph, out2)?);
    let mut reshapes = Vec::new();

    // `[batch, 1, boxes * k]` predictions are unflattened to `[batch, boxes, k]`.
    if let ([b1, 1, n1], [b2, 1, n2]) = (shape1.as_slice(), shape2.as_slice()) {
        let (b1, n1, b2, n2) = (*b1, *n1, *b2, *n2);
        let (dims1, dims2) = if n1 % 4 == 0 && n1 >= 4 && n2 % (n1 / 4) == 0 {
            let boxes = n1 / 4;
            (vec![b1, boxes, 4], vec![b2, boxes, n2 / boxes])
        } else if n2 % 4 == 0 && n2 >= 4 && n1 % (n2 / 4) == 0 {
            let boxes = n2 / 4;
            (vec![b1, boxes, n1 / boxes], vec![b2, boxes, 4])
        } else {
            return Err(unsupported(out1, "predictions do not split into boxes"));
        };
        reshapes = vec![(out1, dims1.clone()), (out2, dims2.clone())];
        (shape1, shape2) = (dims1, dims2);
    }
    if shape1.len() != 3 || shape2.len() != 3 {
        return Err(unsupported(out1, "expected rank-3 box and class predictions"));
    }
    if shape2.last() != Some(&4) {
        (out1, out2) = (out2, out1);
        (shape1, shape2) = (shape2, shape1);
    }
    let (class, box_, class_shape, box_shape) = (out1, out2, shape1, shape2);
    if box_shape.last() != Some(&4) {
        return Err(unsupported(box_, "no prediction has 4 box coordinates"));
    }
    let class_num = class_shape[2];

    let is_probability = |node: NodeId| {
        matches!(
            graph.op(node),
            Some(Op::IrSoftmax(_)) | Some(Op::IrActivation(op::IrActivation { method: Activation::Sigmoid, .. }))
        )
    };
    let parent = graph.sorted_in_edges(class).into_iter().find(|e| e.dst_in_port() == 0).map(|e| e.src);
    let needs_softmax = !is_probability(class) && !parent.is_some_and(is_probability);

    let anchors = if options.anchors.len() >= 4 && options.anchors.len() % 4 == 0 {
        let rows = options.anchors.len() / 4;
        let provided = Array::from_shape_vec(IxDyn(&[rows, 4]), options.anchors.clone())
            .map_err(|e| unsupported(box_, e.to_string()))?;
        match options.anchor_tensor_format {
            AnchorFormat::Center => provided,
            AnchorFormat::Corner => corner_to_center(&provided),
        }
    } else {
        let feature_map = feature_map_pairs(&options.feature_map)
            .ok_or_else(|| unsupported(class, "feature_map is required to generate anchors"))?;
        match kind {
            DetectionPostprocess::SsdResnet => resnet_anchors(&feature_map),
            _ => ssd_anchors(&feature_map),
        }
    };
    if anchors.shape()[0] != box_shape[1] {
        let reason = format!("{} anchors for {} predicted boxes", anchors.shape()[0], box_shape[1]);
        return Err(unsupported(box_, reason));
    }

    Ok(SsdPlan {
        class,
        box_,
        reshapes,
        class_shape,
        box_shape,
        class_num: options.class_num.unwrap_or(class_num),
        swap_coordinates: graph.framework == graft_ir::Framework::Caffe || kind == DetectionPostprocess::SsdResnet,
        needs_softmax,
        anchors,
    })
}

/// `SSD` and `SSD_RESNET`: optional unflattening, optional `(y, x)` swap of the box coordinates, softmax over
/// the class scores, then `DecodeBox` and `NMS`.
fn ssd(graph: &mut Graph, options: &PassOptions, kind: DetectionPostprocess) -> Head {
    let plan = plan_ssd(graph, options, kind)?;
    let prefix = options.model_name_or(&graph.name).to_string();

    let tensor_of = |node: NodeId, shape: &[usize]| {
        let dtype = graph.output_tensors(node).first().and_then(|t| t.dtype);
        TensorMeta { dtype, ..shaped(shape.to_vec()) }
    };
    let class_tensor = tensor_of(plan.class, &plan.class_shape);
    let box_tensor = tensor_of(plan.box_, &plan.box_shape);
    let first_tensor = |node: NodeId| graph.output_tensors(node).into_iter().next().unwrap_or_default();
    let links: Vec<TensorMeta> = plan.reshapes.iter().map(|&(node, _)| first_tensor(node)).collect();

    let mut class = plan.class;
    let mut box_ = plan.box_;
    detach_consumers(graph, class);
    detach_consumers(graph, box_);
    for ((node, dims), link) in plan.reshapes.iter().zip(links) {
        let reshape = append(graph, *node, "post_reshape", op::IrReshape { dim: dims_i64(dims) }, link)?;
        if *node == class {
            class = reshape;
        } else {
            box_ = reshape;
        }
    }

    if plan.swap_coordinates {
        let split = append(
            graph,
            box_,
            "post_split",
            op::IrSplit { axis: 2, split: vec![1; 4] },
            box_tensor.clone(),
        )?;
        let concat = graph.add_op_node(fresh_name(graph, box_, "post_concat"), op::IrConcat { axis: 2 });
        let mut coordinate = plan.box_shape.clone();
        coordinate[2] = 1;
        for (src_port, dst_port) in [(0, 1), (1, 0), (2, 3), (3, 2)] {
            connect(graph, split, src_port, concat, dst_port, shaped(coordinate.clone()))?;
        }
        box_ = concat;
    }
    if plan.needs_softmax {
        class = append(graph, class, "softmax", op::IrSoftmax { axis: -1 }, class_tensor.clone())?;
    }

    let (image_width, image_height) = options.image_size_or_default();
    let decode_box = named_node(
        graph,
        format!("{prefix}_decode_box"),
        op::IrDecodeBox {
            feature_map: options.feature_map.clone(),
            image_width,
            image_height,
            max_box_num: options.max_box_num,
            class_num: plan.class_num,
            score_threshold: options.score_threshold,
            variance: options.variance.clone(),
            weights: plan.anchors,
            weights_offset: None,
        },
    );
    connect(graph, class, 0, decode_box, 0, class_tensor)?;
    connect(graph, box_, 0, decode_box, 1, box_tensor)?;
    add_out(graph, decode_box, 4, "out")?;

    let nms = add_nms(graph, options, &prefix)?;
    for port in 0..NMS_OUTPUTS {
        connect(graph, decode_box, port, nms, port, TensorMeta::new())?;
    }
    Ok(vec![decode_box, nms])
}

/// Flat `[h0, w0, h1, w1, ...]` into pairs.
fn feature_map_pairs(flat: &[usize]) -> Option<Vec<(usize, usize)>> {
    if flat.is_empty() || flat.len() % 2 != 0 {
        return None;
    }
    Some(flat.chunks_exact(2).map(|pair| (pair[0], pair[1])).collect())
}

fn corner_to_center(anchors: &Array) -> Array {
    let mut center = anchors.clone();
    for (mut out, row) in center.outer_iter_mut().zip(anchors.outer_iter()) {
        let (y_min, x_min, y_max, x_max) = (row[0], row[1], row[2], row[3]);
        out[0] = (y_min + y_max) / 2.0;
        out[1] = (x_min + x_max) / 2.0;
        out[2] = y_max - y_min;
        out[3] = x_max - x_min;
    }
    center
}

/// `[n, 4]` anchors from `(scale, aspect)` boxes replicated over every cell of every feature map.
fn grid_anchors(feature_map: &[(usize, usize)], boxes_of: impl Fn(usize) -> Vec<(f64, f64)>) -> Array {
    let mut rows = Vec::new();
    for (layer, &(height, width)) in feature_map.iter().enumerate() {
        let boxes = boxes_of(layer);
        for i in 0..height {
            for j in 0..width {
                let y = (i as f64 + 0.5) / height as f64;
                let x = (j as f64 + 0.5) / width as f64;
                for &(h, w) in &boxes {
                    rows.extend_from_slice(&[y, x, h, w]);
                }
            }
        }
    }
    let n = rows.len() / 4;
    Array::from_shape_vec(IxDyn(&[n, 4]), rows).unwrap_or_else(|_| Array::zeros(IxDyn(&[0, 4])))
}

fn aspect_box(scale: f64, aspect: f64) -> (f64, f64) {
    (scale / aspect.sqrt(), scale * aspect.sqrt())
}

/// MobileNet-SSD anchors in center form: scales spread over `[0.2, 0.95]`, three boxes per cell on the first
/// feature map and six elsewhere.
pub fn ssd_anchors(feature_map: &[(usize, usize)]) -> Array {
    const MIN_SCALE: f64 = 0.2;
    const MAX_SCALE: f64 = 0.95;
    let layers = feature_map.len();
    let scale = |k: usize| match layers {
        1 => MIN_SCALE,
        _ if k >= layers => 1.0,
        _ => MIN_SCALE + (MAX_SCALE - MIN_SCALE) * k as f64 / (layers - 1) as f64,
    };
    grid_anchors(feature_map, |k| {
        if k == 0 {
            return vec![aspect_box(0.1, 1.0), aspect_box(scale(0), 2.0), aspect_box(scale(0), 0.5)];
        }
        let mut boxes: Vec<_> = [1.0, 2.0, 0.5, 3.0, 1.0 / 3.0].iter().map(|&a| aspect_box(scale(k), a)).collect();
        boxes.push(aspect_box((scale(k) * scale(k + 1)).sqrt(), 1.0));
        boxes
    })
}

/// SSD-ResNet34 default boxes in center form, clipped to the unit square.
pub fn resnet_anchors(feature_map: &[(usize, usize)]) -> Array {
    const SCALES: [f64; 7] = [0.07, 0.15, 0.33, 0.51, 0.69, 0.87, 1.05];
    let scale = |k: usize| SCALES.get(k).copied().unwrap_or(SCALES[6] + 0.18 * (k + 1 - SCALES.len()) as f64);
    let layers = feature_map.len();
    let mut anchors = grid_anchors(feature_map, |k| {
        let (sk, next) = (scale(k), scale(k + 1));
        let mut boxes = vec![(sk, sk), ((sk * next).sqrt(), (sk * next).sqrt())];
        let aspects: &[f64] = if k == 0 || k + 2 >= layers { &[2.0] } else { &[2.0, 3.0] };
        for &a in aspects {
            boxes.push(aspect_box(sk, a));
            boxes.push(aspect_box(sk, 1.0 / a));
        }
        boxes
    });
    anchors.mapv_inplace(|v| v.clamp(0.0, 1.0));
    anchors
}

// ============================================================================
// YOLO
// ============================================================================

/// Geometry of one raw YOLO prediction.
#[derive(Debug, Clone, Copy)]
struct Grid {
    batch: usize,
    height: usize,
    width: usize,
    channels: usize,
    nchw: bool,
}

/// NHWC or NCHW prediction over a square grid with `channels` a multiple of `boxes`.
fn yolo_grid(shape: &[usize], boxes: usize) -> Option<Grid> {
    let (batch, height, width, channels, nchw) = match *shape {
        [n, h, w, c] if h == w && c % boxes == 0 && c != h => (n, h, w, c, false),
        [n, c, h, w] if h == w && c % boxes == 0 => (n, h, w, c, true),
        _ => return None,
    };
    (channels / boxes > 5).then_some(Grid { batch, height, width, channels, nchw })
}

/// `net_out [-> Transpose] -> Reshape [b, h, w, boxes, 5 + classes] -> Region`.
fn region_branch(
    graph: &mut Graph,
    net_out: NodeId,
    grid: Grid,
    region: op::IrRegion,
    region_name: String,
) -> Result<NodeId, graft_ir::Error> {
    let Grid { batch, height, width, channels, nchw } = grid;
    let boxes = region.box_per_grid;
    let mut tensor = graph.output_tensors(net_out).into_iter().next().unwrap_or_default();
    detach_consumers(graph, net_out);
    let mut tail = net_out;
    if nchw {
        tail = append(graph, tail, "transpose_to_nhwc", op::IrTranspose { perm: vec![0, 2, 3, 1] }, tensor.clone())?;
        tensor = TensorMeta { shape: Some(vec![batch, height, width, channels]), ..tensor };
    }
    let grouped = vec![batch, height, width, boxes, channels / boxes];
    tail = append(graph, tail, "region_reshape", op::IrReshape { dim: dims_i64(&grouped) }, tensor.clone())?;
    let region_node = named_node(graph, region_name, region);
    connect(graph, tail, 0, region_node, 0, TensorMeta { shape: Some(grouped), ..tensor })?;
    Ok(region_node)
}

fn connect_region_to_nms(graph: &mut Graph, region: NodeId, nms: NodeId) -> Result<(), graft_ir::Error> {
    for (src_port, dst_port) in REGION_TO_NMS {
        connect(graph, region, src_port, nms, dst_port, TensorMeta::new())?;
    }
    Ok(())
}

/// `YOLO2`: one `[b, 13, 13, 5 * (5 + classes)]` prediction (NHWC or NCHW) feeding `Region` and `NMS`.
fn yolo2(graph: &mut Graph, options: &PassOptions) -> Head {
    let [net_out] = model_outputs::<1>(graph)?;
    let shape = output_shape(graph, net_out)?;
    let grid = yolo_grid(&shape, YOLO2_BOXES_PER_GRID)
        .filter(|g| YOLO2_GRIDS.contains(&g.height))
        .ok_or_else(|| unsupported(net_out, format!("{shape:?} is not a YOLO2 prediction")))?;
    if graph.out_degree(net_out) != 1 {
        return Err(unsupported(net_out, "expected a single consumer").into());
    }
    let prefix = options.model_name_or(&graph.name).to_string();
    let anchors = if options.anchors.is_empty() { YOLO2_ANCHORS.to_vec() } else { options.anchors.clone() };

    let region = op::IrRegion {
        grid_width: grid.width,
        grid_height: grid.height,
        box_per_grid: YOLO2_BOXES_PER_GRID,
        max_box_num: options.max_box_num,
        class_num: grid.channels / YOLO2_BOXES_PER_GRID - 5,
        obj_threshold: options.obj_threshold,
        grid_compensate: options.grid_compensate,
        anchors,
    };
    let region = region_branch(graph, net_out, grid, region, format!("{prefix}_region"))?;
    add_out(graph, region, 3, "out")?;
    let nms = add_nms(graph, options, &prefix)?;
    connect_region_to_nms(graph, region, nms)?;
    Ok(vec![region, nms])
}

/// `YOLO3_TINY` (two scales) and `YOLO3_FULL` (three scales): one `Region` per scale, fused pairwise, then
/// `NMS`. Anchors are given in pixels and normalized by each scale's stride.
fn yolo3(graph: &mut Graph, options: &PassOptions, kind: DetectionPostprocess) -> Head {
    let default_anchors: &[[f64; 6]] = match kind {
        DetectionPostprocess::Yolo3Tiny => &YOLO3_TINY_ANCHORS,
        _ => &YOLO3_FULL_ANCHORS,
    };
    let scales = default_anchors.len();
    let outputs = graph.output_names().to_vec();
    if outputs.len() != scales {
        return Err(Skip::OutputCount { expected: scales, found: outputs.len() }.into());
    }
    let mut grids: Vec<Grid> = Vec::with_capacity(scales);
    for &out in &outputs {
        let shape = output_shape(graph, out)?;
        let grid = yolo_grid(&shape, YOLO3_BOXES_PER_GRID)
            .ok_or_else(|| unsupported(out, format!("{shape:?} is not a YOLO3 prediction")))?;
        if grids.last().is_some_and(|prev| grid.height != prev.height * 2) {
            return Err(unsupported(out, "grid does not double between scales").into());
        }
        if graph.out_degree(out) != 1 {
            return Err(unsupported(out, "expected a single consumer").into());
        }
        grids.push(grid);
    }
    let anchors: Vec<Vec<f64>> = if options.anchors.len() == 6 * scales {
        options.anchors.chunks_exact(6).map(<[f64]>::to_vec).collect()
    } else {
        default_anchors.iter().map(|a| a.to_vec()).collect()
    };
    let prefix = options.model_name_or(&graph.name).to_string();

    let mut regions = Vec::with_capacity(scales);
    for (n, ((&out, grid), pixels)) in outputs.iter().zip(grids).zip(anchors).enumerate() {
        let region = op::IrRegion {
            grid_width: grid.width,
            grid_height: grid.height,
            box_per_grid: YOLO3_BOXES_PER_GRID,
            max_box_num: options.max_box_num,
            class_num: grid.channels / YOLO3_BOXES_PER_GRID - 5,
            obj_threshold: options.obj_threshold,
            grid_compensate: options.grid_compensate,
            anchors: pixels.iter().map(|p| p / YOLO3_STRIDES[n]).collect(),
        };
        regions.push(region_branch(graph, out, grid, region, format!("{prefix}_region_{}", n + 1))?);
    }

    let mut fused = regions[0];
    for (i, &region) in regions.iter().enumerate().skip(1) {
        let suffix = if i == 1 { String::new() } else { i.to_string() };
        let fuse = named_node(graph, format!("{prefix}_region_fuse{suffix}"), op::IrRegionFuse {});
        for port in 0..REGION_FUSED_PORTS {
            connect(graph, fused, port, fuse, 2 * port, TensorMeta::new())?;
            connect(graph, region, port, fuse, 2 * port + 1, TensorMeta::new())?;
        }
        fused = fuse;
    }
    add_out(graph, fused, 3, "out")?;
    let nms = add_nms(graph, options, &prefix)?;
    connect_region_to_nms(graph, fused, nms)?;
    Ok(vec![fused, nms])
}
