use graft_ir::op::{self, Op, OpType};
use graft_ir::test::helpers::*;
use graft_ir::{Framework, Graph, NodeId};
use test_case::test_case;

use crate::config::{AnchorFormat, DetectionPostprocess, PassOptions};
use crate::rules::detection::*;

fn options(head: DetectionPostprocess) -> PassOptions {
    PassOptions::builder().detection_postprocess(head).model_name("net").build()
}

/// Single network output `body` with the given prediction shape.
fn single_head(shape: &[usize]) -> (Graph, NodeId, NodeId) {
    let mut g = graph();
    let x = input(&mut g, "x", &[1, 3, 416, 416]);
    let body = node(&mut g, "body", op::Relu {});
    link(&mut g, x, body, 0, 0);
    let out = output(&mut g, body, shape);
    (g, body, out)
}

fn region_of(graph: &Graph, name: &str) -> op::IrRegion {
    match graph.id(name).and_then(|id| graph.op(id)) {
        Some(Op::IrRegion(region)) => region.clone(),
        other => panic!("{name} is not a region: {other:?}"),
    }
}

#[test]
fn no_configured_head_is_a_no_op() {
    let (mut g, body, _) = single_head(&[1, 13, 13, 125]);

    assert!(!detection_post_process(&mut g, &PassOptions::default()).unwrap());
    assert_eq!(g.output_names(), &[body]);
}

#[test]
fn faster_rcnn_has_no_synthesized_head() {
    let (mut g, body, _) = single_head(&[1, 13, 13, 125]);

    assert!(!detection_post_process(&mut g, &options(DetectionPostprocess::CaffeFasterrcnn)).unwrap());
    assert_eq!(g.output_names(), &[body]);
}

// ============================================================================
// YOLO
// ============================================================================

#[test]
fn yolo2_nhwc_prediction_gets_region_and_nms() {
    let (mut g, body, old_out) = single_head(&[1, 13, 13, 125]);

    assert!(detection_post_process(&mut g, &options(DetectionPostprocess::Yolo2)).unwrap());

    let region = g.id("net_region").expect("region node");
    let nms = g.id("net_nms").expect("nms node");
    assert_eq!(g.output_names(), &[region, nms]);
    let spec = region_of(&g, "net_region");
    assert_eq!((spec.grid_width, spec.grid_height, spec.box_per_grid, spec.class_num), (13, 13, 5, 20));
    assert_eq!(spec.anchors, YOLO2_ANCHORS.to_vec());

    let reshape = g.id("body_region_reshape").expect("prediction grouped per box");
    assert!(matches!(g.op(reshape), Some(Op::IrReshape(r)) if r.dim == vec![1, 13, 13, 5, 25]));
    assert_eq!(g.predecessors(reshape), vec![body]);
    assert_eq!(g.predecessors(region), vec![reshape]);

    let Some(Op::IrNms(params)) = g.op(nms) else {
        panic!("nms node");
    };
    assert_eq!((params.image_width, params.image_height, params.iou_threshold), (416, 416, 0.5));
    assert_eq!(g.successors(nms).len(), 4, "one sink per nms output");
    assert!(!g.contains(old_out));
    assert_outputs_live(&g);
    assert_ports_unique(&g);
}

#[test]
fn yolo2_nchw_prediction_is_transposed_first() {
    let (mut g, body, _) = single_head(&[1, 125, 13, 13]);

    assert!(detection_post_process(&mut g, &options(DetectionPostprocess::Yolo2)).unwrap());

    let transpose = g.id("body_transpose_to_nhwc").expect("layout conversion");
    assert!(matches!(g.op(transpose), Some(Op::IrTranspose(t)) if t.perm == vec![0, 2, 3, 1]));
    assert_eq!(g.predecessors(transpose), vec![body]);
    assert_eq!(op_type_of(&g, "body_transpose_to_nhwc_region_reshape"), Some(OpType::IrReshape));
}

#[test_case(&[1, 7, 7, 125]; "unexpected_grid")]
#[test_case(&[1, 13, 13, 20]; "too_few_channels")]
fn yolo2_rejects_other_layouts(shape: &[usize]) {
    let (mut g, body, out) = single_head(shape);

    assert!(!detection_post_process(&mut g, &options(DetectionPostprocess::Yolo2)).unwrap());
    assert_eq!(g.output_names(), &[body]);
    assert_eq!(g.successors(body), vec![out]);
}

fn two_scale_heads(coarse: usize, fine: usize) -> Graph {
    let mut g = graph();
    let x = input(&mut g, "x", &[1, 3, 416, 416]);
    for (name, grid) in [("coarse", coarse), ("fine", fine)] {
        let body = node(&mut g, name, op::Relu {});
        link(&mut g, x, body, 0, 0);
        output(&mut g, body, &[1, grid, grid, 255]);
    }
    g
}

#[test]
fn yolo3_tiny_fuses_two_regions() {
    let mut g = two_scale_heads(13, 26);

    assert!(detection_post_process(&mut g, &options(DetectionPostprocess::Yolo3Tiny)).unwrap());

    let fuse = g.id("net_region_fuse").expect("regions fused");
    let nms = g.id("net_nms").expect("nms node");
    assert_eq!(g.output_names(), &[fuse, nms]);
    let (coarse, fine) = (region_of(&g, "net_region_1"), region_of(&g, "net_region_2"));
    assert_eq!((coarse.grid_width, fine.grid_width), (13, 26));
    assert_eq!(coarse.class_num, 80);
    assert_eq!(coarse.anchors[0], 81.0 / 32.0, "pixel anchors are divided by the stride");
    assert_eq!(fine.anchors[0], 10.0 / 16.0);
    assert_eq!(g.in_degree(fuse), 10);
    assert_outputs_live(&g);
}

#[test]
fn yolo3_needs_doubling_grids() {
    let mut g = two_scale_heads(13, 13);

    assert!(!detection_post_process(&mut g, &options(DetectionPostprocess::Yolo3Tiny)).unwrap());
    assert_eq!(g.output_names().len(), 2);
    assert!(g.id("net_nms").is_none());
}

#[test]
fn yolo3_full_needs_three_outputs() {
    let mut g = two_scale_heads(13, 26);

    assert!(!detection_post_process(&mut g, &options(DetectionPostprocess::Yolo3Full)).unwrap());
}

// ============================================================================
// SSD
// ============================================================================

/// `x -> cls [1, 4, 3]` and `x -> box [1, 4, 4]`, both model outputs.
fn ssd_graph() -> (Graph, NodeId, NodeId) {
    let mut g = graph();
    let x = input(&mut g, "x", &[1, 3, 300, 300]);
    let cls = node(&mut g, "cls", op::Relu {});
    let box_ = node(&mut g, "box", op::Relu {});
    link(&mut g, x, cls, 0, 0);
    link(&mut g, x, box_, 0, 0);
    output(&mut g, cls, &[1, 4, 3]);
    output(&mut g, box_, &[1, 4, 4]);
    (g, cls, box_)
}

fn ssd_options(format: AnchorFormat, anchors: Vec<f64>) -> PassOptions {
    PassOptions::builder()
        .detection_postprocess(DetectionPostprocess::Ssd)
        .model_name("net")
        .anchors(anchors)
        .anchor_tensor_format(format)
        .build()
}

fn corner_anchors() -> Vec<f64> {
    [[0.0, 0.0, 1.0, 1.0], [0.0, 0.0, 0.5, 0.5], [0.5, 0.5, 1.0, 1.0], [0.25, 0.25, 0.75, 0.75]].concat()
}

#[test]
fn ssd_appends_softmax_decode_and_nms() {
    let (mut g, _, box_) = ssd_graph();

    assert!(detection_post_process(&mut g, &ssd_options(AnchorFormat::Corner, corner_anchors())).unwrap());

    let decode = g.id("net_decode_box").expect("decode box");
    let nms = g.id("net_nms").expect("nms node");
    assert_eq!(g.output_names(), &[decode, nms]);
    let softmax = g.id("cls_softmax").expect("raw scores are normalized");
    assert_eq!(g.predecessors(decode), vec![softmax, box_]);

    let Some(Op::IrDecodeBox(head)) = g.op(decode) else {
        panic!("decode box");
    };
    assert_eq!(head.class_num, 3);
    assert_eq!(head.weights.shape(), &[4, 4]);
    let first: Vec<f64> = head.weights.iter().take(4).copied().collect();
    assert_eq!(first, vec![0.5, 0.5, 1.0, 1.0], "corner anchors are stored in center form");
    assert_eq!(g.predecessors(nms), vec![decode]);
    assert_outputs_live(&g);
}

#[test]
fn caffe_ssd_swaps_box_coordinates() {
    let (mut g, _, _) = ssd_graph();
    g.framework = Framework::Caffe;

    assert!(detection_post_process(&mut g, &ssd_options(AnchorFormat::Center, vec![0.5; 16])).unwrap());

    let split = g.id("box_post_split").expect("coordinates split");
    let concat = g.id("box_post_concat").expect("coordinates reassembled");
    let swapped: Vec<_> = g.sorted_in_edges(concat).iter().map(|e| (e.src_out_port(), e.dst_in_port())).collect();
    assert_eq!(swapped, vec![(1, 0), (0, 1), (3, 2), (2, 3)]);
    assert_eq!(g.predecessors(concat), vec![split]);
}

#[test]
fn ssd_with_mismatched_anchor_count_is_left_alone() {
    let (mut g, cls, box_) = ssd_graph();

    assert!(!detection_post_process(&mut g, &ssd_options(AnchorFormat::Center, vec![0.5; 8])).unwrap());
    assert_eq!(g.output_names(), &[cls, box_]);
}

#[test]
fn ssd_anchor_grid_has_three_boxes_on_first_map() {
    let anchors = ssd_anchors(&[(1, 1), (1, 1)]);

    assert_eq!(anchors.shape(), &[9, 4]);
    let first: Vec<f64> = anchors.iter().take(4).copied().collect();
    assert_eq!(first, vec![0.5, 0.5, 0.1, 0.1]);
}

#[test]
fn resnet_anchors_stay_in_unit_square() {
    let anchors = resnet_anchors(&[(2, 2), (1, 1)]);

    assert_eq!(anchors.shape(), &[2 * 2 * 4 + 4, 4]);
    assert!(anchors.iter().all(|&v| (0.0..=1.0).contains(&v)));
}
