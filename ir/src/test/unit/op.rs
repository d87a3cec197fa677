use std::str::FromStr;

use test_case::test_case;

use crate::error::Error;
use crate::op::{self, Activation, AttrValue, Attrs, LogicalMethod, Op, OpType};
use crate::test::helpers::*;

#[test]
fn from_attrs_fills_defaults() {
    let attrs = Attrs::new().with("kernel_shape", vec![3i64, 3]);
    let Op::MaxPool(pool) = Op::from_attrs(OpType::MaxPool, &attrs).unwrap() else { panic!("expected MaxPool") };

    assert_eq!(pool.kernel_shape, vec![3, 3]);
    assert_eq!(pool.strides, vec![1, 1]);
    assert_eq!(pool.pads, vec![0, 0, 0, 0]);
}

#[test]
fn from_attrs_rejects_wrong_kind() {
    let attrs = Attrs::new().with("perm", "not a list");
    let err = Op::from_attrs(OpType::IrTranspose, &attrs).unwrap_err();
    assert!(matches!(err, Error::AttributeType { attr: "perm", .. }));
}

#[test]
fn optional_fields_may_be_absent() {
    let Op::Clip(clip) = Op::from_attrs(OpType::Clip, &Attrs::new()).unwrap() else { panic!("expected Clip") };
    assert_eq!((clip.min, clip.max), (None, None));
}

#[test]
fn copied_attr_builds_related_kind() {
    let conv = op::IrConvolution {
        weights: vector(&[1.0, 2.0]),
        biases: vector(&[0.5]),
        weights_min_max: None,
        weights_scale: None,
        weights_zp: None,
        biases_scale: None,
        biases_zp: None,
        num_output: 1,
        group: 1,
        kernel_shape: vec![1, 1],
        strides: vec![1, 1],
        pads: vec![0, 0, 0, 0],
        dilations: vec![1, 1],
        activations: Activation::Relu,
        negative_slope: 0.0,
        weights_offset: None,
        biases_offset: None,
    };
    let attrs = Op::from(conv).copied_attr().with("multiplier", 1usize);

    assert_eq!(attrs.get("activations"), Some(&AttrValue::Str("RELU".into())));
    assert!(!attrs.contains("weights_offset"));

    let Op::IrDepthwiseConv(dw) = Op::from_attrs(OpType::IrDepthwiseConv, &attrs).unwrap() else {
        panic!("expected IrDepthwiseConv")
    };
    assert_eq!(dw.weights, vector(&[1.0, 2.0]));
    assert_eq!(dw.activations, Activation::Relu);
}

#[test]
fn method_enums_parse_case_insensitively() {
    let attrs = Attrs::new().with("method", "not_equal");
    let Op::IrLogical(logical) = Op::from_attrs(OpType::IrLogical, &attrs).unwrap() else { panic!() };
    assert_eq!(logical.method, LogicalMethod::NotEqual);
    assert_eq!(Activation::Relu6.to_string(), "RELU6");
    assert_eq!(Activation::LeakyRelu.to_string(), "LEAKYRELU");
}

#[test]
fn plugin_carries_name_and_free_attrs() {
    let attrs = Attrs::new().with("type", "Preprocess").with("mean", vec![0.5, 0.5, 0.5]);
    let Op::Plugin(plugin) = Op::from_attrs(OpType::Plugin, &attrs).unwrap() else { panic!() };

    assert_eq!(plugin.name, "Preprocess");
    assert!(plugin.attrs.contains("mean"));
    assert!(!plugin.attrs.contains("type"));
    assert_eq!(Op::Plugin(plugin).copied_attr(), attrs);
}

#[test_case(OpType::Concat, None; "concat is variadic")]
#[test_case(OpType::Constant, Some(0); "constant has no inputs")]
#[test_case(OpType::Add, Some(2))]
#[test_case(OpType::Conv, Some(3))]
#[test_case(OpType::Gru, Some(6))]
#[test_case(OpType::IrConvolution, Some(1); "target conv takes only data")]
fn declared_arity(op_type: OpType, expected: Option<usize>) {
    assert_eq!(op_type.num_in_ports(), expected);
}

#[test_case(OpType::IrEltwise, true, true)]
#[test_case(OpType::IrActivation, true, true)]
#[test_case(OpType::IrConcat, false, true)]
#[test_case(OpType::Conv, false, false)]
#[test_case(OpType::Input, false, true)]
fn layout_and_target_markers(op_type: OpType, layout_unaware: bool, target: bool) {
    assert_eq!(op_type.is_layout_unaware(), layout_unaware);
    assert_eq!(op_type.is_target(), target);
}

#[test]
fn op_type_round_trips_through_name() {
    for name in ["Conv", "IrSquare", "BatchNormalization", "Plugin"] {
        assert_eq!(OpType::from_str(name).unwrap().name(), name);
    }
    assert!(OpType::from_str("Bogus").is_err());
}

#[test]
fn capability_accessors_dispatch_by_kind() {
    let mut conv = Op::from(op::Conv {
        weights: None,
        biases: None,
        weights_min_max: None,
        weights_scale: None,
        weights_zp: None,
        biases_scale: None,
        biases_zp: None,
        group: 1,
        kernel_shape: vec![],
        strides: vec![1, 1],
        pads: vec![0, 0, 0, 0],
        dilations: vec![1, 1],
    });
    assert!(conv.as_weights().is_some_and(|w| w.weights().is_none()));
    conv.as_weights_mut().unwrap().set_weights(vector(&[3.0]));
    assert_eq!(conv.as_weights().and_then(|w| w.weights()), Some(&vector(&[3.0])));
    assert!(conv.as_axis().is_none());

    let mut concat = Op::from(op::IrConcat { axis: 1 });
    concat.as_axis_mut().unwrap().set_axis(3);
    assert_eq!(concat.as_axis().map(|a| a.axis()), Some(3));
}
