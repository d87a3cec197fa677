//! Pass configuration.
//!
//! [`PassOptions`] is the typed form of the flat string-keyed options map handed over by the front end.
//! [`DriverConfig`] holds the knobs of the pass driver itself. Both are built with bon builders, and both
//! fall back to documented defaults for anything missing.

use std::collections::HashMap;
use std::str::FromStr;

use bon::bon;

// ============================================================================
// DETECTION POSTPROCESS
// ============================================================================

/// Detection head synthesized after the network body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(strum::Display, strum::EnumString, strum::IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DetectionPostprocess {
    Ssd,
    SsdResnet,
    Yolo2,
    Yolo3Tiny,
    Yolo3Full,
    CaffeFasterrcnn,
}

impl DetectionPostprocess {
    pub fn is_ssd(self) -> bool {
        matches!(self, Self::Ssd | Self::SsdResnet)
    }

    pub fn is_yolo(self) -> bool {
        matches!(self, Self::Yolo2 | Self::Yolo3Tiny | Self::Yolo3Full)
    }
}

/// Layout of the SSD anchor tensor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[derive(strum::Display, strum::EnumString, strum::IntoStaticStr)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AnchorFormat {
    /// `[y_center, x_center, height, width]`
    #[default]
    Center,
    /// `[y_min, x_min, y_max, x_max]`
    Corner,
}

// ============================================================================
// PASS OPTIONS
// ============================================================================

pub const DEFAULT_SSD_IMAGE_SIZE: usize = 300;
pub const DEFAULT_YOLO_IMAGE_SIZE: usize = 416;
pub const DEFAULT_MAX_BOX_NUM: usize = 5000;
pub const DEFAULT_SCORE_THRESHOLD: f64 = 0.5;
pub const DEFAULT_SSD_IOU_THRESHOLD: f64 = 0.6;
pub const DEFAULT_YOLO_IOU_THRESHOLD: f64 = 0.5;
pub const DEFAULT_OBJ_THRESHOLD: f64 = 0.3;

/// Typed options consumed by the rewrite passes.
///
/// Geometry and thresholds left unset resolve per detection head through the `*_or_default` accessors.
#[derive(Debug, Clone, PartialEq)]
pub struct PassOptions {
    pub detection_postprocess: Option<DetectionPostprocess>,
    pub image_width: Option<usize>,
    pub image_height: Option<usize>,
    pub max_box_num: usize,
    pub score_threshold: f64,
    pub iou_threshold: Option<f64>,
    pub obj_threshold: f64,
    pub class_num: Option<usize>,
    pub anchors: Vec<f64>,
    pub feature_map: Vec<usize>,
    pub variance: Vec<f64>,
    pub anchor_tensor_format: AnchorFormat,
    pub model_name: Option<String>,
    pub grid_compensate: bool,
}

impl Default for PassOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[bon]
impl PassOptions {
    #[builder]
    pub fn new(
        detection_postprocess: Option<DetectionPostprocess>,
        image_width: Option<usize>,
        image_height: Option<usize>,
        #[builder(default = DEFAULT_MAX_BOX_NUM)] max_box_num: usize,
        #[builder(default = DEFAULT_SCORE_THRESHOLD)] score_threshold: f64,
        iou_threshold: Option<f64>,
        #[builder(default = DEFAULT_OBJ_THRESHOLD)] obj_threshold: f64,
        class_num: Option<usize>,
        #[builder(default)] anchors: Vec<f64>,
        #[builder(default)] feature_map: Vec<usize>,
        #[builder(default)] variance: Vec<f64>,
        #[builder(default)] anchor_tensor_format: AnchorFormat,
        #[builder(into)] model_name: Option<String>,
        #[builder(default = true)] grid_compensate: bool,
    ) -> Self {
        Self {
            detection_postprocess,
            image_width,
            image_height,
            max_box_num,
            score_threshold,
            iou_threshold,
            obj_threshold,
            class_num,
            anchors,
            feature_map,
            variance,
            anchor_tensor_format,
            model_name,
            grid_compensate,
        }
    }

    /// Parse the string-keyed options map. Keys are case-insensitive.
    ///
    /// # Recognized keys
    ///
    /// * `detection_postprocess` - SSD, SSD_RESNET, YOLO2, YOLO3_TINY, YOLO3_FULL, CAFFE_FASTERRCNN
    /// * `image_width`, `image_height`, `max_box_num`, `class_num`
    /// * `score_threshold`, `iou_threshold`, `obj_threshold`
    /// * `anchors`, `variance` - comma-separated floats, brackets allowed
    /// * `feature_map` - comma-separated integers
    /// * `anchor_tensor_format` - CENTER (default) or CORNER
    /// * `model_name`, `grid_compensate`
    ///
    /// Unknown keys are ignored. Values that fail to parse log a warning and keep the default.
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let map: HashMap<String, &str> = map.iter().map(|(k, v)| (k.to_ascii_lowercase(), v.trim())).collect();
        let get = |key: &str| map.get(key).copied().filter(|v| !v.is_empty());
        let defaults = Self::builder().build();

        Self {
            detection_postprocess: get("detection_postprocess")
                .and_then(|v| parse_or_warn("detection_postprocess", v)),
            image_width: get("image_width").and_then(|v| parse_or_warn("image_width", v)),
            image_height: get("image_height").and_then(|v| parse_or_warn("image_height", v)),
            max_box_num: get("max_box_num")
                .and_then(|v| parse_or_warn("max_box_num", v))
                .unwrap_or(defaults.max_box_num),
            score_threshold: get("score_threshold")
                .and_then(|v| parse_or_warn("score_threshold", v))
                .unwrap_or(defaults.score_threshold),
            iou_threshold: get("iou_threshold").and_then(|v| parse_or_warn("iou_threshold", v)),
            obj_threshold: get("obj_threshold")
                .and_then(|v| parse_or_warn("obj_threshold", v))
                .unwrap_or(defaults.obj_threshold),
            class_num: get("class_num").and_then(|v| parse_or_warn("class_num", v)),
            anchors: get("anchors").and_then(|v| parse_list("anchors", v)).unwrap_or_default(),
            feature_map: get("feature_map").and_then(|v| parse_list("feature_map", v)).unwrap_or_default(),
            variance: get("variance").and_then(|v| parse_list("variance", v)).unwrap_or_default(),
            anchor_tensor_format: get("anchor_tensor_format")
                .and_then(|v| parse_or_warn("anchor_tensor_format", v))
                .unwrap_or_default(),
            model_name: get("model_name").map(str::to_string),
            grid_compensate: get("grid_compensate")
                .and_then(|v| parse_bool("grid_compensate", v))
                .unwrap_or(defaults.grid_compensate),
        }
    }

    /// Image size of the detection head: the configured value, else 416 for YOLO and 300 otherwise.
    pub fn image_size_or_default(&self) -> (usize, usize) {
        let fallback = match self.detection_postprocess {
            Some(kind) if kind.is_yolo() => DEFAULT_YOLO_IMAGE_SIZE,
            _ => DEFAULT_SSD_IMAGE_SIZE,
        };
        (self.image_width.unwrap_or(fallback), self.image_height.unwrap_or(fallback))
    }

    /// NMS IoU threshold: the configured value, else 0.5 for YOLO and 0.6 otherwise.
    pub fn iou_threshold_or_default(&self) -> f64 {
        match (self.iou_threshold, self.detection_postprocess) {
            (Some(iou), _) => iou,
            (None, Some(kind)) if kind.is_yolo() => DEFAULT_YOLO_IOU_THRESHOLD,
            (None, _) => DEFAULT_SSD_IOU_THRESHOLD,
        }
    }

    pub fn model_name_or<'a>(&'a self, graph_name: &'a str) -> &'a str {
        self.model_name.as_deref().unwrap_or(graph_name)
    }
}

fn parse_or_warn<T: FromStr>(key: &str, value: &str) -> Option<T> {
    let parsed = value.parse().ok();
    if parsed.is_none() {
        tracing::warn!(key, value, "ignoring unparsable option");
    }
    parsed
}

fn parse_bool(key: &str, value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(key, value, "ignoring unparsable option");
            None
        }
    }
}

fn parse_list<T: FromStr>(key: &str, value: &str) -> Option<Vec<T>> {
    value
        .trim_matches(|c| c == '[' || c == ']')
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| parse_or_warn(key, item))
        .collect()
}

// ============================================================================
// DRIVER CONFIGURATION
// ============================================================================

/// Hard cap on layout cleanup iterations, whatever the graph size or override.
pub const MAX_LAYOUT_ITERATIONS: usize = 20;
pub const MIN_LAYOUT_ITERATIONS: usize = 15;
pub const DEFAULT_MAX_GROUPS: usize = 8;

/// Knobs of the pass driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Fixed layout iteration count instead of the size-derived one. Still capped at 20.
    pub layout_iterations: Option<usize>,
    /// Treat every failure inside the layout loop as terminal.
    pub strict_layout: bool,
    /// Largest branch count tried by the grouped convolution fusion.
    pub max_groups: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self { layout_iterations: None, strict_layout: false, max_groups: DEFAULT_MAX_GROUPS }
    }
}

#[bon]
impl DriverConfig {
    #[builder]
    pub fn new(
        layout_iterations: Option<usize>,
        #[builder(default = false)] strict_layout: bool,
        #[builder(default = DEFAULT_MAX_GROUPS)] max_groups: usize,
    ) -> Self {
        Self { layout_iterations, strict_layout, max_groups }
    }

    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `GRAFT_LAYOUT_ITERS` - Fixed layout iteration count (default: derived from graph size)
    /// * `GRAFT_STRICT_LAYOUT` - Make layout loop failures terminal if set
    /// * `GRAFT_MAX_GROUPS` - Largest grouped convolution branch count (default: 8)
    pub fn from_env() -> Self {
        let layout_iterations = std::env::var("GRAFT_LAYOUT_ITERS").ok().and_then(|s| s.parse().ok());
        let strict_layout = std::env::var("GRAFT_STRICT_LAYOUT").is_ok();
        let max_groups =
            std::env::var("GRAFT_MAX_GROUPS").ok().and_then(|s| s.parse().ok()).unwrap_or(DEFAULT_MAX_GROUPS);

        Self { layout_iterations, strict_layout, max_groups }
    }

    /// Iteration count of the layout cleanup loop for a graph of `len` nodes.
    pub fn layout_iterations_for(&self, len: usize) -> usize {
        match self.layout_iterations {
            Some(fixed) => fixed.min(MAX_LAYOUT_ITERATIONS),
            None => layout_iterations(len),
        }
    }
}

/// `clamp(len / 15, 15, 20)`.
pub fn layout_iterations(len: usize) -> usize {
    (len / 15).clamp(MIN_LAYOUT_ITERATIONS, MAX_LAYOUT_ITERATIONS)
}
