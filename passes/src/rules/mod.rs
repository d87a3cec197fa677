//! The rewrite pass library.
//!
//! Every pass has the shape `fn(&mut Graph, ..) -> Result<bool>`: it snapshots its matches, validates and
//! applies them one at a time, and reports whether any applied. A match that fails validation is logged and
//! skipped; only graph invariant violations come back as errors.
//!
//! # Module Organization
//!
//! - [`fusion`] - Arithmetic and comparison fusions, grouped convolution
//! - [`rename`] - Source-format kinds lowered to target kinds
//! - [`broadcast`] - Explicit broadcasting of binary operands
//! - [`recurrent`] - GRU and LSTM conversion
//! - [`space`] - Space/batch/depth reshuffles
//! - [`activation`] - Relu and clip fusion
//! - [`detection`] - Detection post-process heads
//! - [`layout`] - Transpose sinking and layout cleanups
//! - [`legalize`] - Constants, casts, weight layout and the preprocess hook
//! - [`quantize`] - Front-phase constant folding into attributes and quantized patterns

pub mod activation;
pub mod broadcast;
pub mod detection;
pub mod fusion;
pub mod layout;
pub mod legalize;
pub mod quantize;
pub mod recurrent;
pub mod rename;
pub mod space;
