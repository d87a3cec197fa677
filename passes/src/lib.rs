//! Rewrite pass library and pass driver of the graft compiler front end.
//!
//! Passes take a [`graft_ir::Graph`] whose nodes still carry source-format kinds and rewrite it, one fixed
//! phase at a time, into a graph of target kinds with legal dtypes, minimal layout conversions and an
//! assigned weights layout.
//!
//! # Module Organization
//!
//! - [`rules`] - The rewrite passes, grouped by concern
//! - [`driver`] - Phase order and the bounded layout cleanup loop
//! - [`config`] - Pass options and driver knobs
//! - [`plugin`] - Registry of externally provided operator kinds
//! - [`error`] - Terminal errors and per-match skip reasons
//!
//! # Failure Model
//!
//! A match that does not satisfy a rewrite's preconditions is logged and skipped, leaving the graph as it
//! was. Only graph invariant violations surface as [`Error`].

pub mod config;
pub mod driver;
pub mod error;
pub mod plugin;
pub mod rules;

mod common;
mod rewrite;

#[cfg(test)]
mod test;

pub use config::{AnchorFormat, DetectionPostprocess, DriverConfig, PassOptions, layout_iterations};
pub use driver::{PassReport, back_passes, front_passes, layout_loop, run_passes};
pub use error::{Error, Result, Skip};
pub use plugin::{PREPROCESS, PluginRegistry};
