//! `output_names` bookkeeping.
//!
//! The model outputs are an ordered list of node handles. Nothing repairs the list implicitly: a rewrite that
//! removes or replaces an output node updates it through these accessors, each of which rejects handles that
//! are not live.

use snafu::ensure;

use super::{Graph, NodeId};
use crate::error::{OutputNotInGraphSnafu, Result};

impl Graph {
    pub fn output_names(&self) -> &[NodeId] {
        &self.output_names
    }

    pub fn is_output(&self, id: NodeId) -> bool {
        self.output_names.contains(&id)
    }

    pub fn set_output_names(&mut self, outputs: Vec<NodeId>) -> Result<()> {
        for &id in &outputs {
            self.require_output(id)?;
        }
        self.output_names = outputs;
        Ok(())
    }

    /// Replace every occurrence of `old` with `new`. Returns whether `old` was an output.
    pub fn replace_output(&mut self, old: NodeId, new: NodeId) -> Result<bool> {
        if !self.is_output(old) {
            return Ok(false);
        }
        self.require_output(new)?;
        for slot in self.output_names.iter_mut().filter(|slot| **slot == old) {
            *slot = new;
        }
        Ok(true)
    }

    /// Replace the first occurrence of `old` with the ordered `news`.
    pub fn replace_output_with_many(&mut self, old: NodeId, news: &[NodeId]) -> Result<bool> {
        let Some(index) = self.output_names.iter().position(|&id| id == old) else {
            return Ok(false);
        };
        for &id in news {
            self.require_output(id)?;
        }
        self.output_names.splice(index..=index, news.iter().copied());
        Ok(true)
    }

    pub fn remove_output(&mut self, id: NodeId) -> bool {
        let before = self.output_names.len();
        self.output_names.retain(|&out| out != id);
        before != self.output_names.len()
    }

    /// Insert at `index`, clamped to the list length.
    pub fn insert_output(&mut self, index: usize, id: NodeId) -> Result<()> {
        self.require_output(id)?;
        let index = index.min(self.output_names.len());
        self.output_names.insert(index, id);
        Ok(())
    }

    /// Check that every output still refers to a live node.
    pub fn validate_outputs(&self) -> Result<()> {
        for &id in &self.output_names {
            self.require_output(id)?;
        }
        Ok(())
    }

    fn require_output(&self, id: NodeId) -> Result<()> {
        ensure!(self.contains(id), OutputNotInGraphSnafu { name: id.to_string() });
        Ok(())
    }
}
