use graft_ir::NodeId;
use snafu::Snafu;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Terminal compilation error.
#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// A hard graph invariant does not hold (cycle, output bookkeeping, ...).
    #[snafu(display("graph invariant violated: {source}"))]
    Graph { source: graft_ir::Error },

    /// Transient inconsistency raised inside the layout cleanup loop.
    ///
    /// The driver re-runs shape inference and continues unless strict layout handling is requested.
    #[snafu(display("{pass} left the graph inconsistent: {source}"))]
    Recoverable { pass: &'static str, source: graft_ir::Error },
}

impl From<graft_ir::Error> for Error {
    fn from(source: graft_ir::Error) -> Self {
        Self::Graph { source }
    }
}

impl Error {
    /// Downgrade failures a sink can leave behind into `Recoverable`; keep the rest terminal.
    pub fn in_layout_pass(self, pass: &'static str) -> Self {
        match self {
            Self::Graph { source } if is_transient(&source) => Self::Recoverable { pass, source },
            other => other,
        }
    }
}

fn is_transient(error: &graft_ir::Error) -> bool {
    matches!(
        error,
        graft_ir::Error::PortConflict { .. }
            | graft_ir::Error::ShapeMismatch { .. }
            | graft_ir::Error::InvalidPermutation { .. }
    )
}

/// Why a single match was abandoned. Logged and never fatal.
#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum Skip {
    #[snafu(display("node {node} has no operator"))]
    InvalidNode { node: NodeId },

    #[snafu(display("node {node}: {reason}"))]
    Unsupported { node: NodeId, reason: String },

    #[snafu(display("node {node}: in-port {port} is not constant"))]
    NotConstant { node: NodeId, port: usize },

    #[snafu(display("node {node}: shape is unknown"))]
    MissingShape { node: NodeId },

    #[snafu(display("connecting {src} to {dst} would close a cycle"))]
    CycleRisk { src: NodeId, dst: NodeId },

    #[snafu(display("node {node} was removed by an earlier rewrite"))]
    Stale { node: NodeId },

    #[snafu(display("expected {expected} model outputs, found {found}"))]
    OutputCount { expected: usize, found: usize },
}

/// Outcome of one rewrite attempt: skipped with a diagnostic, or failed hard.
#[derive(Debug, Clone, PartialEq)]
pub enum Reject {
    Skip(Skip),
    Fail(Error),
}

impl From<Skip> for Reject {
    fn from(skip: Skip) -> Self {
        Self::Skip(skip)
    }
}

impl From<Error> for Reject {
    fn from(error: Error) -> Self {
        Self::Fail(error)
    }
}

impl From<graft_ir::Error> for Reject {
    fn from(source: graft_ir::Error) -> Self {
        Self::Fail(Error::Graph { source })
    }
}

/// Result of rewriting one match.
pub type Attempt<T = ()> = std::result::Result<T, Reject>;
