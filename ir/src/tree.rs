//! Tree rendering of a node's producers.
//!
//! Shared producers are printed once; later occurrences show a back-reference.

use std::borrow::Cow;
use std::cell::RefCell;
use std::collections::HashSet;
use std::io;
use std::rc::Rc;

use ptree::{Style, TreeItem};

use crate::graph::{Graph, NodeId};

#[derive(Clone)]
struct ProducerTree<'a> {
    graph: &'a Graph,
    node: NodeId,
    port: Option<usize>,
    visited: Rc<RefCell<HashSet<NodeId>>>,
    is_backref: Rc<RefCell<bool>>,
}

impl ProducerTree<'_> {
    fn child(&self, node: NodeId, port: usize) -> Self {
        Self {
            graph: self.graph,
            node,
            port: Some(port),
            visited: self.visited.clone(),
            is_backref: Rc::new(RefCell::new(false)),
        }
    }
}

impl TreeItem for ProducerTree<'_> {
    type Child = Self;

    fn write_self<W: io::Write>(&self, f: &mut W, _style: &Style) -> io::Result<()> {
        if let Some(port) = self.port {
            write!(f, "[{port}] ")?;
        }
        if !self.visited.borrow_mut().insert(self.node) {
            *self.is_backref.borrow_mut() = true;
            return write!(f, "{} (see above)", self.graph.name(self.node));
        }
        write!(f, "{}", format_node(self.graph, self.node))
    }

    fn children(&self) -> Cow<'_, [Self::Child]> {
        if *self.is_backref.borrow() {
            return Cow::Borrowed(&[]);
        }
        let children =
            self.graph.in_links(self.node).into_iter().map(|(src, _, in_port)| self.child(src, in_port)).collect();
        Cow::Owned(children)
    }
}

fn format_node(graph: &Graph, node: NodeId) -> String {
    let kind = graph.op(node).map_or("<invalid>", |op| op.name());
    let shapes: Vec<String> = graph
        .output_shapes(node)
        .into_iter()
        .map(|s| s.map_or_else(|| "?".to_string(), |s| format!("{s:?}")))
        .collect();
    if shapes.is_empty() {
        format!("{} : {kind}", graph.name(node))
    } else {
        format!("{} : {kind} -> {}", graph.name(node), shapes.join(", "))
    }
}

impl Graph {
    /// Render the producer tree of `root` as ASCII.
    pub fn tree(&self, root: NodeId) -> String {
        let tree = ProducerTree {
            graph: self,
            node: root,
            port: None,
            visited: Rc::new(RefCell::new(HashSet::new())),
            is_backref: Rc::new(RefCell::new(false)),
        };
        let mut buf = Vec::new();
        match ptree::write_tree(&tree, &mut buf) {
            Ok(()) => String::from_utf8_lossy(&buf).into_owned(),
            Err(err) => format!("{} (tree rendering failed: {err})", self.name(root)),
        }
    }
}
