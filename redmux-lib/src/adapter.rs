//!
//! Response adapters: the sink a submitter attaches to a request.
//!
//! The reader feeds every parsed [`Node`] of a response to the adapter the
//! submitter supplied. Node payloads borrow the read buffer, so adapters copy
//! what they keep. Returning an error aborts the connection.
//!

use std::any::Any;

use crate::resp3::{Node, OwnedNode};

/// A sink for the pre-order node sequence of one response.
///
/// Closures of the matching signature implement this, so ad hoc adapters need
/// no type of their own:
///
/// ```
/// use redmux_lib::resp3::Node;
///
/// let mut len = None;
/// let mut adapter = |node: &Node<'_>| -> redmux_lib::Result<()> {
///     len = Some(node.data.len());
///     Ok(())
/// };
/// # let _ = &mut adapter;
/// ```
pub trait Adapter: Send {
    /// Called once per node, in pre-order.
    fn on_node(&mut self, node: &Node<'_>) -> crate::Result<()>;
}

impl<F> Adapter for F
where
    F: FnMut(&Node<'_>) -> crate::Result<()> + Send,
{
    fn on_node(&mut self, node: &Node<'_>) -> crate::Result<()> {
        self(node)
    }
}

/// Discards the response.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ignore;

impl Adapter for Ignore {
    fn on_node(&mut self, _node: &Node<'_>) -> crate::Result<()> {
        Ok(())
    }
}

/// Collects the response as an owned pre-order node sequence.
#[derive(Debug, Default)]
pub struct Collect {
    /// The nodes received so far.
    pub nodes: Vec<OwnedNode>,
}

impl Collect {
    /// Creates an empty collector.
    pub fn new() -> Collect {
        Collect::default()
    }

    /// The root node of the collected response, if any arrived.
    pub fn root(&self) -> Option<&OwnedNode> {
        self.nodes.first()
    }

    /// Consumes the collector, yielding its nodes.
    pub fn into_nodes(self) -> Vec<OwnedNode> {
        self.nodes
    }
}

impl Adapter for Collect {
    fn on_node(&mut self, node: &Node<'_>) -> crate::Result<()> {
        self.nodes.push(node.to_owned());
        Ok(())
    }
}

/// Object-safe carrier that lets an adapter travel through the request queue
/// and come back to its submitter with its concrete type intact.
pub(crate) trait DynAdapter: Adapter {
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<A: Adapter + 'static> DynAdapter for A {
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}
