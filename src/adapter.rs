//! Response adapters.
//!
//! An adapter consumes the depth-first node stream of a request's
//! responses into typed storage. The core invokes it for every node of
//! every frame belonging to the request, passing the 0-based ordinal of
//! the command the frame answers ([`PUSH_INDEX`] for server pushes).
//! Adapters own their shape validation: a slot that wants an integer
//! rejects anything else with [`Error::NotANumber`].
//!
//! The trait is a plain virtual boundary, dispatched through a boxed
//! object held by the in-flight entry, so user-defined decoders and the
//! stock adapters below go through the same path.

use std::any::Any;

use crate::error::{Error, Result};
use crate::resp3::{FrameType, Node, OwnedNode};

pub use crate::resp3::PUSH_INDEX;

/// Consumes a node stream into typed user storage.
pub trait ResponseAdapter {
    /// Called for every node, in depth-first frame order.
    ///
    /// `index` is the ordinal of the command within the request this
    /// frame answers, or [`PUSH_INDEX`] for a server push.
    fn invoke(&mut self, index: usize, node: &Node<'_>) -> Result<()>;

    /// The maximum number of top-level responses this adapter accepts.
    ///
    /// Submission rejects requests expecting more responses than this
    /// with [`Error::IncompatibleSize`].
    fn supported_response_size(&self) -> usize {
        usize::MAX
    }
}

/// Discards every node. Accepts any response count.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ignore;

impl ResponseAdapter for Ignore {
    fn invoke(&mut self, _index: usize, _node: &Node<'_>) -> Result<()> {
        Ok(())
    }
}

/// Collects every node into owning storage, attributes included.
#[derive(Debug, Default)]
pub struct NodeCollector {
    /// The accumulated nodes, in arrival order.
    pub nodes: Vec<OwnedNode>,
}

impl NodeCollector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResponseAdapter for NodeCollector {
    fn invoke(&mut self, _index: usize, node: &Node<'_>) -> Result<()> {
        self.nodes.push(node.to_owned());
        Ok(())
    }
}

/// One text slot per expected response; each root-level leaf lands in
/// the slot of its command ordinal, lossily decoded as UTF-8.
///
/// Mirrors a tuple-of-strings response: the declared size bounds the
/// request at submission time.
#[derive(Debug)]
pub struct TextSlots {
    /// One entry per expected response; `None` until a leaf arrives.
    pub slots: Vec<Option<String>>,
}

impl TextSlots {
    /// An adapter for a request expecting `size` responses.
    pub fn with_size(size: usize) -> Self {
        Self {
            slots: vec![None; size],
        }
    }
}

impl ResponseAdapter for TextSlots {
    fn invoke(&mut self, index: usize, node: &Node<'_>) -> Result<()> {
        if node.depth == 0
            && !node.data_type.is_aggregate()
            && index < self.slots.len()
            && self.slots[index].is_none()
        {
            self.slots[index] = Some(String::from_utf8_lossy(node.data).into_owned());
        }
        Ok(())
    }

    fn supported_response_size(&self) -> usize {
        self.slots.len()
    }
}

/// Extracts one integer reply at a fixed command ordinal.
///
/// Anything other than a RESP3 number at that slot fails the request
/// with [`Error::NotANumber`].
#[derive(Debug)]
pub struct IntegerSlot {
    index: usize,
    /// The decoded value, once the slot's reply has arrived.
    pub value: Option<i64>,
}

impl IntegerSlot {
    /// An adapter watching the reply of command ordinal `index`.
    pub fn at(index: usize) -> Self {
        Self { index, value: None }
    }
}

impl ResponseAdapter for IntegerSlot {
    fn invoke(&mut self, index: usize, node: &Node<'_>) -> Result<()> {
        if index != self.index || node.depth != 0 {
            return Ok(());
        }
        // Attribute frames precede the value at the same depth; skip them.
        if node.data_type == FrameType::Attribute {
            return Ok(());
        }
        if node.data_type != FrameType::Number {
            return Err(Error::NotANumber);
        }
        let text = std::str::from_utf8(node.data).map_err(|_| Error::NotANumber)?;
        self.value = Some(text.parse::<i64>().map_err(|_| Error::NotANumber)?);
        Ok(())
    }
}

/// Object-safe shim the queue stores; re-unifies the adapter after
/// completion via `Any`.
pub(crate) trait ErasedAdapter: Send {
    fn invoke_node(&mut self, index: usize, node: &Node<'_>) -> Result<()>;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<A> ErasedAdapter for A
where
    A: ResponseAdapter + Send + 'static,
{
    fn invoke_node(&mut self, index: usize, node: &Node<'_>) -> Result<()> {
        self.invoke(index, node)
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}
