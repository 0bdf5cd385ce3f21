//! RESP3 wire protocol: frame types, the node model, command encoding
//! and the incremental decoder.
//!
//! Every server reply decodes into a flat, depth-first stream of
//! [`Node`]s; [`crate::adapter::ResponseAdapter`] implementations
//! consume that stream into typed storage.

pub mod encode;
mod node;
pub mod parser;

pub use node::{FrameType, Node, OwnedNode, AGGREGATE_SIZE_UNKNOWN, PUSH_INDEX};
