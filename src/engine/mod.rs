//! The execution state built from a graph.
//!
//! Every node of a [`Graph`](crate::Graph) gets a [`NodeContext`] owning its
//! stage instance and, once initialized, its output dataset. The
//! [`GraphContext`] owns all node contexts of one execution, builds them so
//! that producers exist before their consumers, counts how often each output
//! is consumed, and disposes everything in reverse.

mod context;
mod node;
mod slot;

pub use context::GraphContext;
pub use node::NodeContext;
pub(crate) use slot::StageSlot;
