//! Demand-driven tile computation: the shared cache and the worker pool.

mod cache;
mod scheduler;

pub(crate) use cache::TileKey;
pub use cache::{CacheStats, TileCache};
pub use scheduler::TileScheduler;
