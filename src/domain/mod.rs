//! Domain types: items, batches, and their lifecycles.

pub mod batch;
pub mod item;
