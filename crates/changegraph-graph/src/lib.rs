//! Resource dependency graph: mutable graph with published immutable
//! snapshots, traversal algorithms, and Graph Store implementations.

pub mod graph;
pub mod store;
pub mod traversal;

pub use graph::{DependencyGraph, GraphSnapshot, NodeInfo};
pub use store::{open_store, MemoryGraphStore};
#[cfg(feature = "rocksdb")]
pub use store::RocksDbGraphStore;
pub use traversal::topological_levels;
