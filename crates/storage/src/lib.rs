//! Storage layer for seep
//!
//! This crate provides the reference store adapter and its compaction
//! machinery:
//! - MemoryStore: BTreeMap-based sorted, multi-versioned table with RwLock
//! - Conditional row mutations evaluated under a single write lock
//! - GarbageCollectionFilter: prunes versions no transaction can observe
//! - Compactor: background compaction task

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod compactor;
pub mod gc;
pub mod memory;

pub use compactor::Compactor;
pub use gc::{collect_garbage, GarbageCollectionFilter, GcPass};
pub use memory::{CompactionStats, MemoryStore, StoreStats};
