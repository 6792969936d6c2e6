//! Port definitions (hexagonal architecture interfaces)
//!
//! Ports are the interfaces the tree depends on but whose implementations
//! live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`IPathDiffer`] - Ground-truth filesystem probe used by reconciliation
//! - [`memory::MemoryDiffer`] - In-memory implementation for tests

pub mod memory;
pub mod path_differ;

pub use path_differ::{FileProbe, IPathDiffer, PathState, ProbeError};
