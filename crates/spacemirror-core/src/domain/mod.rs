//! Domain entities
//!
//! This module contains the core domain types for SpaceMirror:
//! - Newtypes for arena identifiers and the validated mirror root
//! - Tree entries (files and directories) stored in the arena
//! - Domain-specific error types

pub mod entry;
pub mod errors;
pub mod newtypes;

// Re-export commonly used types
pub use entry::{ChildIds, Entry, EntryKind};
pub use errors::DomainError;
pub use newtypes::{EntryId, RootPath};
