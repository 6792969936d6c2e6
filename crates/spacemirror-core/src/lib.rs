//! SpaceMirror Core - Domain model and reconciliation logic
//!
//! This crate contains the pieces of the disk-usage mirror that do not
//! depend on an async runtime or on the OS notification facility:
//! - **Domain types** - `EntryId`, `RootPath`, `Entry`, `NodeRef`, error enums
//! - **Port definitions** - `IPathDiffer`, the filesystem ground-truth oracle
//! - **Tree** - the `EntryTable` arena, the path index and `Tree::reconcile`
//! - **Configuration** - typed YAML configuration with validation
//!
//! # Architecture
//!
//! The tree never touches the filesystem directly. Every observation goes
//! through an [`ports::IPathDiffer`] implementation, which lets adapter
//! crates supply the real filesystem and tests supply an in-memory one.

pub mod config;
pub mod domain;
pub mod ports;
pub mod tree;
