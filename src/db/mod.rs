//! Database module: view models and SQL repositories for the outbox table.
//!
//! This module is split into two submodules:
//! - `model`: view models and insert descriptors used by repositories.
//! - `repo`: SQL-only functions that map rows into `crate::model::QueueItem`.
//!
//! State-machine decisions live in `crate::outbox`; every function here only
//! applies a guarded row update and reports whether it took effect.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{ErrorSample, NewQueueItem};
