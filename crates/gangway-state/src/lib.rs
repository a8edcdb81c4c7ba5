//! gangway-state: embedded state store for gangway.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for gang groups, their member requests, queues, events and
//! per-queue leases.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Member requests use composite `{group_id}:{request_id}` keys so a
//! group's members can be found by prefix. Events are keyed by a
//! monotonically increasing `u64` sequence.
//!
//! Multi-row writes (a group plus all of its member bindings) happen in a
//! single redb write transaction, so readers observe either none or all
//! of them.

pub mod error;
pub mod snapshot;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
