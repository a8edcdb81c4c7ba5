//! redb table definitions for the gangway state store.
//!
//! String-keyed tables hold JSON-serialized domain types. Requests use
//! `{len(group_id)}:{group_id}:{request_id}` keys; events use a `u64`
//! sequence.

use redb::TableDefinition;

/// Groups keyed by `{group_id}`.
pub const GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("groups");

/// Member requests keyed by [`request_key`](crate::types::request_key).
pub const REQUESTS: TableDefinition<&str, &[u8]> = TableDefinition::new("requests");

/// Queue specs keyed by `{name}`.
pub const QUEUES: TableDefinition<&str, &[u8]> = TableDefinition::new("queues");

/// Events keyed by append sequence.
pub const EVENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("events");

/// Queue leases keyed by `{queue}`.
pub const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");
