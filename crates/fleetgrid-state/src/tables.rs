//! redb table definitions for the configuration store.
//!
//! Keys are `{name}:{version}`; values are JSON-serialized `AppConfiguration`s.

use redb::TableDefinition;

/// App configurations keyed by `{name}:{version}`.
pub const APPS: TableDefinition<&str, &[u8]> = TableDefinition::new("apps");
