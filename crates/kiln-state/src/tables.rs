//! redb table definitions.
//!
//! Entities are keyed by id; name-addressed lookups go through small
//! secondary index tables mapping the unique name key to the id.

use redb::TableDefinition;

/// App id → App json.
pub const APPS: TableDefinition<&str, &[u8]> = TableDefinition::new("apps");
/// App name → app id.
pub const APP_NAMES: TableDefinition<&str, &str> = TableDefinition::new("app_names");
/// `{app_name}:{path}` → Route json.
pub const ROUTES: TableDefinition<&str, &[u8]> = TableDefinition::new("routes");
/// Fn id → Fn json.
pub const FNS: TableDefinition<&str, &[u8]> = TableDefinition::new("fns");
/// `{app_id}:{name}` → fn id.
pub const FN_NAMES: TableDefinition<&str, &str> = TableDefinition::new("fn_names");
/// Trigger id → Trigger json.
pub const TRIGGERS: TableDefinition<&str, &[u8]> = TableDefinition::new("triggers");
/// `{app_id}:{name}` → trigger id.
pub const TRIGGER_NAMES: TableDefinition<&str, &str> =
    TableDefinition::new("trigger_names");
/// `{app_id}:{type}:{source}` → trigger id.
pub const TRIGGER_SOURCES: TableDefinition<&str, &str> =
    TableDefinition::new("trigger_sources");
/// `{app_name}:{call_id}` → Call json. Call ids sort by creation time,
/// so a prefix range doubles as a chronological listing.
pub const CALLS: TableDefinition<&str, &[u8]> = TableDefinition::new("calls");
/// Call id → raw log bytes.
pub const LOGS: TableDefinition<&str, &[u8]> = TableDefinition::new("logs");
