//! redb table definitions for the vmscale state store.

use redb::TableDefinition;

/// VM records keyed by internal id.
pub const VMS: TableDefinition<u64, &[u8]> = TableDefinition::new("vms");

/// Control-plane address `{node}/{vmid}` → internal VM id.
pub const VM_KEYS: TableDefinition<&str, u64> = TableDefinition::new("vm_keys");

/// Scaling events keyed by `(vm_id, event_id)`.
pub const SCALING_EVENTS: TableDefinition<(u64, u64), &[u8]> =
    TableDefinition::new("scaling_events");

/// Monotonic id sequences keyed by name.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

pub const VM_SEQUENCE: &str = "vm";
pub const EVENT_SEQUENCE: &str = "scaling_event";
