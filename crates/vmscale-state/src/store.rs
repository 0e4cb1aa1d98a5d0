//! StateStore — redb-backed persistence for vmscale.
//!
//! Provides typed operations over VM records and scaling events. All
//! values are JSON-serialized into redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(VMS).map_err(map_err!(Table))?;
        txn.open_table(VM_KEYS).map_err(map_err!(Table))?;
        txn.open_table(SCALING_EVENTS).map_err(map_err!(Table))?;
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── VMs ────────────────────────────────────────────────────────

    /// Register a new VM. Fails with `Conflict` if `(node, vmid)` is
    /// already known.
    pub fn create_vm(&self, new: NewVm) -> StateResult<VmRecord> {
        validate_resources(Some(new.cores), Some(new.memory_mb))?;
        let key = vm_key(&new.node, new.vmid);

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let keys = txn.open_table(VM_KEYS).map_err(map_err!(Table))?;
            if keys.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Conflict(format!("vm {key} already registered")));
            }
        }

        let id = next_id(&txn, VM_SEQUENCE)?;
        let now = epoch_secs();
        let record = VmRecord {
            id,
            name: new.name,
            node: new.node,
            vmid: new.vmid,
            status: new.status,
            cores: new.cores,
            memory_mb: new.memory_mb,
            disk_gb: new.disk_gb,
            os_type: new.os_type,
            autoscaling_enabled: new.autoscaling_enabled,
            software: new.software,
            created_at: now,
            updated_at: now,
        };

        write_vm(&txn, &record)?;
        {
            let mut keys = txn.open_table(VM_KEYS).map_err(map_err!(Table))?;
            keys.insert(key.as_str(), id).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(vm_id = id, %key, "vm created");
        Ok(record)
    }

    /// Get a VM by internal id.
    pub fn get_vm(&self, id: VmId) -> StateResult<Option<VmRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(VMS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Get a VM by its control-plane address.
    pub fn get_vm_by_key(&self, node: &str, vmid: u32) -> StateResult<Option<VmRecord>> {
        let key = vm_key(node, vmid);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let keys = txn.open_table(VM_KEYS).map_err(map_err!(Table))?;
        let id = match keys.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => guard.value(),
            None => return Ok(None),
        };
        let table = txn.open_table(VMS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List all VMs, ordered by id.
    pub fn list_vms(&self) -> StateResult<Vec<VmRecord>> {
        self.scan_vms(|_| true)
    }

    /// List the VMs flagged as autoscaling candidates.
    pub fn list_autoscale_vms(&self) -> StateResult<Vec<VmRecord>> {
        self.scan_vms(|vm| vm.autoscaling_enabled)
    }

    fn scan_vms(&self, keep: impl Fn(&VmRecord) -> bool) -> StateResult<Vec<VmRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(VMS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let vm: VmRecord = decode(value.value())?;
            if keep(&vm) {
                results.push(vm);
            }
        }
        Ok(results)
    }

    /// Persist new core/memory values. Only the fields set in `update`
    /// are written.
    pub fn update_vm_resources(&self, id: VmId, update: &ResourceUpdate) -> StateResult<VmRecord> {
        validate_resources(update.cores, update.memory_mb)?;
        self.mutate_vm(id, |vm| update.apply_to(vm))
    }

    /// Record a lifecycle status change.
    pub fn set_vm_status(&self, id: VmId, status: VmStatus) -> StateResult<VmRecord> {
        self.mutate_vm(id, |vm| vm.status = status)
    }

    /// Toggle the autoscaling eligibility flag.
    pub fn set_autoscaling(&self, id: VmId, enabled: bool) -> StateResult<VmRecord> {
        self.mutate_vm(id, |vm| vm.autoscaling_enabled = enabled)
    }

    /// Read-modify-write one VM record in a single transaction.
    fn mutate_vm(&self, id: VmId, f: impl FnOnce(&mut VmRecord)) -> StateResult<VmRecord> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut vm = read_vm(&txn, id)?.ok_or_else(|| StateError::NotFound(format!("vm {id}")))?;
        f(&mut vm);
        vm.updated_at = epoch_secs();
        write_vm(&txn, &vm)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(vm)
    }

    /// Delete a VM record and its address key. Scaling history is kept.
    /// Returns true if the VM existed.
    pub fn delete_vm(&self, id: VmId) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed = {
            let mut table = txn.open_table(VMS).map_err(map_err!(Table))?;
            let removed = table.remove(id).map_err(map_err!(Write))?;
            match removed {
                Some(guard) => Some(decode::<VmRecord>(guard.value())?),
                None => None,
            }
        };
        if let Some(vm) = &removed {
            let mut keys = txn.open_table(VM_KEYS).map_err(map_err!(Table))?;
            keys.remove(vm.external_key().as_str())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(vm_id = id, existed = removed.is_some(), "vm deleted");
        Ok(removed.is_some())
    }

    // ── Scaling events ─────────────────────────────────────────────

    /// Write the resources an applied scaling action produced and append
    /// its event, in one transaction.
    ///
    /// Returns the updated record and the stored event.
    pub fn record_scaling(
        &self,
        id: VmId,
        event: NewScalingEvent,
    ) -> StateResult<(VmRecord, ScalingEvent)> {
        let update = event.resource_update();
        if update.is_empty() {
            return Err(StateError::Invalid(format!(
                "scaling event for vm {id} changes nothing"
            )));
        }
        validate_resources(update.cores, update.memory_mb)?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut vm = read_vm(&txn, id)?.ok_or_else(|| StateError::NotFound(format!("vm {id}")))?;
        let now = epoch_secs();
        update.apply_to(&mut vm);
        vm.updated_at = now;
        write_vm(&txn, &vm)?;

        let stored = ScalingEvent {
            id: next_id(&txn, EVENT_SEQUENCE)?,
            vm_id: id,
            kind: event.kind,
            cpu_usage: event.cpu_usage,
            old_cores: event.old_cores,
            new_cores: event.new_cores,
            old_memory_mb: event.old_memory_mb,
            new_memory_mb: event.new_memory_mb,
            timestamp: now,
        };
        let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
        {
            let mut table = txn.open_table(SCALING_EVENTS).map_err(map_err!(Table))?;
            table
                .insert((id, stored.id), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(vm_id = id, event_id = stored.id, kind = %stored.kind, "scaling recorded");
        Ok((vm, stored))
    }

    /// Scaling events for a VM, newest first, at most `limit` entries.
    pub fn list_scaling_events(&self, vm_id: VmId, limit: usize) -> StateResult<Vec<ScalingEvent>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SCALING_EVENTS).map_err(map_err!(Table))?;
        let mut results: Vec<ScalingEvent> = Vec::new();
        for entry in table
            .range((vm_id, 0)..=(vm_id, u64::MAX))
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        // Event ids grow monotonically; they break ties within one second.
        results.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        results.truncate(limit);
        Ok(results)
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn validate_resources(cores: Option<u32>, memory_mb: Option<u32>) -> StateResult<()> {
    if cores == Some(0) {
        return Err(StateError::Invalid("cores must be positive".into()));
    }
    if memory_mb == Some(0) {
        return Err(StateError::Invalid("memory_mb must be positive".into()));
    }
    Ok(())
}

fn read_vm(txn: &WriteTransaction, id: VmId) -> StateResult<Option<VmRecord>> {
    let table = txn.open_table(VMS).map_err(map_err!(Table))?;
    match table.get(id).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

fn write_vm(txn: &WriteTransaction, vm: &VmRecord) -> StateResult<()> {
    let value = serde_json::to_vec(vm).map_err(map_err!(Serialize))?;
    let mut table = txn.open_table(VMS).map_err(map_err!(Table))?;
    table
        .insert(vm.id, value.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Allocate the next value of a named sequence inside `txn`.
fn next_id(txn: &WriteTransaction, sequence: &str) -> StateResult<u64> {
    let mut table = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
    let current = match table.get(sequence).map_err(map_err!(Read))? {
        Some(guard) => guard.value(),
        None => 0,
    };
    let next = current + 1;
    table.insert(sequence, next).map_err(map_err!(Write))?;
    Ok(next)
}
