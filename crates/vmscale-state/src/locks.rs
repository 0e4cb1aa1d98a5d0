//! Per-VM mutation locks.
//!
//! Every writer that reads a VM record, calls the control plane and then
//! writes the record back (the autoscaler, manual resize, start/stop,
//! deprovisioning) holds the VM's lock for the whole sequence. Writes from
//! different VMs never contend.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::types::VmId;

/// Shared table of per-VM async mutexes.
#[derive(Clone, Default)]
pub struct VmLocks {
    inner: Arc<Mutex<HashMap<VmId, Arc<Mutex<()>>>>>,
}

impl VmLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`. The lock is released when the
    /// returned guard is dropped.
    pub async fn lock(&self, id: VmId) -> OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().await;
            map.entry(id).or_default().clone()
        };
        slot.lock_owned().await
    }

    /// Drop the slot of a deprovisioned VM.
    pub async fn forget(&self, id: VmId) {
        self.inner.lock().await.remove(&id);
    }

    /// Number of VMs with an allocated slot.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_vm_is_exclusive() {
        let locks = VmLocks::new();
        let guard = locks.lock(1).await;

        let contender = locks.clone();
        let attempt =
            tokio::time::timeout(Duration::from_millis(50), async move { contender.lock(1).await })
                .await;
        assert!(attempt.is_err(), "second lock on vm 1 should wait");

        drop(guard);
        let reacquired = tokio::time::timeout(Duration::from_millis(50), locks.lock(1)).await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn different_vms_do_not_contend() {
        let locks = VmLocks::new();
        let _a = locks.lock(1).await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.lock(2)).await;
        assert!(b.is_ok());
        assert_eq!(locks.len().await, 2);
    }

    #[tokio::test]
    async fn forget_releases_slot() {
        let locks = VmLocks::new();
        drop(locks.lock(1).await);
        locks.forget(1).await;
        assert!(locks.is_empty().await);
    }
}
