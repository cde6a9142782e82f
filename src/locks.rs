//! Per-address mutual exclusion.
//!
//! Every transition holds the guard for its address from the DNS cleanup
//! until the pool reclaim, so a release racing the reaper's expire for the
//! same address runs one after the other. Different addresses never contend.
//! A lock entry exists only while someone holds or waits for it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct AddressLocks {
    slots: Mutex<HashMap<IpAddr, Arc<AsyncMutex<()>>>>,
}

impl AddressLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `address`.
    pub async fn lock(&self, address: IpAddr) -> AddressGuard<'_> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(address).or_default())
        };
        let guard = slot.lock_owned().await;
        AddressGuard {
            locks: self,
            address,
            guard: Some(guard),
        }
    }

    /// Number of addresses currently locked or waited on.
    pub fn active(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Exclusive access to one address; released on drop.
#[derive(Debug)]
pub struct AddressGuard<'a> {
    locks: &'a AddressLocks,
    address: IpAddr,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for AddressGuard<'_> {
    fn drop(&mut self) {
        let mut slots = self
            .locks
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.guard.take();
        // waiters clone the slot under the map lock, so a count of one
        // means only the map still references it
        if let Some(slot) = slots.get(&self.address)
            && Arc::strong_count(slot) == 1
        {
            slots.remove(&self.address);
        }
    }
}
