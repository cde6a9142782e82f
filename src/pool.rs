//! The free-address pool.
//!
//! The allocator hands addresses out of a [`FreeAddressPool`]; the binding
//! manager only ever gives them back, through [`FreeAddressPool::reclaim`],
//! after the binding is gone from the store.
//!
//! [`FreeAddressSet`] counts its free addresses with a [`Semaphore`] so a
//! caller that needs an address can wait for one explicitly instead of
//! polling.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::error::Result;

/// Returns freed addresses to the allocatable set.
#[async_trait]
pub trait FreeAddressPool: Send + Sync {
    async fn reclaim(&self, address: IpAddr) -> Result<()>;
}

/// Sorted set of free addresses with a permit per address.
///
/// Invariant: outside a `take`, the semaphore holds exactly one permit per
/// address in `free`.
#[derive(Debug)]
pub struct FreeAddressSet {
    free: Mutex<BTreeSet<IpAddr>>,
    available: Semaphore,
}

impl FreeAddressSet {
    pub fn new<I: IntoIterator<Item = IpAddr>>(addresses: I) -> Self {
        let free: BTreeSet<IpAddr> = addresses.into_iter().collect();
        let available = Semaphore::new(free.len());
        Self {
            free: Mutex::new(free),
            available,
        }
    }

    /// Takes the lowest free address, waiting until one is reclaimed if the
    /// set is empty.
    pub async fn take(&self) -> IpAddr {
        loop {
            // the semaphore is never closed
            if let Ok(permit) = self.available.acquire().await {
                permit.forget();
                if let Some(address) = self.pop_first() {
                    return address;
                }
            }
        }
    }

    /// Takes the lowest free address without waiting.
    pub fn try_take(&self) -> Option<IpAddr> {
        let permit = self.available.try_acquire().ok()?;
        permit.forget();
        self.pop_first()
    }

    pub fn contains(&self, address: IpAddr) -> bool {
        self.lock().contains(&address)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn pop_first(&self) -> Option<IpAddr> {
        self.lock().pop_first()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<IpAddr>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl FreeAddressPool for FreeAddressSet {
    /// Idempotent: reclaiming an address that is already free is a no-op.
    async fn reclaim(&self, address: IpAddr) -> Result<()> {
        let inserted = self.lock().insert(address);
        if inserted {
            self.available.add_permits(1);
        }
        Ok(())
    }
}
