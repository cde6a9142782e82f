//! Binding persistence.
//!
//! [`LeaseStore`] is the narrow interface the state machine mutates through.
//! [`BindingStore`] implements it over an in-memory map of identity
//! associations, optionally persisted to a JSON file.
//!
//! # Thread Safety
//!
//! [`BindingStore`] uses:
//! - [`RwLock`] for the binding maps (allows concurrent reads)
//! - [`Mutex`] for file save operations (prevents corruption)

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error};

use crate::binding::{IaAddress, IaType, IdentityAssoc};
use crate::error::{Error, Result};

/// Minimum interval between bindings file saves (5 seconds).
///
/// The dirty flag is checked and cleared on each save.
const SAVE_INTERVAL_MILLIS: u128 = 5000;

/// Durable CRUD over identity associations and their address bindings.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Returns the stored binding for an address, if any.
    async fn get_binding(&self, ip_address: IpAddr) -> Result<Option<IaAddress>>;

    /// Returns the identity association currently owning an address, if any.
    async fn find_owner(&self, ip_address: IpAddr) -> Result<Option<IdentityAssoc>>;

    /// Deletes `ia`'s binding. Deleting an identity's last binding deletes
    /// the identity as well.
    ///
    /// Fails with [`Error::AddressInUse`] if the address is owned by a
    /// different identity.
    async fn delete_binding(&self, ia: &IdentityAssoc, binding: &IaAddress) -> Result<()>;

    /// Replaces `ia`'s stored binding for `binding.ip_address`.
    ///
    /// Fails with [`Error::AddressInUse`] if the address is owned by a
    /// different identity.
    async fn update_binding(&self, ia: &IdentityAssoc, binding: &IaAddress) -> Result<()>;

    /// Returns every identity of `ia_type` holding at least one bound binding
    /// whose valid lifetime ended at or before `now`. Each returned identity
    /// carries only its expired bindings.
    async fn find_expired(
        &self,
        ia_type: IaType,
        now: DateTime<Utc>,
    ) -> Result<Vec<IdentityAssoc>>;
}

/// On-disk format of the bindings file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StoreFile {
    /// Identity associations indexed by [`IdentityAssoc::key`].
    identity_assocs: HashMap<String, IdentityAssoc>,
}

#[derive(Debug)]
struct InternalState {
    file: StoreFile,
    /// Reverse lookup: address → identity key.
    ip_to_identity: HashMap<IpAddr, String>,
    dirty: bool,
    last_save: Instant,
}

impl InternalState {
    fn new(file: StoreFile) -> Result<Self> {
        let mut ip_to_identity = HashMap::new();
        for (key, ia) in &file.identity_assocs {
            for binding in &ia.addresses {
                if ip_to_identity
                    .insert(binding.ip_address, key.clone())
                    .is_some()
                {
                    return Err(Error::AddressInUse(binding.ip_address));
                }
            }
        }

        Ok(Self {
            file,
            ip_to_identity,
            dirty: false,
            last_save: Instant::now(),
        })
    }

    /// Returns the stored identity owning `ip_address`, which must be the
    /// one keyed `owner_key`.
    fn owner_mut(&mut self, owner_key: &str, ip_address: IpAddr) -> Result<&mut IdentityAssoc> {
        let key = self
            .ip_to_identity
            .get(&ip_address)
            .ok_or(Error::BindingNotFound(ip_address))?;
        if key != owner_key {
            return Err(Error::AddressInUse(ip_address));
        }
        self.file
            .identity_assocs
            .get_mut(owner_key)
            .ok_or_else(|| Error::Store(format!("dangling index entry for {}", ip_address)))
    }
}

/// Identity associations and bindings, held in memory and optionally
/// persisted to a JSON file.
#[derive(Debug)]
pub struct BindingStore {
    state: RwLock<InternalState>,
    path: Option<PathBuf>,
    save_lock: Mutex<()>,
}

impl BindingStore {
    /// Creates an empty store that never touches the disk.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(InternalState {
                file: StoreFile::default(),
                ip_to_identity: HashMap::new(),
                dirty: false,
                last_save: Instant::now(),
            }),
            path: None,
            save_lock: Mutex::new(()),
        }
    }

    /// Opens a file-backed store, loading existing bindings if the file
    /// exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if it binds one address to two identities.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            serde_json::from_str(&content)?
        } else {
            StoreFile::default()
        };

        Ok(Self {
            state: RwLock::new(InternalState::new(file)?),
            path: Some(path.to_path_buf()),
            save_lock: Mutex::new(()),
        })
    }

    /// Inserts or replaces an identity association.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressInUse`] if any of its addresses is bound to a
    /// different identity, or listed twice.
    pub async fn put_identity_assoc(&self, ia: IdentityAssoc) -> Result<()> {
        let key = ia.key();
        let mut state = self.state.write().await;

        let mut seen = Vec::with_capacity(ia.addresses.len());
        for binding in &ia.addresses {
            if seen.contains(&binding.ip_address) {
                return Err(Error::AddressInUse(binding.ip_address));
            }
            seen.push(binding.ip_address);
            if let Some(owner) = state.ip_to_identity.get(&binding.ip_address)
                && *owner != key
            {
                return Err(Error::AddressInUse(binding.ip_address));
            }
        }

        if let Some(previous) = state.file.identity_assocs.remove(&key) {
            for binding in &previous.addresses {
                state.ip_to_identity.remove(&binding.ip_address);
            }
        }
        for binding in &ia.addresses {
            state.ip_to_identity.insert(binding.ip_address, key.clone());
        }
        state.file.identity_assocs.insert(key, ia);
        state.dirty = true;

        self.maybe_save(&mut state).await;
        Ok(())
    }

    /// Returns the identity association with the given identity, if stored.
    pub async fn find_identity_assoc(
        &self,
        duid: &[u8],
        ia_type: IaType,
        iaid: u32,
    ) -> Option<IdentityAssoc> {
        let key = IdentityAssoc::new(duid.to_vec(), ia_type, iaid).key();
        let state = self.state.read().await;
        state.file.identity_assocs.get(&key).cloned()
    }

    /// Returns all identity associations.
    pub async fn list_identity_assocs(&self) -> Vec<IdentityAssoc> {
        let state = self.state.read().await;
        state.file.identity_assocs.values().cloned().collect()
    }

    /// Returns every stored address.
    pub async fn addresses(&self) -> Vec<IpAddr> {
        let state = self.state.read().await;
        state.ip_to_identity.keys().copied().collect()
    }

    /// Returns the number of stored bindings.
    pub async fn binding_count(&self) -> usize {
        let state = self.state.read().await;
        state.ip_to_identity.len()
    }

    async fn maybe_save(&self, state: &mut InternalState) {
        if !state.dirty || state.last_save.elapsed().as_millis() < SAVE_INTERVAL_MILLIS {
            return;
        }
        let Some(path) = &self.path else {
            state.dirty = false;
            return;
        };

        let _lock = self.save_lock.lock().await;
        match write_file(path, &state.file).await {
            Ok(()) => {
                state.dirty = false;
                state.last_save = Instant::now();
            }
            Err(error) => {
                // stays dirty so the next mutation or save() retries
                error!("Failed to save bindings to {}: {}", path.display(), error);
            }
        }
    }

    /// Forces an immediate save of the bindings to disk.
    pub async fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let state = self.state.read().await;
        let file = state.file.clone();
        drop(state);

        let _lock = self.save_lock.lock().await;
        write_file(path, &file).await?;

        let mut state = self.state.write().await;
        state.dirty = false;
        state.last_save = Instant::now();

        Ok(())
    }
}

async fn write_file(path: &Path, file: &StoreFile) -> Result<()> {
    let content = serde_json::to_string_pretty(file)?;
    tokio::fs::write(path, content).await?;
    Ok(())
}

#[async_trait]
impl LeaseStore for BindingStore {
    async fn get_binding(&self, ip_address: IpAddr) -> Result<Option<IaAddress>> {
        let state = self.state.read().await;
        Ok(state
            .ip_to_identity
            .get(&ip_address)
            .and_then(|key| state.file.identity_assocs.get(key))
            .and_then(|ia| ia.address(ip_address).cloned()))
    }

    async fn find_owner(&self, ip_address: IpAddr) -> Result<Option<IdentityAssoc>> {
        let state = self.state.read().await;
        Ok(state
            .ip_to_identity
            .get(&ip_address)
            .and_then(|key| state.file.identity_assocs.get(key).cloned()))
    }

    async fn delete_binding(&self, owner: &IdentityAssoc, binding: &IaAddress) -> Result<()> {
        let ip_address = binding.ip_address;
        let key = owner.key();
        let mut state = self.state.write().await;

        let ia = state.owner_mut(&key, ip_address)?;
        ia.addresses.retain(|stored| stored.ip_address != ip_address);
        let now_empty = ia.addresses.is_empty();

        if now_empty {
            state.file.identity_assocs.remove(&key);
            debug!("Deleted identity {} with its last binding", key);
        }
        state.ip_to_identity.remove(&ip_address);
        state.dirty = true;

        self.maybe_save(&mut state).await;
        Ok(())
    }

    async fn update_binding(&self, owner: &IdentityAssoc, binding: &IaAddress) -> Result<()> {
        let ip_address = binding.ip_address;
        let mut state = self.state.write().await;

        let ia = state.owner_mut(&owner.key(), ip_address)?;
        let stored = ia
            .addresses
            .iter_mut()
            .find(|stored| stored.ip_address == ip_address)
            .ok_or(Error::BindingNotFound(ip_address))?;
        *stored = binding.clone();
        state.dirty = true;

        self.maybe_save(&mut state).await;
        Ok(())
    }

    async fn find_expired(
        &self,
        ia_type: IaType,
        now: DateTime<Utc>,
    ) -> Result<Vec<IdentityAssoc>> {
        let state = self.state.read().await;

        let mut expired: Vec<IdentityAssoc> = state
            .file
            .identity_assocs
            .values()
            .filter(|ia| ia.ia_type == ia_type)
            .filter_map(|ia| {
                let addresses: Vec<IaAddress> = ia
                    .addresses
                    .iter()
                    .filter(|binding| binding.is_expired_at(now))
                    .cloned()
                    .collect();
                (!addresses.is_empty()).then(|| IdentityAssoc {
                    addresses,
                    ..ia.clone()
                })
            })
            .collect();

        // oldest expiry first
        expired.sort_by_key(|ia| {
            ia.addresses
                .iter()
                .filter_map(|binding| binding.valid_end_time)
                .min()
        });

        Ok(expired)
    }
}
