//! The binding state machine.
//!
//! Release, decline and expire all run the same sequence under the address
//! lock:
//!
//! 1. DNS record deletion (best effort)
//! 2. Either delete the binding from the store and then reclaim the address
//!    into the free pool, or reset the binding in place
//!
//! They differ only in the target state, the timestamps they clear, and
//! whether the delete-and-reclaim branch is allowed. Decline never reclaims:
//! an address another host is using would just be declined again.
//!
//! Every transition first re-reads the address's owner from the store. If the
//! binding is gone or now belongs to another identity the call is skipped, so
//! a stale request can never touch a later client's lease.
//!
//! Failures are logged and absorbed. The caller already answered (or never
//! had) a client, so there is nothing for it to retry.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::binding::{BindingState, IaAddress, IaType, IdentityAssoc};
use crate::ddns::{DnsUpdater, NoopDnsUpdater};
use crate::error::Result;
use crate::locks::AddressLocks;
use crate::policy::{self, PolicySource};
use crate::pool::FreeAddressPool;
use crate::reaper::Reaper;
use crate::store::LeaseStore;

/// What a manager instance handles and how it cleans up DNS.
#[derive(Clone)]
pub struct BindingCapabilities {
    /// The identity-association type this manager owns.
    pub ia_type: IaType,
    /// Overrides the global delete-old-bindings policy when set.
    pub delete_old_bindings: Option<bool>,
    pub ddns: Arc<dyn DnsUpdater>,
}

impl BindingCapabilities {
    pub fn new(ia_type: IaType) -> Self {
        Self {
            ia_type,
            delete_old_bindings: None,
            ddns: Arc::new(NoopDnsUpdater),
        }
    }

    pub fn with_ddns(mut self, ddns: Arc<dyn DnsUpdater>) -> Self {
        self.ddns = ddns;
        self
    }

    pub fn with_delete_old_bindings(mut self, delete: bool) -> Self {
        self.delete_old_bindings = Some(delete);
        self
    }
}

impl fmt::Debug for BindingCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingCapabilities")
            .field("ia_type", &self.ia_type)
            .field("delete_old_bindings", &self.delete_old_bindings)
            .finish_non_exhaustive()
    }
}

/// Result of one transition, for logging and tests. Never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// Binding deleted and address reclaimed into the pool.
    Deleted,
    /// Binding reset in place.
    Updated,
    /// Nothing to do (expire of a binding that is no longer expired).
    Skipped,
    /// A step failed; the failure was logged.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Release,
    Decline,
    Expire,
}

impl Transition {
    fn target_state(self) -> BindingState {
        match self {
            Self::Decline => BindingState::Declined,
            Self::Release | Self::Expire => BindingState::Available,
        }
    }

    fn may_reclaim(self) -> bool {
        !matches!(self, Self::Decline)
    }

    /// Applies the in-place reset. Start time survives release and expire
    /// so operators can still see when the lease began.
    fn reset(self, binding: &mut IaAddress) {
        if self == Self::Decline {
            binding.start_time = None;
        }
        binding.preferred_end_time = None;
        binding.valid_end_time = None;
        binding.state = self.target_state();
    }

    fn progressive(self) -> &'static str {
        match self {
            Self::Release => "Releasing",
            Self::Decline => "Declining",
            Self::Expire => "Expiring",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Release => write!(f, "release"),
            Self::Decline => write!(f, "decline"),
            Self::Expire => write!(f, "expire"),
        }
    }
}

/// Owns the lifecycle transitions of one IA type's address bindings and the
/// reaper that expires them.
pub struct BindingManager {
    capabilities: BindingCapabilities,
    pub(crate) policy: Arc<dyn PolicySource>,
    pub(crate) store: Arc<dyn LeaseStore>,
    pool: Arc<dyn FreeAddressPool>,
    locks: AddressLocks,
    reaper: Mutex<Option<Reaper>>,
}

impl BindingManager {
    pub fn new(
        capabilities: BindingCapabilities,
        policy: Arc<dyn PolicySource>,
        store: Arc<dyn LeaseStore>,
        pool: Arc<dyn FreeAddressPool>,
    ) -> Self {
        Self {
            capabilities,
            policy,
            store,
            pool,
            locks: AddressLocks::new(),
            reaper: Mutex::new(None),
        }
    }

    pub fn capabilities(&self) -> &BindingCapabilities {
        &self.capabilities
    }

    pub fn ia_type(&self) -> IaType {
        self.capabilities.ia_type
    }

    /// The client gave the address back.
    ///
    /// Deletes the binding and reclaims the address if policy says to delete
    /// old bindings; otherwise marks it available with its lifetimes cleared.
    pub async fn release(&self, ia: &IdentityAssoc, binding: &IaAddress) -> TransitionOutcome {
        self.transition(Transition::Release, ia, binding).await
    }

    /// The client found the address in use on its link.
    ///
    /// Marks it declined with all times cleared. Never reclaims.
    pub async fn decline(&self, ia: &IdentityAssoc, binding: &IaAddress) -> TransitionOutcome {
        self.transition(Transition::Decline, ia, binding).await
    }

    /// The binding's valid lifetime ended. Driven by the reaper.
    ///
    /// A no-op if the stored binding is no longer expired.
    pub async fn expire(&self, ia: &IdentityAssoc, binding: &IaAddress) -> TransitionOutcome {
        self.transition(Transition::Expire, ia, binding).await
    }

    async fn transition(
        &self,
        transition: Transition,
        ia: &IdentityAssoc,
        binding: &IaAddress,
    ) -> TransitionOutcome {
        let address = binding.ip_address;
        let _guard = self.locks.lock(address).await;

        info!("{} address {} for {}", transition.progressive(), address, ia);

        match self.apply(transition, ia, binding).await {
            Ok(TransitionOutcome::Skipped) => {
                debug!("Nothing to {} for {}", transition, address);
                TransitionOutcome::Skipped
            }
            Ok(outcome) => {
                info!("Address {} {}: {:?}", address, transition, outcome);
                outcome
            }
            Err(error) => {
                error!(
                    "Failed to {} address {} for {}: {}",
                    transition, address, ia, error
                );
                TransitionOutcome::Failed
            }
        }
    }

    async fn apply(
        &self,
        transition: Transition,
        ia: &IdentityAssoc,
        binding: &IaAddress,
    ) -> Result<TransitionOutcome> {
        let address = binding.ip_address;

        let Some(owner) = self.store.find_owner(address).await? else {
            return Ok(TransitionOutcome::Skipped);
        };
        if owner.key() != ia.key() {
            warn!(
                "Ignoring {} of {} for {}: address now belongs to {}",
                transition, address, ia, owner
            );
            return Ok(TransitionOutcome::Skipped);
        }
        let Some(mut binding) = owner.address(address).cloned() else {
            return Ok(TransitionOutcome::Skipped);
        };
        if transition == Transition::Expire && !binding.is_expired_at(Utc::now()) {
            return Ok(TransitionOutcome::Skipped);
        }

        self.delete_dns_record(ia, &binding).await?;

        if transition.may_reclaim() && self.delete_old_bindings()? {
            debug!("Deleting {} binding for {}", transition, address);
            self.store.delete_binding(ia, &binding).await?;
            // the store no longer holds the address, so no second owner can
            // be recorded once the allocator hands it out again
            if let Err(error) = self.pool.reclaim(address).await {
                error!(
                    "Address {} deleted from the store but not returned to the pool, \
                     it is unallocatable until reclaimed by hand: {}",
                    address, error
                );
                return Err(error);
            }
            return Ok(TransitionOutcome::Deleted);
        }

        transition.reset(&mut binding);
        debug!("Updating {} binding: {}", transition, binding);
        self.store.update_binding(ia, &binding).await?;
        Ok(TransitionOutcome::Updated)
    }

    async fn delete_dns_record(&self, ia: &IdentityAssoc, binding: &IaAddress) -> Result<()> {
        let Err(error) = self.capabilities.ddns.delete_record(ia, binding).await else {
            return Ok(());
        };

        warn!(
            "DDNS delete failed for {} ({}): {}",
            binding.ip_address, ia, error
        );
        if self
            .policy
            .boolean(policy::DDNS_FAILURE_ABORTS)
            .unwrap_or(false)
        {
            return Err(error);
        }
        Ok(())
    }

    fn delete_old_bindings(&self) -> Result<bool> {
        match self.capabilities.delete_old_bindings {
            Some(delete) => Ok(delete),
            None => self.policy.boolean(policy::DELETE_OLD_BINDINGS),
        }
    }

    pub(crate) fn reaper_slot(&self) -> &Mutex<Option<Reaper>> {
        &self.reaper
    }
}

impl fmt::Debug for BindingManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingManager")
            .field("capabilities", &self.capabilities)
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, Harness, expired_binding, ip, leased_binding};

    #[tokio::test]
    async fn test_expire_deletes_then_reclaims() {
        let harness = Harness::new(true).await;
        let (ia, binding) = harness.bind(1, vec![expired_binding(5)]).await;

        let outcome = harness.manager.expire(&ia, &binding[0]).await;

        assert_eq!(outcome, TransitionOutcome::Deleted);
        assert_eq!(
            harness.calls(),
            vec![
                Call::DnsDelete(ip(5)),
                Call::StoreDelete(ip(5)),
                Call::Reclaim(ip(5)),
            ]
        );
        assert!(harness.stored(ip(5)).await.is_none());
        assert!(harness.pool.inner.contains(ip(5)));
    }

    #[tokio::test]
    async fn test_expire_resets_in_place() {
        let harness = Harness::new(false).await;
        let (ia, binding) = harness.bind(1, vec![expired_binding(5)]).await;

        let outcome = harness.manager.expire(&ia, &binding[0]).await;
        assert_eq!(outcome, TransitionOutcome::Updated);

        let stored = harness.stored(ip(5)).await.unwrap();
        assert_eq!(stored.state, BindingState::Available);
        assert_eq!(stored.valid_end_time, None);
        assert_eq!(stored.preferred_end_time, None);
        assert_eq!(stored.start_time, binding[0].start_time);

        let calls = harness.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], Call::DnsDelete(ip(5)));
        assert!(matches!(&calls[1], Call::StoreUpdate(updated) if *updated == stored));
        assert!(!harness.pool.inner.contains(ip(5)));
    }

    #[tokio::test]
    async fn test_second_expire_is_noop() {
        for delete in [true, false] {
            let harness = Harness::new(delete).await;
            let (ia, binding) = harness.bind(1, vec![expired_binding(5)]).await;

            harness.manager.expire(&ia, &binding[0]).await;
            let calls = harness.calls().len();

            let outcome = harness.manager.expire(&ia, &binding[0]).await;
            assert_eq!(outcome, TransitionOutcome::Skipped);
            assert_eq!(harness.calls().len(), calls);
        }
    }

    #[tokio::test]
    async fn test_expire_of_live_binding_is_skipped() {
        let harness = Harness::new(true).await;
        let (ia, binding) = harness.bind(1, vec![leased_binding(5)]).await;

        let outcome = harness.manager.expire(&ia, &binding[0]).await;
        assert_eq!(outcome, TransitionOutcome::Skipped);
        assert!(harness.calls().is_empty());
        assert!(harness.stored(ip(5)).await.is_some());
    }

    #[tokio::test]
    async fn test_release_with_delete() {
        let harness = Harness::new(true).await;
        let (ia, binding) = harness.bind(1, vec![leased_binding(5)]).await;

        let outcome = harness.manager.release(&ia, &binding[0]).await;

        assert_eq!(outcome, TransitionOutcome::Deleted);
        assert_eq!(
            harness.calls(),
            vec![
                Call::DnsDelete(ip(5)),
                Call::StoreDelete(ip(5)),
                Call::Reclaim(ip(5)),
            ]
        );
        assert!(harness.stored(ip(5)).await.is_none());
        assert!(harness.pool.inner.contains(ip(5)));
    }

    #[tokio::test]
    async fn test_release_resets_in_place() {
        let harness = Harness::new(false).await;
        let (ia, binding) = harness.bind(1, vec![leased_binding(5)]).await;

        let outcome = harness.manager.release(&ia, &binding[0]).await;
        assert_eq!(outcome, TransitionOutcome::Updated);

        let stored = harness.stored(ip(5)).await.unwrap();
        assert_eq!(stored.state, BindingState::Available);
        assert_eq!(stored.preferred_end_time, None);
        assert_eq!(stored.valid_end_time, None);
        assert!(stored.start_time.is_some());
        assert!(!harness.calls().contains(&Call::Reclaim(ip(5))));
    }

    #[tokio::test]
    async fn test_decline_never_reclaims() {
        for delete in [true, false] {
            let harness = Harness::new(delete).await;
            let (ia, binding) = harness.bind(1, vec![leased_binding(5)]).await;

            let outcome = harness.manager.decline(&ia, &binding[0]).await;
            assert_eq!(outcome, TransitionOutcome::Updated);

            let stored = harness.stored(ip(5)).await.unwrap();
            assert_eq!(stored.state, BindingState::Declined);
            assert_eq!(stored.start_time, None);
            assert_eq!(stored.preferred_end_time, None);
            assert_eq!(stored.valid_end_time, None);

            assert!(
                !harness
                    .calls()
                    .iter()
                    .any(|call| matches!(call, Call::Reclaim(_)))
            );
            assert!(!harness.pool.inner.contains(ip(5)));
        }
    }

    #[tokio::test]
    async fn test_dns_failure_does_not_block_transition() {
        let harness = Harness::builder(true).dns_fails().build().await;
        let (ia, binding) = harness.bind(1, vec![expired_binding(5)]).await;

        let outcome = harness.manager.expire(&ia, &binding[0]).await;

        assert_eq!(outcome, TransitionOutcome::Deleted);
        assert_eq!(
            harness.calls(),
            vec![
                Call::DnsDelete(ip(5)),
                Call::StoreDelete(ip(5)),
                Call::Reclaim(ip(5)),
            ]
        );
    }

    #[tokio::test]
    async fn test_dns_failure_aborts_when_configured() {
        let harness = Harness::builder(true)
            .dns_fails()
            .ddns_failure_aborts()
            .build()
            .await;
        let (ia, binding) = harness.bind(1, vec![leased_binding(5)]).await;

        let outcome = harness.manager.release(&ia, &binding[0]).await;

        assert_eq!(outcome, TransitionOutcome::Failed);
        assert_eq!(harness.calls(), vec![Call::DnsDelete(ip(5))]);
        assert!(harness.stored(ip(5)).await.is_some());
    }

    #[tokio::test]
    async fn test_store_failure_skips_reclaim() {
        let harness = Harness::builder(true).store_fails_for(ip(5)).build().await;
        let (ia, binding) = harness.bind(1, vec![leased_binding(5)]).await;

        let outcome = harness.manager.release(&ia, &binding[0]).await;

        assert_eq!(outcome, TransitionOutcome::Failed);
        assert!(
            !harness
                .calls()
                .iter()
                .any(|call| matches!(call, Call::Reclaim(_)))
        );
        assert!(!harness.pool.inner.contains(ip(5)));
        assert!(harness.stored(ip(5)).await.is_some());
    }

    #[tokio::test]
    async fn test_capability_overrides_policy() {
        let harness = Harness::builder(false)
            .capabilities(|capabilities| capabilities.with_delete_old_bindings(true))
            .build()
            .await;
        let (ia, binding) = harness.bind(1, vec![leased_binding(5)]).await;

        let outcome = harness.manager.release(&ia, &binding[0]).await;
        assert_eq!(outcome, TransitionOutcome::Deleted);
        assert!(harness.pool.inner.contains(ip(5)));
    }

    #[tokio::test]
    async fn test_concurrent_releases_under_one_identity() {
        let harness = Arc::new(Harness::new(false).await);
        let (ia, bindings) = harness
            .bind(1, vec![leased_binding(5), leased_binding(6)])
            .await;

        let mut handles = vec![];
        for binding in bindings {
            let harness = Arc::clone(&harness);
            let ia = ia.clone();
            handles.push(tokio::spawn(async move {
                harness.manager.release(&ia, &binding).await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), TransitionOutcome::Updated);
        }

        for last in [5, 6] {
            let stored = harness.stored(ip(last)).await.unwrap();
            assert_eq!(stored.state, BindingState::Available);
        }
    }

    #[tokio::test]
    async fn test_release_races_expire_on_same_address() {
        let harness = Arc::new(Harness::new(true).await);
        let (ia, bindings) = harness.bind(1, vec![expired_binding(5)]).await;
        let binding = bindings[0].clone();

        let release = {
            let harness = Arc::clone(&harness);
            let (ia, binding) = (ia.clone(), binding.clone());
            tokio::spawn(async move { harness.manager.release(&ia, &binding).await })
        };
        let expire = {
            let harness = Arc::clone(&harness);
            tokio::spawn(async move { harness.manager.expire(&ia, &binding).await })
        };

        let outcomes = [release.await.unwrap(), expire.await.unwrap()];
        let reclaims = harness
            .calls()
            .iter()
            .filter(|call| matches!(call, Call::Reclaim(_)))
            .count();
        assert_eq!(reclaims, 1);
        assert!(outcomes.contains(&TransitionOutcome::Deleted));
        assert!(harness.stored(ip(5)).await.is_none());
        assert!(harness.pool.inner.contains(ip(5)));
    }

    #[tokio::test]
    async fn test_stale_release_leaves_new_owner_alone() {
        let harness = Harness::new(true).await;
        let stale = IdentityAssoc {
            addresses: vec![leased_binding(5)],
            ..IdentityAssoc::new(vec![9, 9], IaType::V4, 7)
        };
        let current = harness
            .bind_other(vec![0, 1, 0, 1, 2], vec![leased_binding(5)])
            .await;

        let outcome = harness.manager.release(&stale, &stale.addresses[0]).await;

        assert_eq!(outcome, TransitionOutcome::Skipped);
        assert!(harness.calls().is_empty());
        assert!(!harness.pool.inner.contains(ip(5)));
        let stored = harness.stored(ip(5)).await.unwrap();
        assert_eq!(stored.state, BindingState::Leased);
        assert_eq!(stored, current.addresses[0]);
    }

    #[tokio::test]
    async fn test_stale_decline_leaves_new_owner_alone() {
        for delete in [true, false] {
            let harness = Harness::new(delete).await;
            let stale = IdentityAssoc {
                addresses: vec![leased_binding(5)],
                ..IdentityAssoc::new(vec![9, 9], IaType::V4, 7)
            };
            harness
                .bind_other(vec![0, 1, 0, 1, 2], vec![leased_binding(5)])
                .await;

            let outcome = harness.manager.decline(&stale, &stale.addresses[0]).await;

            assert_eq!(outcome, TransitionOutcome::Skipped);
            assert!(harness.calls().is_empty());
            let stored = harness.stored(ip(5)).await.unwrap();
            assert_eq!(stored.state, BindingState::Leased);
            assert!(stored.valid_end_time.is_some());
        }
    }

    #[tokio::test]
    async fn test_second_release_is_noop() {
        let harness = Harness::new(true).await;
        let (ia, binding) = harness.bind(1, vec![leased_binding(5)]).await;

        assert_eq!(
            harness.manager.release(&ia, &binding[0]).await,
            TransitionOutcome::Deleted
        );
        let calls = harness.calls().len();

        assert_eq!(
            harness.manager.release(&ia, &binding[0]).await,
            TransitionOutcome::Skipped
        );
        assert_eq!(harness.calls().len(), calls);
    }

    #[tokio::test]
    async fn test_reclaim_failure_is_reported() {
        let harness = Harness::builder(true).pool_fails().build().await;
        let (ia, binding) = harness.bind(1, vec![expired_binding(5)]).await;

        let outcome = harness.manager.expire(&ia, &binding[0]).await;

        assert_eq!(outcome, TransitionOutcome::Failed);
        assert_eq!(
            harness.calls(),
            vec![
                Call::DnsDelete(ip(5)),
                Call::StoreDelete(ip(5)),
                Call::Reclaim(ip(5)),
            ]
        );
        assert!(harness.stored(ip(5)).await.is_none());
        assert!(!harness.pool.inner.contains(ip(5)));
    }
}
