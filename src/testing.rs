//! Recording collaborators shared by the manager and reaper tests.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::binding::{IaAddress, IaType, IdentityAssoc};
use crate::config::Config;
use crate::ddns::DnsUpdater;
use crate::error::{Error, Result};
use crate::manager::{BindingCapabilities, BindingManager};
use crate::pool::{FreeAddressPool, FreeAddressSet};
use crate::store::{BindingStore, LeaseStore};

pub(crate) fn ip(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
}

pub(crate) fn leased_binding(last: u8) -> IaAddress {
    IaAddress::leased(ip(last), TimeDelta::seconds(1800), TimeDelta::seconds(3600))
}

pub(crate) fn expired_binding(last: u8) -> IaAddress {
    let mut binding = leased_binding(last);
    binding.preferred_end_time = Some(Utc::now() - TimeDelta::seconds(2));
    binding.valid_end_time = Some(Utc::now() - TimeDelta::seconds(1));
    binding
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    DnsDelete(IpAddr),
    StoreDelete(IpAddr),
    StoreUpdate(IaAddress),
    Reclaim(IpAddr),
}

type Journal = Arc<Mutex<Vec<Call>>>;

fn record(journal: &Journal, call: Call) {
    journal.lock().unwrap().push(call);
}

pub(crate) struct RecordingStore {
    pub(crate) inner: BindingStore,
    journal: Journal,
    failing: HashSet<IpAddr>,
    fail_queries: bool,
}

#[async_trait]
impl LeaseStore for RecordingStore {
    async fn get_binding(&self, ip_address: IpAddr) -> Result<Option<IaAddress>> {
        self.inner.get_binding(ip_address).await
    }

    async fn find_owner(&self, ip_address: IpAddr) -> Result<Option<IdentityAssoc>> {
        self.inner.find_owner(ip_address).await
    }

    async fn delete_binding(&self, ia: &IdentityAssoc, binding: &IaAddress) -> Result<()> {
        record(&self.journal, Call::StoreDelete(binding.ip_address));
        if self.failing.contains(&binding.ip_address) {
            return Err(Error::Store("injected delete failure".to_string()));
        }
        self.inner.delete_binding(ia, binding).await
    }

    async fn update_binding(&self, ia: &IdentityAssoc, binding: &IaAddress) -> Result<()> {
        record(&self.journal, Call::StoreUpdate(binding.clone()));
        if self.failing.contains(&binding.ip_address) {
            return Err(Error::Store("injected update failure".to_string()));
        }
        self.inner.update_binding(ia, binding).await
    }

    async fn find_expired(
        &self,
        ia_type: IaType,
        now: DateTime<Utc>,
    ) -> Result<Vec<IdentityAssoc>> {
        if self.fail_queries {
            return Err(Error::Store("injected query failure".to_string()));
        }
        self.inner.find_expired(ia_type, now).await
    }
}

pub(crate) struct RecordingPool {
    pub(crate) inner: FreeAddressSet,
    journal: Journal,
    fails: bool,
}

#[async_trait]
impl FreeAddressPool for RecordingPool {
    async fn reclaim(&self, address: IpAddr) -> Result<()> {
        record(&self.journal, Call::Reclaim(address));
        if self.fails {
            return Err(Error::Pool(format!("injected reclaim failure for {}", address)));
        }
        self.inner.reclaim(address).await
    }
}

struct RecordingDns {
    journal: Journal,
    fails: bool,
}

#[async_trait]
impl DnsUpdater for RecordingDns {
    async fn delete_record(&self, _ia: &IdentityAssoc, binding: &IaAddress) -> Result<()> {
        record(&self.journal, Call::DnsDelete(binding.ip_address));
        if self.fails {
            return Err(Error::Dns("injected DNS failure".to_string()));
        }
        Ok(())
    }
}

pub(crate) struct Harness {
    pub(crate) manager: Arc<BindingManager>,
    pub(crate) store: Arc<RecordingStore>,
    pub(crate) pool: Arc<RecordingPool>,
    journal: Journal,
}

type CapabilitiesFn = Box<dyn FnOnce(BindingCapabilities) -> BindingCapabilities>;

pub(crate) struct HarnessBuilder {
    config: Config,
    dns_fails: bool,
    failing: HashSet<IpAddr>,
    fail_queries: bool,
    pool_fails: bool,
    capabilities: Option<CapabilitiesFn>,
}

impl HarnessBuilder {
    pub(crate) fn dns_fails(mut self) -> Self {
        self.dns_fails = true;
        self
    }

    pub(crate) fn ddns_failure_aborts(mut self) -> Self {
        self.config.ddns_failure_aborts = true;
        self
    }

    pub(crate) fn store_fails_for(mut self, address: IpAddr) -> Self {
        self.failing.insert(address);
        self
    }

    pub(crate) fn pool_fails(mut self) -> Self {
        self.pool_fails = true;
        self
    }

    pub(crate) fn queries_fail(mut self) -> Self {
        self.fail_queries = true;
        self
    }

    pub(crate) fn run_period_ms(mut self, period: u64) -> Self {
        self.config.reaper_run_period_ms = period;
        self
    }

    pub(crate) fn capabilities(
        mut self,
        adjust: impl FnOnce(BindingCapabilities) -> BindingCapabilities + 'static,
    ) -> Self {
        self.capabilities = Some(Box::new(adjust));
        self
    }

    pub(crate) async fn build(self) -> Harness {
        let journal: Journal = Arc::default();
        let store = Arc::new(RecordingStore {
            inner: BindingStore::in_memory(),
            journal: Arc::clone(&journal),
            failing: self.failing,
            fail_queries: self.fail_queries,
        });
        let pool = Arc::new(RecordingPool {
            inner: FreeAddressSet::new([]),
            journal: Arc::clone(&journal),
            fails: self.pool_fails,
        });
        let ddns = Arc::new(RecordingDns {
            journal: Arc::clone(&journal),
            fails: self.dns_fails,
        });

        let mut capabilities = BindingCapabilities::new(IaType::V4).with_ddns(ddns);
        if let Some(adjust) = self.capabilities {
            capabilities = adjust(capabilities);
        }

        let manager = Arc::new(BindingManager::new(
            capabilities,
            Arc::new(self.config),
            Arc::clone(&store) as Arc<dyn LeaseStore>,
            Arc::clone(&pool) as Arc<dyn FreeAddressPool>,
        ));

        Harness {
            manager,
            store,
            pool,
            journal,
        }
    }
}

impl Harness {
    pub(crate) async fn new(delete_old_bindings: bool) -> Self {
        Self::builder(delete_old_bindings).build().await
    }

    pub(crate) fn builder(delete_old_bindings: bool) -> HarnessBuilder {
        HarnessBuilder {
            config: Config {
                delete_old_bindings,
                pools: Vec::new(),
                ..Config::default()
            },
            dns_fails: false,
            failing: HashSet::new(),
            fail_queries: false,
            pool_fails: false,
            capabilities: None,
        }
    }

    /// Stores a V4 identity holding `addresses` without recording anything.
    pub(crate) async fn bind(
        &self,
        id: u8,
        addresses: Vec<IaAddress>,
    ) -> (IdentityAssoc, Vec<IaAddress>) {
        self.bind_typed(id, IaType::V4, addresses).await
    }

    pub(crate) async fn bind_typed(
        &self,
        id: u8,
        ia_type: IaType,
        addresses: Vec<IaAddress>,
    ) -> (IdentityAssoc, Vec<IaAddress>) {
        let ia = IdentityAssoc {
            addresses: addresses.clone(),
            ..IdentityAssoc::new(vec![0, 1, 0, 1, id], ia_type, u32::from(id))
        };
        self.store
            .inner
            .put_identity_assoc(ia.clone())
            .await
            .unwrap();
        (ia, addresses)
    }

    /// Stores an identity for another client without recording anything.
    pub(crate) async fn bind_other(
        &self,
        duid: Vec<u8>,
        addresses: Vec<IaAddress>,
    ) -> IdentityAssoc {
        let ia = IdentityAssoc {
            addresses,
            ..IdentityAssoc::new(duid, IaType::V4, 99)
        };
        self.store
            .inner
            .put_identity_assoc(ia.clone())
            .await
            .unwrap();
        ia
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.journal.lock().unwrap().clone()
    }

    pub(crate) async fn stored(&self, address: IpAddr) -> Option<IaAddress> {
        self.store.inner.get_binding(address).await.unwrap()
    }
}
