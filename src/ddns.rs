//! DNS record cleanup for bindings leaving the bound state.

use async_trait::async_trait;
use tracing::debug;

use crate::binding::{IaAddress, IdentityAssoc};
use crate::error::Result;

/// Removes the DNS records registered for a binding.
///
/// Called before every release, decline and expire. Failures are reported
/// as [`Error::Dns`](crate::Error::Dns).
#[async_trait]
pub trait DnsUpdater: Send + Sync {
    async fn delete_record(&self, ia: &IdentityAssoc, binding: &IaAddress) -> Result<()>;
}

/// A [`DnsUpdater`] for servers without dynamic DNS.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDnsUpdater;

#[async_trait]
impl DnsUpdater for NoopDnsUpdater {
    async fn delete_record(&self, ia: &IdentityAssoc, binding: &IaAddress) -> Result<()> {
        debug!(
            "DDNS disabled, nothing to delete for {} ({})",
            binding.ip_address, ia
        );
        Ok(())
    }
}
