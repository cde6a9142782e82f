//! Per-reply view of a binding.
//!
//! A [`BindingView`] pairs a snapshot of a stored binding with the pool
//! configuration it belongs to and the options the reply should carry. It
//! is built for one reply and thrown away; it never writes back to the store,
//! so any number of views of the same binding can coexist.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::binding::{BindingState, IaAddress};
use crate::config::{Config, PoolConfig};
use crate::options::{DhcpOption, is_requested};

/// Options keyed by option code.
pub type OptionMap = BTreeMap<u16, DhcpOption>;

#[derive(Debug, Clone)]
pub struct BindingView {
    binding: IaAddress,
    config: Arc<PoolConfig>,
    options: OptionMap,
    ia_options: OptionMap,
    address_options: OptionMap,
}

impl BindingView {
    /// Builds a view of `binding` in `config`'s pool.
    ///
    /// Each option level is filtered to `requested` plus the mandatory
    /// options; `None` keeps everything configured. When a level lists the
    /// same code twice the later entry wins.
    pub fn new(binding: &IaAddress, config: Arc<PoolConfig>, requested: Option<&[u16]>) -> Self {
        let options = option_map(&config.options, requested);
        let ia_options = option_map(&config.ia_options, requested);
        let address_options = option_map(&config.address_options, requested);

        Self {
            binding: binding.clone(),
            config,
            options,
            ia_options,
            address_options,
        }
    }

    /// Finds the pool for `binding` in `config` and builds a view in it.
    ///
    /// Returns `None` if no configured pool contains the address.
    pub fn resolve(config: &Config, binding: &IaAddress, requested: Option<&[u16]>) -> Option<Self> {
        let pool = config.pool_for(binding.ip_address)?;
        Some(Self::new(binding, Arc::new(pool.clone()), requested))
    }

    pub fn binding(&self) -> &IaAddress {
        &self.binding
    }

    pub fn ip_address(&self) -> IpAddr {
        self.binding.ip_address
    }

    pub fn state(&self) -> BindingState {
        self.binding.state
    }

    pub fn config(&self) -> &Arc<PoolConfig> {
        &self.config
    }

    /// Pool-level options.
    pub fn options(&self) -> &OptionMap {
        &self.options
    }

    /// Identity-association-level options.
    pub fn ia_options(&self) -> &OptionMap {
        &self.ia_options
    }

    /// Address-level options.
    pub fn address_options(&self) -> &OptionMap {
        &self.address_options
    }

    pub fn preferred_lifetime(&self) -> Duration {
        self.config.preferred_lifetime()
    }

    pub fn valid_lifetime(&self) -> Duration {
        self.config.valid_lifetime()
    }

    /// All three levels merged, the most specific level winning per code.
    pub fn merged_options(&self) -> BTreeMap<u16, &DhcpOption> {
        let mut merged = BTreeMap::new();
        for level in [&self.options, &self.ia_options, &self.address_options] {
            for (code, option) in level {
                merged.insert(*code, option);
            }
        }
        merged
    }
}

fn option_map(options: &[DhcpOption], requested: Option<&[u16]>) -> OptionMap {
    options
        .iter()
        .filter(|option| is_requested(option.option_code(), requested))
        .map(|option| (option.option_code(), option.clone()))
        .collect()
}
