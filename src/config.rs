use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::options::DhcpOption;
use crate::policy::{self, PolicySource, PolicyValue};

/// Largest pool range accepted, in addresses. Pools are enumerated into the
/// free set at startup.
pub const MAX_POOL_SIZE: u128 = 1 << 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Delay before the first reaper run (`binding.manager.reaper.startup.delay`).
    pub reaper_startup_delay_ms: u64,
    /// Interval between reaper runs (`binding.manager.reaper.run.period`).
    pub reaper_run_period_ms: u64,
    /// Delete released and expired bindings and reclaim their addresses
    /// instead of resetting them in place (`binding.manager.delete.old.bindings`).
    pub delete_old_bindings: bool,
    /// Abort a transition when DNS record deletion fails
    /// (`binding.manager.ddns.failure.aborts`).
    #[serde(default)]
    pub ddns_failure_aborts: bool,
    pub bindings_file: String,
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
}

/// An address pool and the options configured at each level for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    /// First address of the range, inclusive.
    pub range_start: IpAddr,
    /// Last address of the range, inclusive.
    pub range_end: IpAddr,
    pub preferred_lifetime_seconds: u32,
    pub valid_lifetime_seconds: u32,
    /// Pool-level options.
    #[serde(default)]
    pub options: Vec<DhcpOption>,
    /// Identity-association-level options.
    #[serde(default)]
    pub ia_options: Vec<DhcpOption>,
    /// Address-level options.
    #[serde(default)]
    pub address_options: Vec<DhcpOption>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reaper_startup_delay_ms: 10_000,
            reaper_run_period_ms: 60_000,
            delete_old_bindings: false,
            ddns_failure_aborts: false,
            bindings_file: "bindings.json".to_string(),
            pools: vec![PoolConfig {
                name: "default".to_string(),
                range_start: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 100)),
                range_end: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 200)),
                preferred_lifetime_seconds: 3600,
                valid_lifetime_seconds: 86400,
                options: vec![
                    DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0)),
                    DhcpOption::Router(vec![Ipv4Addr::new(192, 168, 1, 1)]),
                    DhcpOption::DnsServer(vec![
                        IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
                        IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)),
                    ]),
                ],
                ia_options: Vec::new(),
                address_options: Vec::new(),
            }],
        }
    }
}

impl Config {
    pub async fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.reaper_run_period_ms == 0 {
            return Err(Error::InvalidConfig(
                "reaper_run_period_ms must be greater than 0".to_string(),
            ));
        }

        for pool in &self.pools {
            pool.validate()?;
        }

        for (index, pool) in self.pools.iter().enumerate() {
            for other in &self.pools[index + 1..] {
                if pool.contains(other.range_start)
                    || pool.contains(other.range_end)
                    || other.contains(pool.range_start)
                {
                    return Err(Error::InvalidConfig(format!(
                        "pools {} and {} overlap",
                        pool.name, other.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Returns the pool that contains `ip`, if any.
    pub fn pool_for(&self, ip: IpAddr) -> Option<&PoolConfig> {
        self.pools.iter().find(|pool| pool.contains(ip))
    }

    pub fn reaper_startup_delay(&self) -> Duration {
        Duration::from_millis(self.reaper_startup_delay_ms)
    }

    pub fn reaper_run_period(&self) -> Duration {
        Duration::from_millis(self.reaper_run_period_ms)
    }
}

impl PolicySource for Config {
    fn get(&self, name: &str) -> Option<PolicyValue> {
        match name {
            policy::REAPER_STARTUP_DELAY => {
                Some(PolicyValue::Duration(self.reaper_startup_delay()))
            }
            policy::REAPER_RUN_PERIOD => Some(PolicyValue::Duration(self.reaper_run_period())),
            policy::DELETE_OLD_BINDINGS => Some(PolicyValue::Bool(self.delete_old_bindings)),
            policy::DDNS_FAILURE_ABORTS => Some(PolicyValue::Bool(self.ddns_failure_aborts)),
            _ => None,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        let Some((start, end)) = ordinal_in_family(self.range_start, self.range_end) else {
            return Err(Error::InvalidConfig(format!(
                "pool {} mixes IPv4 and IPv6 bounds",
                self.name
            )));
        };

        if start > end {
            return Err(Error::InvalidConfig(format!(
                "pool {}: range_start must be less than or equal to range_end",
                self.name
            )));
        }

        if end - start >= MAX_POOL_SIZE {
            return Err(Error::InvalidConfig(format!(
                "pool {} spans {} addresses, more than the maximum of {}",
                self.name,
                (end - start).saturating_add(1),
                MAX_POOL_SIZE
            )));
        }

        if self.preferred_lifetime_seconds == 0 {
            return Err(Error::InvalidConfig(format!(
                "pool {}: preferred_lifetime_seconds must be greater than 0",
                self.name
            )));
        }

        if self.valid_lifetime_seconds < self.preferred_lifetime_seconds {
            return Err(Error::InvalidConfig(format!(
                "pool {}: valid_lifetime_seconds must not be less than preferred_lifetime_seconds",
                self.name
            )));
        }

        Ok(())
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (
            ordinal_in_family(self.range_start, ip),
            ordinal_in_family(self.range_end, ip),
        ) {
            (Some((start, addr)), Some((end, _))) => addr >= start && addr <= end,
            _ => false,
        }
    }

    pub fn preferred_lifetime(&self) -> Duration {
        Duration::from_secs(u64::from(self.preferred_lifetime_seconds))
    }

    pub fn valid_lifetime(&self) -> Duration {
        Duration::from_secs(u64::from(self.valid_lifetime_seconds))
    }

    /// Iterates every address in the pool range. [`PoolConfig::validate`]
    /// bounds its length by [`MAX_POOL_SIZE`].
    pub fn addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        let (start, end) = ordinal_in_family(self.range_start, self.range_end).unwrap_or((1, 0));
        let v4 = self.range_start.is_ipv4();
        (start..=end).map(move |ordinal| {
            if v4 {
                IpAddr::V4(Ipv4Addr::from(ordinal as u32))
            } else {
                IpAddr::V6(ordinal.into())
            }
        })
    }
}

/// Numeric positions of two addresses, or `None` if their families differ.
fn ordinal_in_family(bound: IpAddr, ip: IpAddr) -> Option<(u128, u128)> {
    match (bound, ip) {
        (IpAddr::V4(bound), IpAddr::V4(ip)) => {
            Some((u128::from(u32::from(bound)), u128::from(u32::from(ip))))
        }
        (IpAddr::V6(bound), IpAddr::V6(ip)) => Some((u128::from(bound), u128::from(ip))),
        _ => None,
    }
}
