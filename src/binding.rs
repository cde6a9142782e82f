//! Persisted binding records.
//!
//! An [`IdentityAssoc`] is a client's identity plus the address bindings it
//! currently holds. Each [`IaAddress`] is one leased (or formerly leased)
//! address and carries the timestamps the state machine clears on
//! transitions.

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Formats client identifier bytes as a colon-separated hex string.
pub fn format_duid(duid: &[u8]) -> String {
    duid.iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(":")
}

/// Identity-association type discriminant.
///
/// One binding manager handles exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum IaType {
    /// DHCPv6 non-temporary address.
    Na = 1,
    /// DHCPv6 temporary address.
    Ta = 2,
    /// DHCPv6 prefix delegation.
    Pd = 3,
    /// DHCPv4 address.
    V4 = 4,
}

impl fmt::Display for IaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Na => write!(f, "NA"),
            Self::Ta => write!(f, "TA"),
            Self::Pd => write!(f, "PD"),
            Self::V4 => write!(f, "V4"),
        }
    }
}

impl std::str::FromStr for IaType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "na" => Ok(Self::Na),
            "ta" => Ok(Self::Ta),
            "pd" => Ok(Self::Pd),
            "v4" => Ok(Self::V4),
            other => Err(format!("unknown IA type: {}", other)),
        }
    }
}

/// Lifecycle state of one address binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingState {
    /// Free to be handed out again.
    Available,
    /// Offered/advertised to a client, not yet committed.
    Offered,
    /// Committed to a client.
    Leased,
    /// Reported in use by another host; held out of the pool.
    Declined,
}

impl BindingState {
    /// Returns true for the states the allocator treats as bound.
    pub fn is_bound(self) -> bool {
        matches!(self, Self::Offered | Self::Leased)
    }
}

impl fmt::Display for BindingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::Offered => write!(f, "offered"),
            Self::Leased => write!(f, "leased"),
            Self::Declined => write!(f, "declined"),
        }
    }
}

/// One address binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IaAddress {
    pub ip_address: IpAddr,
    pub state: BindingState,
    pub start_time: Option<DateTime<Utc>>,
    pub preferred_end_time: Option<DateTime<Utc>>,
    /// `None` means no expiration is tracked.
    pub valid_end_time: Option<DateTime<Utc>>,
}

impl IaAddress {
    /// Creates a leased binding starting now.
    pub fn leased(
        ip_address: IpAddr,
        preferred_lifetime: chrono::TimeDelta,
        valid_lifetime: chrono::TimeDelta,
    ) -> Self {
        let now = Utc::now();
        Self {
            ip_address,
            state: BindingState::Leased,
            start_time: Some(now),
            preferred_end_time: Some(now + preferred_lifetime),
            valid_end_time: Some(now + valid_lifetime),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.state.is_bound()
    }

    /// Returns true if the binding is bound and its valid lifetime ended at
    /// or before `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.is_bound()
            && self
                .valid_end_time
                .is_some_and(|valid_end| valid_end <= now)
    }

    /// Returns seconds remaining until the valid lifetime ends, or 0 if it
    /// has ended or is not tracked.
    pub fn remaining_seconds(&self) -> i64 {
        self.valid_end_time
            .map(|valid_end| (valid_end - Utc::now()).num_seconds().max(0))
            .unwrap_or(0)
    }
}

impl fmt::Display for IaAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.ip_address, self.state)?;
        if let Some(valid_end) = self.valid_end_time {
            write!(f, " valid until {}", valid_end.format("%Y-%m-%d %H:%M:%S UTC"))?;
        }
        Ok(())
    }
}

/// A client's identity association and its bindings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityAssoc {
    pub duid: Vec<u8>,
    pub ia_type: IaType,
    pub iaid: u32,
    #[serde(default)]
    pub addresses: Vec<IaAddress>,
}

impl IdentityAssoc {
    pub fn new(duid: Vec<u8>, ia_type: IaType, iaid: u32) -> Self {
        Self {
            duid,
            ia_type,
            iaid,
            addresses: Vec::new(),
        }
    }

    /// Stable key for this identity: `duid/type/iaid`.
    pub fn key(&self) -> String {
        format!("{}/{}/{}", format_duid(&self.duid), self.ia_type, self.iaid)
    }

    pub fn address(&self, ip_address: IpAddr) -> Option<&IaAddress> {
        self.addresses
            .iter()
            .find(|binding| binding.ip_address == ip_address)
    }
}

impl fmt::Display for IdentityAssoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "duid={} type={} iaid={}",
            format_duid(&self.duid),
            self.ia_type,
            self.iaid
        )
    }
}
