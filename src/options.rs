//! Configured DHCP option values.
//!
//! Options are the values an operator attaches to a pool, an identity
//! association, or an address. They are keyed by their integer option code
//! and filtered against the client's request list when a
//! [`BindingView`](crate::BindingView) is built. Encoding them onto the wire
//! is the reply builder's job, not this crate's.

use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

/// Option codes this crate names explicitly (RFC 2132).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum OptionCode {
    SubnetMask = 1,
    Router = 3,
    DnsServer = 6,
    DomainName = 15,
    InterfaceMtu = 26,
    BroadcastAddress = 28,
    LeaseTime = 51,
    MessageType = 53,
    ServerIdentifier = 54,
    RenewalTime = 58,
    RebindingTime = 59,
}

/// Options sent regardless of the client's request list.
pub const MANDATORY_OPTION_CODES: [u16; 5] = [
    OptionCode::LeaseTime as u16,
    OptionCode::MessageType as u16,
    OptionCode::ServerIdentifier as u16,
    OptionCode::RenewalTime as u16,
    OptionCode::RebindingTime as u16,
];

/// A configured option value.
///
/// Options without a dedicated variant are carried as
/// [`Other`](Self::Other) with their raw code and data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "option", content = "value", rename_all = "snake_case")]
pub enum DhcpOption {
    /// Subnet mask (Option 1).
    SubnetMask(Ipv4Addr),
    /// Router/gateway addresses (Option 3).
    Router(Vec<Ipv4Addr>),
    /// DNS server addresses (Option 6).
    DnsServer(Vec<IpAddr>),
    /// Domain name for client DNS resolution (Option 15).
    DomainName(String),
    /// Interface MTU (Option 26).
    InterfaceMtu(u16),
    /// Broadcast address (Option 28).
    BroadcastAddress(Ipv4Addr),
    /// Lease time in seconds (Option 51).
    LeaseTime(u32),
    /// Server identifier (Option 54).
    ServerIdentifier(IpAddr),
    /// Renewal time T1 in seconds (Option 58).
    RenewalTime(u32),
    /// Rebinding time T2 in seconds (Option 59).
    RebindingTime(u32),
    /// Any other option, by code.
    Other { code: u16, data: Vec<u8> },
}

impl DhcpOption {
    /// Returns the option code for this option.
    pub fn option_code(&self) -> u16 {
        match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask as u16,
            Self::Router(_) => OptionCode::Router as u16,
            Self::DnsServer(_) => OptionCode::DnsServer as u16,
            Self::DomainName(_) => OptionCode::DomainName as u16,
            Self::InterfaceMtu(_) => OptionCode::InterfaceMtu as u16,
            Self::BroadcastAddress(_) => OptionCode::BroadcastAddress as u16,
            Self::LeaseTime(_) => OptionCode::LeaseTime as u16,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier as u16,
            Self::RenewalTime(_) => OptionCode::RenewalTime as u16,
            Self::RebindingTime(_) => OptionCode::RebindingTime as u16,
            Self::Other { code, .. } => *code,
        }
    }
}

/// Returns true if an option with `code` should be sent to a client whose
/// request list is `requested`.
///
/// With no request list every option is sent.
pub fn is_requested(code: u16, requested: Option<&[u16]>) -> bool {
    let Some(requested) = requested else {
        return true;
    };
    MANDATORY_OPTION_CODES.contains(&code) || requested.contains(&code)
}
