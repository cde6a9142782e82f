//! # dhcpbinding
//!
//! The address-binding lifecycle of a DHCP server: what happens to a leased
//! address when the client releases or declines it, or when its lease runs
//! out.
//!
//! ## Features
//!
//! - Release, decline and expire transitions sharing one executor
//! - DNS record cleanup before every transition
//! - Delete-and-reclaim or reset-in-place, chosen by policy
//! - A background reaper that expires bindings on a schedule
//! - Per-address serialization of transitions
//! - Per-reply binding views with requested-option filtering
//! - JSON persistence of bindings
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use dhcpbinding::{
//!     BindingCapabilities, BindingManager, BindingStore, Config, FreeAddressSet, IaType,
//! };
//!
//! #[tokio::main]
//! async fn main() -> dhcpbinding::Result<()> {
//!     let config = Arc::new(Config::load_or_create("config.json").await?);
//!     let store = Arc::new(BindingStore::open(&config.bindings_file).await?);
//!     let pool = Arc::new(FreeAddressSet::new([]));
//!
//!     let manager = Arc::new(BindingManager::new(
//!         BindingCapabilities::new(IaType::V4),
//!         config,
//!         store,
//!         pool,
//!     ));
//!     manager.start().await?;
//!     // ... serve clients, calling manager.release()/decline() ...
//!     manager.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`BindingManager`] - The state machine and owner of the reaper
//! - [`LeaseStore`] / [`BindingStore`] - Binding persistence
//! - [`DnsUpdater`] - DNS record cleanup
//! - [`FreeAddressPool`] / [`FreeAddressSet`] - Where freed addresses go
//! - [`PolicySource`] / [`Config`] - Tunables
//! - [`BindingView`] - What a reply is built from

pub mod binding;
pub mod config;
pub mod ddns;
pub mod error;
pub mod locks;
pub mod manager;
pub mod options;
pub mod policy;
pub mod pool;
pub mod reaper;
pub mod store;
pub mod view;

#[cfg(test)]
mod testing;

pub use binding::{BindingState, IaAddress, IaType, IdentityAssoc};
pub use config::{Config, PoolConfig};
pub use ddns::{DnsUpdater, NoopDnsUpdater};
pub use error::{Error, Result};
pub use manager::{BindingCapabilities, BindingManager, TransitionOutcome};
pub use options::DhcpOption;
pub use policy::{PolicySource, PolicyValue};
pub use pool::{FreeAddressPool, FreeAddressSet};
pub use reaper::ReapSummary;
pub use store::{BindingStore, LeaseStore};
pub use view::BindingView;
