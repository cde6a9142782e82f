//! Named policy lookup.
//!
//! The binding manager reads its tunables through [`PolicySource`] so that
//! the embedding server can back them with whatever configuration system it
//! already has. [`Config`](crate::Config) is the stock implementation.

use std::time::Duration;

use crate::error::{Error, Result};

/// Delay before the reaper's first run.
pub const REAPER_STARTUP_DELAY: &str = "binding.manager.reaper.startup.delay";

/// Period between reaper runs.
pub const REAPER_RUN_PERIOD: &str = "binding.manager.reaper.run.period";

/// Whether released/expired bindings are deleted (and their address
/// reclaimed) instead of being reset to available in place.
pub const DELETE_OLD_BINDINGS: &str = "binding.manager.delete.old.bindings";

/// Whether a failed DNS record deletion aborts the transition.
pub const DDNS_FAILURE_ABORTS: &str = "binding.manager.ddns.failure.aborts";

/// A typed policy value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyValue {
    Duration(Duration),
    Bool(bool),
}

/// Read-only, process-wide policy lookup.
pub trait PolicySource: Send + Sync {
    /// Returns the value for `name`, or `None` if the policy is unknown.
    fn get(&self, name: &str) -> Option<PolicyValue>;

    /// Looks up a duration policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Policy`] if the name is unknown or not a duration.
    fn duration(&self, name: &str) -> Result<Duration> {
        match self.get(name) {
            Some(PolicyValue::Duration(duration)) => Ok(duration),
            Some(other) => Err(Error::Policy(format!(
                "{} is not a duration: {:?}",
                name, other
            ))),
            None => Err(Error::Policy(format!("unknown policy {}", name))),
        }
    }

    /// Looks up a boolean policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Policy`] if the name is unknown or not a boolean.
    fn boolean(&self, name: &str) -> Result<bool> {
        match self.get(name) {
            Some(PolicyValue::Bool(value)) => Ok(value),
            Some(other) => Err(Error::Policy(format!(
                "{} is not a boolean: {:?}",
                name, other
            ))),
            None => Err(Error::Policy(format!("unknown policy {}", name))),
        }
    }
}
