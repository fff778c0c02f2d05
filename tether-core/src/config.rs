//! Engine configuration.
//!
//! All timings that govern leases and waiting live here. The defaults suit a
//! cluster on a local network; tests usually shorten them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ReactiveError, Result};

/// Timing knobs for one node's reactive engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactiveConfig {
    /// How long an execution waits for a dependency's first value before it
    /// gives up and keeps its previous result.
    pub dependency_timeout: Duration,

    /// Lifetime of a push-side edge that is not renewed.
    pub lease: Duration,

    /// Period at which a cache entry renews its lease with the producing node.
    pub renewal_interval: Duration,

    /// Period at which a node drops expired push-side edges.
    pub sweep_interval: Duration,
}

impl Default for ReactiveConfig {
    fn default() -> Self {
        Self {
            dependency_timeout: Duration::from_secs(5),
            lease: Duration::from_secs(30),
            renewal_interval: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(15),
        }
    }
}

impl ReactiveConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_dependency_timeout(mut self, timeout: Duration) -> Self {
        self.dependency_timeout = timeout;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_renewal_interval(mut self, interval: Duration) -> Self {
        self.renewal_interval = interval;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Check that the timings are usable.
    ///
    /// A lease must outlive at least one renewal period, otherwise every edge
    /// would expire between keep-alives.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("dependency_timeout", self.dependency_timeout),
            ("lease", self.lease),
            ("renewal_interval", self.renewal_interval),
            ("sweep_interval", self.sweep_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ReactiveError::Config(format!("{name} must be non-zero")));
            }
        }
        if self.renewal_interval >= self.lease {
            return Err(ReactiveError::Config(format!(
                "renewal_interval ({:?}) must be shorter than lease ({:?})",
                self.renewal_interval, self.lease
            )));
        }
        Ok(())
    }
}
