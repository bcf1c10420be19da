// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Node configuration.
//!
//! All values have defaults, so an empty TOML document is a valid config.
//!
//! ```toml
//! [dissemination]
//! rpc_timeout_ms = 1000
//! backoff_unit_ms = 1000
//! anti_entropy_interval_ms = 0
//!
//! [topology]
//! policy = "balanced"
//! branch_factor = 4
//! default_override = true
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topology::{DEFAULT_BRANCH_FACTOR, TopologyPolicy};

/// Error type for loading a [`Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("can not read config file")]
    Io(#[from] std::io::Error),
    #[error("can not parse config")]
    Parse(#[from] toml::de::Error),
}

/// Complete node configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub dissemination: DisseminationConfig,
    pub topology: TopologyConfig,
}

/// Parameters of the per-neighbor delivery loop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisseminationConfig {
    /// Time to wait for an acknowledgement before an attempt counts as failed.
    pub rpc_timeout_ms: u64,
    /// After the `n`-th failed attempt the delivery task sleeps `n` times this long.
    pub backoff_unit_ms: u64,
    /// Period for pushing all known values to neighbors as a batch, `0` disables it.
    pub anti_entropy_interval_ms: u64,
}

impl Default for DisseminationConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: 1000,
            backoff_unit_ms: 1000,
            anti_entropy_interval_ms: 0,
        }
    }
}

impl DisseminationConfig {
    #[must_use]
    pub const fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    #[must_use]
    pub const fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }

    #[must_use]
    pub const fn anti_entropy_interval(&self) -> Option<Duration> {
        match self.anti_entropy_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

/// Parameters for computing topologies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Computed policy used when a topology request asks for an override.
    pub policy: TopologyPolicy,
    /// Group size for the balanced topology.
    pub branch_factor: usize,
    /// Whether to override when the request does not say.
    pub default_override: bool,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            policy: TopologyPolicy::Balanced,
            branch_factor: DEFAULT_BRANCH_FACTOR,
            default_override: true,
        }
    }
}

impl TopologyConfig {
    /// Resolves the policy for a topology request with the given override flag.
    #[must_use]
    pub fn resolve(&self, override_topology: Option<bool>) -> TopologyPolicy {
        if override_topology.unwrap_or(self.default_override) {
            self.policy
        } else {
            TopologyPolicy::Supplied
        }
    }
}

impl Config {
    /// Parses a config from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if `toml` is not a valid config.
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml)?)
    }

    /// Loads a config from the TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file can not be read and
    /// [`ConfigError::Parse`] if its content is not a valid config.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Turns this config into one with different delivery timings.
    #[must_use]
    pub const fn with_timings(mut self, rpc_timeout_ms: u64, backoff_unit_ms: u64) -> Self {
        self.dissemination.rpc_timeout_ms = rpc_timeout_ms;
        self.dissemination.backoff_unit_ms = backoff_unit_ms;
        self
    }
}
