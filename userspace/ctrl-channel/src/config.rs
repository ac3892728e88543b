// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Channel factory configuration.
//!
//! ```toml
//! response_timeout_ms = 20000
//! idle_wait_ms = 1000
//! virqs = [4]
//! thread_name = "ctrl-channel-factory"
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use ctrl_abi::Virq;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 20_000;
const DEFAULT_IDLE_WAIT_MS: u64 = 1_000;

/// Tunables for a [`crate::ChannelFactory`] and the channels it creates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelConfig {
    /// Bound applied to `request_response` when the caller asks for the default timeout.
    pub response_timeout_ms: u64,
    /// Longest the dispatch loop blocks on the notifier before re-checking its run state.
    pub idle_wait_ms: u64,
    /// Virqs bound when the factory is constructed.
    pub virqs: Vec<Virq>,
    /// Name given to the dispatch thread.
    pub thread_name: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            idle_wait_ms: DEFAULT_IDLE_WAIT_MS,
            virqs: vec![Virq::DOM_EXC],
            thread_name: "ctrl-channel-factory".to_string(),
        }
    }
}

impl ChannelConfig {
    /// Parses a config from TOML text. Missing keys take their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Loads a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&raw)
    }

    /// Default response bound as a [`Duration`].
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Idle wait as a [`Duration`]; never zero so the loop cannot spin.
    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms.max(1))
    }
}
