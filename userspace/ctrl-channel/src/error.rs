// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use ctrl_abi::PlatformError;
use thiserror::Error;

/// Errors produced by control channels.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The channel was closed before or during the operation.
    #[error("channel closed")]
    Closed,
    /// No response arrived within the requested bound.
    #[error("response timeout")]
    Timeout,
    /// The wait was cancelled before a response arrived.
    #[error("wait cancelled")]
    Cancelled,
    /// The underlying port or notifier failed.
    #[error("platform failure: {0}")]
    Platform(#[from] PlatformError),
    /// A dispatch or worker thread could not be started.
    #[error("failed to spawn {name} thread: {reason}")]
    Spawn {
        /// Thread name.
        name: String,
        /// OS error text.
        reason: String,
    },
}

/// Errors produced while loading [`crate::ChannelConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path of the config file.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// Config text is not valid TOML for the schema.
    #[error("invalid channel config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Errors produced while (de)serializing a [`crate::Record`].
#[derive(Debug, Error)]
pub enum RecordError {
    /// Stored text is not a flat TOML table of strings.
    #[error("invalid record: {0}")]
    Parse(#[from] toml::de::Error),
    /// Record could not be encoded.
    #[error("failed to encode record: {0}")]
    Encode(#[from] toml::ser::Error),
}
