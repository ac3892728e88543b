// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Inter-domain control-channel transport for the control plane
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + tests/dispatch.rs
//!
//! PUBLIC API:
//!   - EventChannel: interdomain event channel value (bind/close/persist)
//!   - ResponseQueue: request-id correlation with bounded wait
//!   - Channel + DeviceHandler: per-domain control channel and handler registry
//!   - ChannelFactory: channel registry and dispatch thread
//!   - ChannelConfig: TOML configuration
//!   - Record: flat persistence record
//!
//! DEPENDENCIES:
//!   - ctrl-abi: value types and platform seam
//!   - parking_lot: registry and waiter locks
//!   - indexmap: insertion-ordered channel registry
//!   - log: diagnostics
//!
//! The dispatch thread polls the shared notifier, resolves responses inline and hands every
//! inbound request to a short-lived worker. Callers of [`Channel::request_response`] block
//! their own thread on a per-message waiter.

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

mod channel;
mod config;
mod error;
mod evtchn;
mod factory;
mod record;
mod response;

#[cfg(feature = "host")]
pub mod host;

pub use channel::{Channel, ChannelInfo, ChannelKey, DeviceHandler};
pub use config::ChannelConfig;
pub use error::{ChannelError, ConfigError, RecordError};
pub use evtchn::EventChannel;
pub use factory::{ChannelFactory, VirqHandler};
pub use record::Record;
pub use response::{PendingResponse, ResponseQueue, Timeout};

pub use ctrl_abi::{DomainId, Message, MessageId, MessageType, Port, Virq};

/// Result type returned by channel operations.
pub type Result<T> = core::result::Result<T, ChannelError>;
