// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Platform seam between the control-channel transport and the hypervisor
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - Hypervisor: interdomain event-channel bind/close
//!   - ControlPort: per-peer message port with request/response rings
//!   - PortProvider: creates control ports
//!   - Notifier: shared notification source and virq binding
//!
//! ERROR CONDITIONS:
//!   - PlatformError::Rejected: hypervisor refused the operation
//!   - PlatformError::Unbound: port not bound for the given domain
//!   - PlatformError::Closed: port already closed
//!   - PlatformError::Unavailable: notification source is gone

use core::time::Duration;

use thiserror::Error;

use crate::{DomainId, Message, Port, TypeFilter, Virq};

/// Result type returned by platform operations.
pub type Result<T> = core::result::Result<T, PlatformError>;

/// Errors reported by the platform layer.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PlatformError {
    /// The hypervisor refused the operation.
    #[error("hypervisor rejected {op}: {reason}")]
    Rejected {
        /// Operation name.
        op: &'static str,
        /// Reason reported by the hypervisor.
        reason: String,
    },
    /// The port is not bound for the domain.
    #[error("port {port} is not bound in domain {domain}")]
    Unbound {
        /// Owning domain.
        domain: DomainId,
        /// Port number.
        port: Port,
    },
    /// The port has been closed.
    #[error("port closed")]
    Closed,
    /// The notification source is no longer readable.
    #[error("notification source unavailable")]
    Unavailable,
}

/// Event-channel operations performed against the hypervisor.
pub trait Hypervisor: Send + Sync {
    /// Binds an interdomain event channel. Wildcard ports request allocation.
    ///
    /// Returns the bound `(port1, port2)` pair.
    fn bind_interdomain(
        &self,
        dom1: DomainId,
        dom2: DomainId,
        port1: Port,
        port2: Port,
    ) -> Result<(Port, Port)>;

    /// Releases `port` in `domain`.
    fn close_port(&self, domain: DomainId, port: Port) -> Result<()>;
}

/// Message port connecting the control domain to one peer domain.
///
/// Reads are non-blocking polls; writes hand the message to the port for asynchronous delivery.
pub trait ControlPort: Send + Sync {
    /// Port bound in the control domain.
    fn local_port(&self) -> Port;

    /// Port bound in the peer domain.
    fn remote_port(&self) -> Port;

    /// Selects the message types delivered by the read side.
    fn subscribe(&self, filter: TypeFilter) -> Result<()>;

    /// Queues a request for the peer.
    fn write_request(&self, msg: &Message) -> Result<()>;

    /// Queues a response for the peer.
    fn write_response(&self, msg: &Message) -> Result<()>;

    /// Takes the next pending request from the peer, if any.
    fn read_request(&self) -> Option<Message>;

    /// Takes the next pending response from the peer, if any.
    fn read_response(&self) -> Option<Message>;

    /// Releases the port. Idempotent.
    fn close(&self);
}

/// Creates control ports.
pub trait PortProvider: Send + Sync {
    /// Connects a control port to `domain`. Wildcard ports request allocation; explicit ports
    /// reconnect an existing binding.
    fn create_port(
        &self,
        domain: DomainId,
        local: Port,
        remote: Port,
    ) -> Result<Box<dyn ControlPort>>;
}

/// A wakeup reported by the notification source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wakeup {
    /// A specific port was notified.
    Port(Port),
    /// Something is pending, source port unknown.
    Pending,
}

/// Shared, blocking-readable notification source.
pub trait Notifier: Send + Sync {
    /// Binds `virq` to a notification port.
    fn bind_virq(&self, virq: Virq) -> Result<Port>;

    /// Returns the next wakeup, blocking for at most `timeout`.
    ///
    /// `Ok(None)` means nothing became ready in time.
    fn read(&self, timeout: Duration) -> Result<Option<Wakeup>>;
}
