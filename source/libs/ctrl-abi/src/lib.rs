// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Shared definitions for inter-domain control channels
//! OWNERS: @runtime
//! PUBLIC API: DomainId, Port, Virq, Message, MessageType, TypeFilter; platform seam: Hypervisor, ControlPort, PortProvider, Notifier
//! DEPENDS_ON: serde, thiserror
//! INVARIANTS: A port number is only meaningful paired with its owning domain; port 0 is the wildcard

use core::fmt;
use core::num::ParseIntError;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

mod message;
mod platform;

pub use message::{Message, MessageId, MessageType, TypeFilter};
pub use platform::{ControlPort, Hypervisor, Notifier, PlatformError, PortProvider, Result, Wakeup};

/// Identifier of a domain managed by the hypervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainId(pub u32);

impl DomainId {
    /// The control domain hosting the control plane.
    pub const CONTROL: Self = Self(0);

    /// Returns the raw domain number.
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DomainId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// One endpoint of an event channel, local to its owning domain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Port(pub u32);

impl Port {
    /// Requests allocation of a fresh port when binding.
    pub const WILDCARD: Self = Self(0);

    /// Returns `true` for the allocation wildcard.
    pub const fn is_wildcard(self) -> bool {
        self.0 == 0
    }

    /// Returns the raw port number.
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Port {
    type Err = ParseIntError;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Virtual interrupt number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Virq(pub u32);

impl Virq {
    /// Timer tick.
    pub const TIMER: Self = Self(1);
    /// Debug key pressed.
    pub const DEBUG: Self = Self(2);
    /// Console output available.
    pub const CONSOLE: Self = Self(3);
    /// A domain exited or changed state.
    pub const DOM_EXC: Self = Self(4);
}

impl fmt::Display for Virq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_wildcard() {
        assert!(Port::WILDCARD.is_wildcard());
        assert!(Port::default().is_wildcard());
        assert!(!Port(3).is_wildcard());
    }

    #[test]
    fn ids_parse_with_whitespace() {
        assert_eq!(" 7 ".parse::<DomainId>().unwrap(), DomainId(7));
        assert_eq!("12".parse::<Port>().unwrap(), Port(12));
        assert!("x1".parse::<Port>().is_err());
        assert!("-1".parse::<Port>().is_err());
    }
}
