// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Interdomain event channel value
//! OWNERS: @runtime
//!
//! INVARIANTS:
//!   - Each port is only meaningful with its owning domain (`dom1:port1`, `dom2:port2`)
//!   - Closing releases both halves independently; release failures never propagate
//!
//! PERSISTENCE: record fields `dom1`, `dom2`, `port1`, `port2`, string-encoded

use core::fmt;

use ctrl_abi::{DomainId, Hypervisor, Port};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::record::Record;

/// Bidirectional notification path between two domains.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventChannel {
    /// First domain.
    pub dom1: DomainId,
    /// Second domain.
    pub dom2: DomainId,
    /// Port in `dom1`.
    pub port1: Port,
    /// Port in `dom2`.
    pub port2: Port,
}

impl EventChannel {
    /// Binds an event channel between `dom1` and `dom2`. Wildcard ports request allocation.
    ///
    /// Returns `None` if the hypervisor refuses; callers treat that as routine and retry or skip.
    pub fn bind_interdomain(
        hypervisor: &dyn Hypervisor,
        dom1: DomainId,
        dom2: DomainId,
        port1: Port,
        port2: Port,
    ) -> Option<Self> {
        match hypervisor.bind_interdomain(dom1, dom2, port1, port2) {
            Ok((port1, port2)) => Some(Self { dom1, dom2, port1, port2 }),
            Err(err) => {
                warn!("evtchn: bind dom{dom1}:{port1} <-> dom{dom2}:{port2} failed: {err}");
                None
            }
        }
    }

    /// Binds using fields from `record` where present and parseable, the given values otherwise.
    pub fn restore_from(
        hypervisor: &dyn Hypervisor,
        record: &Record,
        dom1: DomainId,
        dom2: DomainId,
        port1: Port,
        port2: Port,
    ) -> Option<Self> {
        Self::bind_interdomain(
            hypervisor,
            record.parse_or("dom1", dom1),
            record.parse_or("dom2", dom2),
            record.parse_or("port1", port1),
            record.parse_or("port2", port2),
        )
    }

    /// Writes the four endpoint fields into `record`.
    pub fn save_to(&self, record: &mut Record) {
        record.set("dom1", self.dom1);
        record.set("dom2", self.dom2);
        record.set("port1", self.port1);
        record.set("port2", self.port2);
    }

    /// Releases both ports, best effort.
    ///
    /// Either port may already be gone with its domain; a failure on one half does not stop the
    /// other from being released.
    pub fn close(&self, hypervisor: &dyn Hypervisor) {
        debug!("evtchn: close {self}");
        for (dom, port) in [(self.dom1, self.port1), (self.dom2, self.port2)] {
            if let Err(err) = hypervisor.close_port(dom, port) {
                debug!("evtchn: release dom{dom}:{port} ignored: {err}");
            }
        }
    }
}

impl fmt::Display for EventChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<EventChannel dom1:{}:{} dom2:{}:{}>",
            self.dom1, self.port1, self.dom2, self.port2
        )
    }
}
