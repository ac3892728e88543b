// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Control messages exchanged over a control port.
//!
//! The payload is carried opaquely; device protocols own its encoding.

use core::fmt;

use serde::{Deserialize, Serialize};

/// Correlation id shared by a request and its response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u8);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Control message type, selecting the device handler a request is routed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum MessageType {
    /// Guest console traffic.
    Console,
    /// Block device backend.
    BlockBackend,
    /// Block device frontend.
    BlockFrontend,
    /// Network device backend.
    NetBackend,
    /// Network device frontend.
    NetFrontend,
    /// Domain shutdown requests.
    Shutdown,
    /// Memory balloon requests.
    MemRequest,
    /// USB device backend.
    UsbBackend,
    /// USB device frontend.
    UsbFrontend,
    /// Virtual CPU hotplug.
    VcpuHotplug,
    /// Debug channel.
    Debug,
    /// Any type without a named variant.
    Other(u8),
}

impl From<u8> for MessageType {
    fn from(raw: u8) -> Self {
        match raw {
            0 => Self::Console,
            1 => Self::BlockBackend,
            2 => Self::BlockFrontend,
            3 => Self::NetBackend,
            4 => Self::NetFrontend,
            6 => Self::Shutdown,
            7 => Self::MemRequest,
            8 => Self::UsbBackend,
            9 => Self::UsbFrontend,
            10 => Self::VcpuHotplug,
            11 => Self::Debug,
            other => Self::Other(other),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(ty: MessageType) -> Self {
        match ty {
            MessageType::Console => 0,
            MessageType::BlockBackend => 1,
            MessageType::BlockFrontend => 2,
            MessageType::NetBackend => 3,
            MessageType::NetFrontend => 4,
            MessageType::Shutdown => 6,
            MessageType::MemRequest => 7,
            MessageType::UsbBackend => 8,
            MessageType::UsbFrontend => 9,
            MessageType::VcpuHotplug => 10,
            MessageType::Debug => 11,
            MessageType::Other(raw) => raw,
        }
    }
}

/// Message types a port delivers to its reader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeFilter {
    /// Deliver every message type.
    All,
    /// Deliver a single message type.
    Only(MessageType),
}

impl TypeFilter {
    /// Returns `true` if messages of `ty` pass the filter.
    pub fn matches(self, ty: MessageType) -> bool {
        match self {
            Self::All => true,
            Self::Only(wanted) => wanted == ty,
        }
    }
}

/// A control message. Requests and responses share the same shape.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message type.
    pub ty: MessageType,
    /// Type-specific subtype.
    pub subtype: u8,
    /// Correlation id.
    pub id: MessageId,
    /// Opaque payload.
    pub payload: Vec<u8>,
}

impl Message {
    /// Creates a message with an empty payload.
    pub fn new(ty: MessageType, subtype: u8, id: MessageId) -> Self {
        Self { ty, subtype, id, payload: Vec::new() }
    }

    /// Replaces the payload.
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Empty acknowledgement answering `request`.
    pub fn ack(request: &Message) -> Self {
        Self::new(request.ty, request.subtype, request.id)
    }

    /// Type and subtype pair.
    pub fn kind(&self) -> (MessageType, u8) {
        (self.ty, self.subtype)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Message type={} subtype={} id={} len={}>",
            u8::from(self.ty),
            self.subtype,
            self.id,
            self.payload.len()
        )
    }
}
