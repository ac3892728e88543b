// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-domain control channel and device handler registry
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + tests/dispatch.rs
//!
//! STATE MACHINE: open (port bound) -> active (handlers registered) -> closed (terminal)
//!
//! INVARIANTS:
//!   - A message type maps to at most one handler; the last registration wins
//!   - Once closed, no new I/O starts and every handler has seen `lost_channel`
//!   - Closing cancels every outstanding `request_response` waiter
//!   - An unhandled request is answered with an empty ack so the peer never blocks

use core::fmt;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use ctrl_abi::{ControlPort, DomainId, Message, MessageType, Port};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::factory::Registry;
use crate::record::Record;
use crate::response::{ResponseQueue, Timeout};
use crate::{ChannelError, Result};

/// Backend implementing a device protocol over a control channel.
///
/// Handlers receive the channel by reference on every callback and must not keep it alive.
pub trait DeviceHandler: Send + Sync {
    /// Handles an inbound request routed by message type.
    ///
    /// Returns `true` if the handler already wrote its own response; `false` lets the channel
    /// answer with an empty ack.
    fn request_received(&self, channel: &Channel, msg: &Message) -> bool;

    /// The channel closed; release any per-channel state.
    fn lost_channel(&self, channel: &Channel);
}

/// Registry key: peer domain plus both bound ports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct ChannelKey {
    /// Peer domain.
    pub domain: DomainId,
    /// Port in the control domain.
    pub local: Port,
    /// Port in the peer domain.
    pub remote: Port,
}

/// Serializable snapshot of a channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChannelInfo {
    /// Peer domain.
    pub domain: DomainId,
    /// Local port, absent once closed.
    pub local_port: Option<Port>,
    /// Remote port, absent once closed.
    pub remote_port: Option<Port>,
    /// Number of registered device handlers.
    pub devices: usize,
    /// Number of outstanding calls.
    pub pending: usize,
}

#[derive(Default)]
struct Devices {
    list: Vec<Arc<dyn DeviceHandler>>,
    by_type: HashMap<MessageType, Arc<dyn DeviceHandler>>,
}

fn same_handler(a: &Arc<dyn DeviceHandler>, b: &Arc<dyn DeviceHandler>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Control channel to one peer domain.
pub struct Channel {
    key: ChannelKey,
    port: Box<dyn ControlPort>,
    devices: Mutex<Devices>,
    queue: ResponseQueue,
    closed: AtomicBool,
    registry: Weak<Registry>,
    default_timeout: Duration,
}

impl Channel {
    pub(crate) fn new(
        domain: DomainId,
        port: Box<dyn ControlPort>,
        registry: Weak<Registry>,
        default_timeout: Duration,
    ) -> Self {
        let key = ChannelKey { domain, local: port.local_port(), remote: port.remote_port() };
        Self {
            key,
            port,
            devices: Mutex::new(Devices::default()),
            queue: ResponseQueue::new(),
            closed: AtomicBool::new(false),
            registry,
            default_timeout,
        }
    }

    /// Registry key of this channel.
    pub fn key(&self) -> ChannelKey {
        self.key
    }

    /// Peer domain.
    pub fn domain(&self) -> DomainId {
        self.key.domain
    }

    /// Local port, `None` once closed.
    pub fn local_port(&self) -> Option<Port> {
        (!self.is_closed()).then_some(self.key.local)
    }

    /// Remote port, `None` once closed.
    pub fn remote_port(&self) -> Option<Port> {
        (!self.is_closed()).then_some(self.key.remote)
    }

    /// Returns `true` once [`Channel::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of calls waiting for a response.
    pub fn pending_responses(&self) -> usize {
        self.queue.len()
    }

    /// Writes `local_port` and `remote_port` into `record`. No-op once closed.
    pub fn save_to(&self, record: &mut Record) {
        if self.is_closed() {
            return;
        }
        record.set("local_port", self.key.local);
        record.set("remote_port", self.key.remote);
    }

    /// Snapshot for diagnostics.
    pub fn info(&self) -> ChannelInfo {
        ChannelInfo {
            domain: self.key.domain,
            local_port: self.local_port(),
            remote_port: self.remote_port(),
            devices: self.devices.lock().list.len(),
            pending: self.queue.len(),
        }
    }

    /// Routes requests of every type in `types` to `handler`, replacing earlier mappings.
    pub fn register_handler(
        &self,
        types: impl IntoIterator<Item = MessageType>,
        handler: Arc<dyn DeviceHandler>,
    ) {
        let mut devices = self.devices.lock();
        // `close` sets the flag before draining under this lock.
        if self.is_closed() {
            return;
        }
        if !devices.list.iter().any(|d| same_handler(d, &handler)) {
            devices.list.push(handler.clone());
        }
        for ty in types {
            devices.by_type.insert(ty, handler.clone());
        }
    }

    /// Removes `handler` and every type mapping pointing at it. No-op if not registered.
    pub fn deregister_handler(&self, handler: &Arc<dyn DeviceHandler>) {
        let mut devices = self.devices.lock();
        devices.list.retain(|d| !same_handler(d, handler));
        devices.by_type.retain(|_, d| !same_handler(d, handler));
    }

    /// Handler registered for `ty`.
    pub fn device_for(&self, ty: MessageType) -> Option<Arc<dyn DeviceHandler>> {
        self.devices.lock().by_type.get(&ty).cloned()
    }

    /// Hands a request to the port for asynchronous delivery.
    pub fn write_request(&self, msg: &Message) -> Result<()> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        self.port.write_request(msg)?;
        Ok(())
    }

    /// Writes a response, best effort. Dropped silently once closed.
    pub fn write_response(&self, msg: &Message) {
        if self.is_closed() {
            return;
        }
        if let Err(err) = self.port.write_response(msg) {
            warn!("{self}: response {msg} not written: {err}");
        }
    }

    pub(crate) fn read_request(&self) -> Option<Message> {
        if self.is_closed() {
            return None;
        }
        self.port.read_request()
    }

    pub(crate) fn read_response(&self) -> Option<Message> {
        if self.is_closed() {
            return None;
        }
        self.port.read_response()
    }

    /// Dispatches an inbound request to its device handler, or acks it.
    ///
    /// Runs on a worker thread. A panicking handler is contained here and the request is acked.
    pub fn request_received(&self, msg: &Message) {
        let responded = match self.device_for(msg.ty) {
            Some(device) => {
                match panic::catch_unwind(AssertUnwindSafe(|| device.request_received(self, msg))) {
                    Ok(responded) => responded,
                    Err(_) => {
                        error!("{self}: device handler panicked on {msg}");
                        false
                    }
                }
            }
            None => {
                debug!("{self}: no device handler for {msg}");
                false
            }
        };
        if !responded {
            self.write_response(&Message::ack(msg));
        }
    }

    /// Delivers a response to the caller waiting on its id.
    pub fn response_received(&self, msg: Message) {
        self.queue.resolve(msg.id, msg);
    }

    /// Writes `msg` as a request and blocks until the matching response arrives.
    ///
    /// Fails with [`ChannelError::Timeout`] when the bound elapses and
    /// [`ChannelError::Cancelled`] when the channel closes first.
    pub fn request_response(&self, msg: &Message, timeout: Timeout) -> Result<Message> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let bound = timeout.bound(self.default_timeout);
        self.queue.call(msg, bound, |msg| self.write_request(msg))
    }

    /// Closes the channel. Idempotent.
    ///
    /// Leaves the factory registry, notifies handlers, cancels outstanding calls and releases
    /// the port.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.key);
        }
        let devices = std::mem::take(&mut *self.devices.lock());
        for device in &devices.list {
            device.lost_channel(self);
        }
        let cancelled = self.queue.cancel_all();
        self.port.close();
        info!(
            "channel: closed dom={} ports={}:{} cancelled={cancelled}",
            self.key.domain, self.key.local, self.key.remote
        );
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let port = |p: Option<Port>| p.map_or_else(|| "-1".to_string(), |p| p.to_string());
        write!(
            f,
            "<Channel dom={} ports={}:{}>",
            self.key.domain,
            port(self.local_port()),
            port(self.remote_port())
        )
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("key", &self.key)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, feature = "host"))]
mod tests {
    use super::*;
    use crate::host::HostPlatform;
    use crate::{ChannelConfig, ChannelFactory};
    use ctrl_abi::MessageId;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Message>>,
        lost: AtomicUsize,
        respond: bool,
    }

    impl DeviceHandler for Recorder {
        fn request_received(&self, channel: &Channel, msg: &Message) -> bool {
            self.seen.lock().push(msg.clone());
            if self.respond {
                channel.write_response(&Message::ack(msg).with_payload(b"handled".to_vec()));
            }
            self.respond
        }

        fn lost_channel(&self, _channel: &Channel) {
            self.lost.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicker;

    impl DeviceHandler for Panicker {
        fn request_received(&self, _channel: &Channel, _msg: &Message) -> bool {
            panic!("backend bug");
        }

        fn lost_channel(&self, _channel: &Channel) {}
    }

    fn setup() -> (HostPlatform, ChannelFactory, Arc<Channel>) {
        let host = HostPlatform::new();
        let factory = ChannelFactory::new(
            ChannelConfig::default(),
            Arc::new(host.clone()),
            Arc::new(host.clone()),
        )
        .unwrap();
        let chan = factory.open_channel(DomainId(7), Port(5), Port(3)).unwrap();
        (host, factory, chan)
    }

    fn request(ty: MessageType, id: u8) -> Message {
        Message::new(ty, 0, MessageId(id))
    }

    #[test]
    fn unhandled_request_is_acked_once() {
        let (host, _factory, chan) = setup();
        let peer = host.peer(DomainId(7), Port(5)).unwrap();
        chan.request_received(&request(MessageType::Debug, 9).with_payload(vec![1, 2]));
        let ack = peer.try_recv_response().expect("ack written");
        assert_eq!(ack, request(MessageType::Debug, 9));
        assert!(peer.try_recv_response().is_none());
    }

    #[test]
    fn handler_response_suppresses_ack() {
        let (host, _factory, chan) = setup();
        let peer = host.peer(DomainId(7), Port(5)).unwrap();
        let recorder = Arc::new(Recorder { respond: true, ..Default::default() });
        chan.register_handler([MessageType::BlockBackend], recorder.clone());
        chan.request_received(&request(MessageType::BlockBackend, 1));
        assert_eq!(peer.try_recv_response().unwrap().payload, b"handled");
        assert!(peer.try_recv_response().is_none());
        assert_eq!(recorder.seen.lock().len(), 1);
    }

    #[test]
    fn deregister_removes_all_mappings() {
        let (host, _factory, chan) = setup();
        let peer = host.peer(DomainId(7), Port(5)).unwrap();
        let recorder = Arc::new(Recorder { respond: true, ..Default::default() });
        let handler: Arc<dyn DeviceHandler> = recorder.clone();
        chan.register_handler([MessageType::BlockBackend, MessageType::NetBackend], handler.clone());
        chan.register_handler([MessageType::NetBackend], handler.clone());
        assert_eq!(chan.info().devices, 1);

        chan.deregister_handler(&handler);
        assert!(chan.device_for(MessageType::BlockBackend).is_none());
        assert!(chan.device_for(MessageType::NetBackend).is_none());
        assert_eq!(chan.info().devices, 0);

        chan.request_received(&request(MessageType::BlockBackend, 2));
        assert!(peer.try_recv_response().unwrap().payload.is_empty());
        assert!(recorder.seen.lock().is_empty());
    }

    #[test]
    fn last_registration_wins() {
        let (_host, _factory, chan) = setup();
        let first: Arc<dyn DeviceHandler> = Arc::new(Recorder::default());
        let second: Arc<dyn DeviceHandler> = Arc::new(Recorder::default());
        chan.register_handler([MessageType::Shutdown], first.clone());
        chan.register_handler([MessageType::Shutdown], second.clone());
        let routed = chan.device_for(MessageType::Shutdown).unwrap();
        assert!(same_handler(&routed, &second));
        assert_eq!(chan.info().devices, 2);
    }

    #[test]
    fn panicking_handler_still_acks() {
        let (host, _factory, chan) = setup();
        let peer = host.peer(DomainId(7), Port(5)).unwrap();
        chan.register_handler([MessageType::MemRequest], Arc::new(Panicker));
        chan.request_received(&request(MessageType::MemRequest, 4));
        assert_eq!(peer.try_recv_response().unwrap().id, MessageId(4));
    }

    #[test]
    fn close_is_terminal() {
        let (host, factory, chan) = setup();
        let peer = host.peer(DomainId(7), Port(5)).unwrap();
        let recorder = Arc::new(Recorder::default());
        chan.register_handler([MessageType::Console], recorder.clone());

        chan.close();
        chan.close();
        assert_eq!(recorder.lost.load(Ordering::SeqCst), 1);
        assert!(chan.device_for(MessageType::Console).is_none());
        assert!(factory.find_channel(DomainId(7), Port(5), Port(3)).is_none());
        assert_eq!(chan.local_port(), None);
        assert_eq!(chan.to_string(), "<Channel dom=7 ports=-1:-1>");

        let msg = request(MessageType::Console, 1);
        assert_eq!(chan.write_request(&msg), Err(ChannelError::Closed));
        assert_eq!(chan.request_response(&msg, Timeout::Forever), Err(ChannelError::Closed));
        chan.write_response(&msg);
        assert!(chan.read_request().is_none());
        assert!(peer.is_closed());

        chan.register_handler([MessageType::Console], recorder);
        assert!(chan.device_for(MessageType::Console).is_none());
    }

    #[test]
    fn register_racing_close_is_notified_or_dropped() {
        let (_host, factory, _chan) = setup();
        for remote in 10..60 {
            let chan = factory.open_channel(DomainId(8), Port::WILDCARD, Port(remote)).unwrap();
            let recorder = Arc::new(Recorder::default());
            let barrier = Arc::new(std::sync::Barrier::new(2));
            let registrar = {
                let (chan, recorder, barrier) = (chan.clone(), recorder.clone(), barrier.clone());
                std::thread::spawn(move || {
                    barrier.wait();
                    chan.register_handler([MessageType::Console], recorder);
                })
            };
            barrier.wait();
            chan.close();
            registrar.join().unwrap();

            assert!(chan.device_for(MessageType::Console).is_none());
            assert_eq!(chan.info().devices, 0);
            assert!(recorder.lost.load(Ordering::SeqCst) <= 1);
        }
    }

    #[test]
    fn save_to_record() {
        let (_host, _factory, chan) = setup();
        let mut record = Record::new();
        chan.save_to(&mut record);
        assert_eq!(record.get("local_port"), Some("5"));
        assert_eq!(record.get("remote_port"), Some("3"));
        assert_eq!(chan.to_string(), "<Channel dom=7 ports=5:3>");

        chan.close();
        let mut after = Record::new();
        chan.save_to(&mut after);
        assert!(after.is_empty());
    }
}
