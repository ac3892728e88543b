// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: In-process hypervisor emulation for host-based testing
//!
//! OWNERS: @runtime
//!
//! PUBLIC API:
//!   - struct HostPlatform: Hypervisor + PortProvider + Notifier backed by memory
//!   - struct PeerEnd: the peer-domain side of a control port
//!   - HostPlatform::peer(): look up the peer end of an open port
//!   - HostPlatform::raise_virq() / notify_pending(): inject notifications
//!   - HostPlatform::fail_*(): failure injection
//!
//! SECURITY INVARIANTS:
//!   - No unsafe code
//!   - Ports are keyed by (domain, local port); a closed port stops delivering in both directions
//!
//! DEPENDENCIES:
//!   - crossbeam_channel: notification queue and outbound message queues
//!   - parking_lot::Mutex: port and allocation tables

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use ctrl_abi::{
    ControlPort, DomainId, Hypervisor, Message, Notifier, PlatformError, Port, PortProvider,
    Result, TypeFilter, Virq, Wakeup,
};
use parking_lot::Mutex;

type PortKey = (DomainId, Port);

/// Simulated hypervisor. Cloning shares the same state.
#[derive(Clone)]
pub struct HostPlatform {
    inner: Arc<HostInner>,
}

struct HostInner {
    bound: Mutex<HashSet<PortKey>>,
    next_port: Mutex<HashMap<DomainId, u32>>,
    ports: Mutex<HashMap<PortKey, Arc<PortState>>>,
    virqs: Mutex<HashMap<Virq, Port>>,
    notify_tx: Sender<Wakeup>,
    notify_rx: Receiver<Wakeup>,
    fail_binds: AtomicBool,
    fail_ports: AtomicBool,
    fail_release: Mutex<HashSet<PortKey>>,
}

impl HostInner {
    // Lowest free port in `domain`, starting at 1.
    fn allocate(&self, domain: DomainId) -> Port {
        let bound = self.bound.lock();
        let mut next = self.next_port.lock();
        let cursor = next.entry(domain).or_insert(1);
        while bound.contains(&(domain, Port(*cursor))) {
            *cursor += 1;
        }
        let port = Port(*cursor);
        *cursor += 1;
        port
    }

    fn resolve(&self, domain: DomainId, port: Port) -> Port {
        if port.is_wildcard() {
            self.allocate(domain)
        } else {
            port
        }
    }

    fn notify(&self, wakeup: Wakeup) {
        // The receiver lives in `self`, so the send cannot fail.
        let _ = self.notify_tx.send(wakeup);
    }
}

impl Default for HostPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl HostPlatform {
    /// Creates an empty platform.
    pub fn new() -> Self {
        let (notify_tx, notify_rx) = crossbeam_channel::unbounded();
        Self {
            inner: Arc::new(HostInner {
                bound: Mutex::new(HashSet::new()),
                next_port: Mutex::new(HashMap::new()),
                ports: Mutex::new(HashMap::new()),
                virqs: Mutex::new(HashMap::new()),
                notify_tx,
                notify_rx,
                fail_binds: AtomicBool::new(false),
                fail_ports: AtomicBool::new(false),
                fail_release: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Peer end of the open control port `local` to `domain`.
    pub fn peer(&self, domain: DomainId, local: Port) -> Option<PeerEnd> {
        let state = self.inner.ports.lock().get(&(domain, local)).cloned()?;
        Some(PeerEnd { state, notify_tx: self.inner.notify_tx.clone() })
    }

    /// Port `virq` is bound to.
    pub fn virq_port(&self, virq: Virq) -> Option<Port> {
        self.inner.virqs.lock().get(&virq).copied()
    }

    /// Fires `virq`. Returns `false` if it is not bound.
    pub fn raise_virq(&self, virq: Virq) -> bool {
        match self.virq_port(virq) {
            Some(port) => {
                self.inner.notify(Wakeup::Port(port));
                true
            }
            None => false,
        }
    }

    /// Posts a notification that does not name a port.
    pub fn notify_pending(&self) {
        self.inner.notify(Wakeup::Pending);
    }

    /// Notifies `port` without queueing any message.
    pub fn notify_port(&self, port: Port) {
        self.inner.notify(Wakeup::Port(port));
    }

    /// Makes every subsequent interdomain bind fail.
    pub fn fail_binds(&self, fail: bool) {
        self.inner.fail_binds.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent control port creation fail.
    pub fn fail_port_creation(&self, fail: bool) {
        self.inner.fail_ports.store(fail, Ordering::SeqCst);
    }

    /// Makes releasing `port` in `domain` fail.
    pub fn fail_release(&self, domain: DomainId, port: Port) {
        self.inner.fail_release.lock().insert((domain, port));
    }

    /// Returns `true` while `port` is bound in `domain`.
    pub fn is_bound(&self, domain: DomainId, port: Port) -> bool {
        self.inner.bound.lock().contains(&(domain, port))
    }
}

impl Hypervisor for HostPlatform {
    fn bind_interdomain(
        &self,
        dom1: DomainId,
        dom2: DomainId,
        port1: Port,
        port2: Port,
    ) -> Result<(Port, Port)> {
        if self.inner.fail_binds.load(Ordering::SeqCst) {
            return Err(PlatformError::Rejected { op: "bind_interdomain", reason: "injected".into() });
        }
        for (dom, port) in [(dom1, port1), (dom2, port2)] {
            if !port.is_wildcard() && self.is_bound(dom, port) {
                return Err(PlatformError::Rejected {
                    op: "bind_interdomain",
                    reason: format!("port {port} busy in domain {dom}"),
                });
            }
        }
        let port1 = self.inner.resolve(dom1, port1);
        let port2 = self.inner.resolve(dom2, port2);
        let mut bound = self.inner.bound.lock();
        bound.insert((dom1, port1));
        bound.insert((dom2, port2));
        Ok((port1, port2))
    }

    fn close_port(&self, domain: DomainId, port: Port) -> Result<()> {
        if self.inner.fail_release.lock().contains(&(domain, port)) {
            return Err(PlatformError::Rejected { op: "close_port", reason: "injected".into() });
        }
        if self.inner.bound.lock().remove(&(domain, port)) {
            Ok(())
        } else {
            Err(PlatformError::Unbound { domain, port })
        }
    }
}

impl PortProvider for HostPlatform {
    fn create_port(
        &self,
        domain: DomainId,
        local: Port,
        remote: Port,
    ) -> Result<Box<dyn ControlPort>> {
        if self.inner.fail_ports.load(Ordering::SeqCst) {
            return Err(PlatformError::Rejected { op: "create_port", reason: "injected".into() });
        }
        let local = self.inner.resolve(DomainId::CONTROL, local);
        let remote = self.inner.resolve(domain, remote);
        {
            let mut bound = self.inner.bound.lock();
            bound.insert((DomainId::CONTROL, local));
            bound.insert((domain, remote));
        }
        let state = Arc::new(PortState::new(domain, local, remote));
        self.inner.ports.lock().insert((domain, local), state.clone());
        Ok(Box::new(HostPort { state, host: Arc::downgrade(&self.inner) }))
    }
}

impl Notifier for HostPlatform {
    fn bind_virq(&self, virq: Virq) -> Result<Port> {
        let port = self.inner.allocate(DomainId::CONTROL);
        self.inner.bound.lock().insert((DomainId::CONTROL, port));
        self.inner.virqs.lock().insert(virq, port);
        Ok(port)
    }

    fn read(&self, timeout: Duration) -> Result<Option<Wakeup>> {
        match self.inner.notify_rx.recv_timeout(timeout) {
            Ok(wakeup) => Ok(Some(wakeup)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(PlatformError::Unavailable),
        }
    }
}

struct PortState {
    domain: DomainId,
    local: Port,
    remote: Port,
    filter: Mutex<Option<TypeFilter>>,
    inbound_requests: Mutex<VecDeque<Message>>,
    inbound_responses: Mutex<VecDeque<Message>>,
    outbound_requests: (Sender<Message>, Receiver<Message>),
    outbound_responses: (Sender<Message>, Receiver<Message>),
    closed: AtomicBool,
}

impl PortState {
    fn new(domain: DomainId, local: Port, remote: Port) -> Self {
        Self {
            domain,
            local,
            remote,
            filter: Mutex::new(None),
            inbound_requests: Mutex::new(VecDeque::new()),
            inbound_responses: Mutex::new(VecDeque::new()),
            outbound_requests: crossbeam_channel::unbounded(),
            outbound_responses: crossbeam_channel::unbounded(),
            closed: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn accepts(&self, msg: &Message) -> bool {
        self.filter.lock().is_some_and(|filter| filter.matches(msg.ty))
    }
}

struct HostPort {
    state: Arc<PortState>,
    host: Weak<HostInner>,
}

impl ControlPort for HostPort {
    fn local_port(&self) -> Port {
        self.state.local
    }

    fn remote_port(&self) -> Port {
        self.state.remote
    }

    fn subscribe(&self, filter: TypeFilter) -> Result<()> {
        if self.state.is_closed() {
            return Err(PlatformError::Closed);
        }
        *self.state.filter.lock() = Some(filter);
        Ok(())
    }

    fn write_request(&self, msg: &Message) -> Result<()> {
        if self.state.is_closed() {
            return Err(PlatformError::Closed);
        }
        self.state.outbound_requests.0.send(msg.clone()).map_err(|_| PlatformError::Closed)
    }

    fn write_response(&self, msg: &Message) -> Result<()> {
        if self.state.is_closed() {
            return Err(PlatformError::Closed);
        }
        self.state.outbound_responses.0.send(msg.clone()).map_err(|_| PlatformError::Closed)
    }

    fn read_request(&self) -> Option<Message> {
        self.state.inbound_requests.lock().pop_front()
    }

    fn read_response(&self) -> Option<Message> {
        self.state.inbound_responses.lock().pop_front()
    }

    fn close(&self) {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(host) = self.host.upgrade() {
            host.ports.lock().remove(&(self.state.domain, self.state.local));
            let mut bound = host.bound.lock();
            bound.remove(&(DomainId::CONTROL, self.state.local));
            bound.remove(&(self.state.domain, self.state.remote));
        }
    }
}

/// Peer-domain side of a simulated control port.
#[derive(Clone)]
pub struct PeerEnd {
    state: Arc<PortState>,
    notify_tx: Sender<Wakeup>,
}

impl PeerEnd {
    /// Queues a request for the control domain and notifies its port.
    ///
    /// Returns `false` if the port is closed or not subscribed to the message type.
    pub fn send_request(&self, msg: Message) -> bool {
        self.deliver(&self.state.inbound_requests, msg)
    }

    /// Queues a response for the control domain and notifies its port.
    pub fn send_response(&self, msg: Message) -> bool {
        self.deliver(&self.state.inbound_responses, msg)
    }

    fn deliver(&self, queue: &Mutex<VecDeque<Message>>, msg: Message) -> bool {
        if self.state.is_closed() || !self.state.accepts(&msg) {
            return false;
        }
        queue.lock().push_back(msg);
        let _ = self.notify_tx.send(Wakeup::Port(self.state.local));
        true
    }

    /// Next request written by the control domain, waiting up to `timeout`.
    pub fn recv_request(&self, timeout: Duration) -> Option<Message> {
        self.state.outbound_requests.1.recv_timeout(timeout).ok()
    }

    /// Next response written by the control domain, waiting up to `timeout`.
    pub fn recv_response(&self, timeout: Duration) -> Option<Message> {
        self.state.outbound_responses.1.recv_timeout(timeout).ok()
    }

    /// Next response written by the control domain, without waiting.
    pub fn try_recv_response(&self) -> Option<Message> {
        self.state.outbound_responses.1.try_recv().ok()
    }

    /// Port in the control domain.
    pub fn local_port(&self) -> Port {
        self.state.local
    }

    /// Port in the peer domain.
    pub fn remote_port(&self) -> Port {
        self.state.remote
    }

    /// Returns `true` once the control domain closed the port.
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctrl_abi::{MessageId, MessageType};

    #[test]
    fn allocation_skips_bound_ports() {
        let host = HostPlatform::new();
        let (p1, p2) = host
            .bind_interdomain(DomainId(7), DomainId(0), Port(1), Port::WILDCARD)
            .unwrap();
        assert_eq!(p1, Port(1));
        assert_eq!(p2, Port(1));
        let (q1, _) = host
            .bind_interdomain(DomainId(7), DomainId(0), Port::WILDCARD, Port::WILDCARD)
            .unwrap();
        assert_eq!(q1, Port(2));
        assert!(host.bind_interdomain(DomainId(7), DomainId(3), Port(2), Port(0)).is_err());
    }

    #[test]
    fn close_unbound_port_fails() {
        let host = HostPlatform::new();
        assert_eq!(
            host.close_port(DomainId(2), Port(9)),
            Err(PlatformError::Unbound { domain: DomainId(2), port: Port(9) })
        );
    }

    #[test]
    fn peer_delivery_requires_subscription() {
        let host = HostPlatform::new();
        let port = host.create_port(DomainId(2), Port::WILDCARD, Port::WILDCARD).unwrap();
        let peer = host.peer(DomainId(2), port.local_port()).unwrap();
        let msg = Message::new(MessageType::Console, 0, MessageId(1));

        assert!(!peer.send_request(msg.clone()));
        port.subscribe(TypeFilter::Only(MessageType::Console)).unwrap();
        assert!(peer.send_request(msg.clone()));
        assert!(!peer.send_request(Message::new(MessageType::Debug, 0, MessageId(2))));
        assert_eq!(port.read_request(), Some(msg));
        assert_eq!(host.read(Duration::from_millis(10)).unwrap(), Some(Wakeup::Port(port.local_port())));
        assert_eq!(host.read(Duration::from_millis(10)).unwrap(), None);
    }

    #[test]
    fn closed_port_is_released() {
        let host = HostPlatform::new();
        let port = host.create_port(DomainId(2), Port(6), Port(8)).unwrap();
        assert!(host.is_bound(DomainId::CONTROL, Port(6)));
        port.close();
        assert!(!host.is_bound(DomainId::CONTROL, Port(6)));
        assert!(!host.is_bound(DomainId(2), Port(8)));
        assert!(host.peer(DomainId(2), Port(6)).is_none());
        assert_eq!(port.subscribe(TypeFilter::All), Err(PlatformError::Closed));
    }
}
