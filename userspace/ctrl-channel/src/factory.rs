// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Channel registry and notification dispatch thread
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + tests/dispatch.rs
//!
//! PUBLIC API:
//!   - ChannelFactory::new(): bind configured virqs, inject platform
//!   - open_channel()/find_channel()/get_channel()/new_channel(): registry access
//!   - restore_from_record(): reopen a persisted channel
//!   - bind_virq()/set_virq_handler(): virtual interrupt routing
//!   - start()/stop()/shutdown(): dispatch thread lifecycle
//!
//! DISPATCH LOOP:
//!   1. Block on the notifier for at most `idle_wait`
//!   2. Virq port: run the virq handler on a worker
//!   3. Otherwise, over a registry snapshot: drain one response per channel (resolved inline),
//!      then one request per channel (handed to a worker)
//!   4. A notified port that produced nothing is logged
//!
//! Stop is cooperative: the loop exits at the next channel or iteration boundary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use ctrl_abi::{DomainId, Message, Notifier, Port, PortProvider, TypeFilter, Virq, Wakeup};
use indexmap::IndexMap;
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::channel::{Channel, ChannelKey};
use crate::config::ChannelConfig;
use crate::record::Record;
use crate::{ChannelError, Result};

/// Callback invoked with every fired virq.
pub type VirqHandler = Arc<dyn Fn(Virq) + Send + Sync>;

/// Insertion-ordered map of live channels.
#[derive(Default)]
pub(crate) struct Registry {
    channels: Mutex<IndexMap<ChannelKey, Arc<Channel>>>,
}

impl Registry {
    fn insert(&self, channel: Arc<Channel>) {
        let replaced = self.channels.lock().insert(channel.key(), channel.clone());
        if replaced.is_some() {
            warn!("factory: {channel} replaced an existing registration");
        }
    }

    pub(crate) fn remove(&self, key: &ChannelKey) {
        self.channels.lock().shift_remove(key);
    }

    fn get(&self, key: &ChannelKey) -> Option<Arc<Channel>> {
        self.channels.lock().get(key).cloned()
    }

    fn snapshot(&self) -> Vec<Arc<Channel>> {
        self.channels.lock().values().cloned().collect()
    }
}

struct Shared {
    config: ChannelConfig,
    ports: Arc<dyn PortProvider>,
    notifier: Arc<dyn Notifier>,
    registry: Arc<Registry>,
    open_lock: Mutex<()>,
    virq_ports: Mutex<HashMap<Port, Virq>>,
    virq_handler: Mutex<Option<VirqHandler>>,
    running: AtomicBool,
    generation: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        self.running.load(Ordering::Acquire) && self.generation.load(Ordering::Acquire) == generation
    }

    fn dispatch_loop(&self, generation: u64) {
        info!("factory: dispatch loop running");
        let idle = self.config.idle_wait();
        while self.is_current(generation) {
            match self.notifier.read(idle) {
                Ok(Some(Wakeup::Port(port))) => {
                    let virq = self.virq_ports.lock().get(&port).copied();
                    match virq {
                        Some(virq) => self.virq_received(virq),
                        None => self.msg_received(Some(port), generation),
                    }
                }
                Ok(Some(Wakeup::Pending)) => self.msg_received(None, generation),
                Ok(None) => {}
                Err(err) => {
                    error!("factory: notifier read failed: {err}");
                    thread::sleep(idle);
                }
            }
        }
        info!("factory: dispatch loop stopped");
    }

    fn msg_received(&self, port: Option<Port>, generation: u64) {
        let channels = self.registry.snapshot();
        let mut received = 0usize;
        for chan in &channels {
            if !self.is_current(generation) {
                return;
            }
            if let Some(msg) = chan.read_response() {
                received += 1;
                chan.response_received(msg);
            }
        }
        for chan in &channels {
            if !self.is_current(generation) {
                return;
            }
            if let Some(msg) = chan.read_request() {
                received += 1;
                run_request(chan.clone(), msg);
            }
        }
        if let Some(port) = port {
            if received == 0 {
                warn!("factory: port {port} notified, but no messages found");
            }
        }
    }

    fn virq_received(&self, virq: Virq) {
        debug!("factory: virq {virq} received");
        let Some(handler) = self.virq_handler.lock().clone() else {
            return;
        };
        let spawned = thread::Builder::new()
            .name(format!("virq-{virq}"))
            .spawn(move || handler(virq));
        if let Err(err) = spawned {
            error!("factory: virq {virq} worker not started: {err}");
        }
    }
}

fn run_request(chan: Arc<Channel>, msg: Message) {
    let worker = chan.clone();
    let pending = msg.clone();
    let spawned = thread::Builder::new()
        .name(format!("ctrl-dom{}", chan.domain()))
        .spawn(move || worker.request_received(&pending));
    if let Err(err) = spawned {
        // Without a worker the request is still answered so the peer does not stall.
        error!("factory: request worker not started for {chan}: {err}");
        chan.request_received(&msg);
    }
}

/// Registry of live control channels plus the dispatch thread feeding them.
///
/// One factory is created per process and passed to whoever needs channels; its dispatch thread
/// is started and stopped explicitly.
pub struct ChannelFactory {
    shared: Arc<Shared>,
}

impl ChannelFactory {
    /// Creates a factory and binds every virq listed in `config`.
    pub fn new(
        config: ChannelConfig,
        ports: Arc<dyn PortProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let virqs = config.virqs.clone();
        let factory = Self {
            shared: Arc::new(Shared {
                config,
                ports,
                notifier,
                registry: Arc::new(Registry::default()),
                open_lock: Mutex::new(()),
                virq_ports: Mutex::new(HashMap::new()),
                virq_handler: Mutex::new(None),
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                thread: Mutex::new(None),
            }),
        };
        for virq in virqs {
            factory.bind_virq(virq)?;
        }
        Ok(factory)
    }

    /// Configuration the factory was built with.
    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    /// Binds `virq` to a notification port and routes it to the virq handler.
    pub fn bind_virq(&self, virq: Virq) -> Result<Port> {
        let port = self.shared.notifier.bind_virq(virq)?;
        self.shared.virq_ports.lock().insert(port, virq);
        info!("virq {virq} on port {port}");
        Ok(port)
    }

    /// Installs the process-wide virq callback. It runs on its own worker per virq.
    pub fn set_virq_handler(&self, handler: impl Fn(Virq) + Send + Sync + 'static) {
        *self.shared.virq_handler.lock() = Some(Arc::new(handler));
    }

    /// Starts the dispatch thread. No-op if already running.
    pub fn start(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let shared = self.shared.clone();
        let name = self.shared.config.thread_name.clone();
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || shared.dispatch_loop(generation));
        match spawned {
            Ok(handle) => {
                *self.shared.thread.lock() = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.running.store(false, Ordering::Release);
                Err(ChannelError::Spawn { name, reason: err.to_string() })
            }
        }
    }

    /// Signals the dispatch thread to exit at its next boundary. Does not wait.
    pub fn stop(&self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            info!("factory: stop requested");
        }
    }

    /// Stops the dispatch thread and waits for it to exit.
    pub fn shutdown(&self) {
        self.stop();
        let handle = self.shared.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("factory: dispatch thread panicked");
            }
        }
    }

    /// Returns `true` while the dispatch thread is meant to run.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Creates a channel to `domain` and registers it, replacing any channel with the same key.
    ///
    /// Prefer [`ChannelFactory::open_channel`], which reuses an existing channel.
    pub fn new_channel(&self, domain: DomainId, local: Port, remote: Port) -> Result<Arc<Channel>> {
        let port = self.shared.ports.create_port(domain, local, remote)?;
        if let Err(err) = port.subscribe(TypeFilter::All) {
            port.close();
            return Err(err.into());
        }
        let channel = Arc::new(Channel::new(
            domain,
            port,
            Arc::downgrade(&self.shared.registry),
            self.shared.config.response_timeout(),
        ));
        self.shared.registry.insert(channel.clone());
        info!("factory: opened {channel}");
        Ok(channel)
    }

    /// Exact lookup on `(domain, local, remote)`.
    pub fn get_channel(&self, domain: DomainId, local: Port, remote: Port) -> Option<Arc<Channel>> {
        self.shared.registry.get(&ChannelKey { domain, local, remote })
    }

    /// Finds a channel to `domain`. Wildcard ports match anything.
    ///
    /// With several matches the earliest registered channel wins.
    pub fn find_channel(&self, domain: DomainId, local: Port, remote: Port) -> Option<Arc<Channel>> {
        if let Some(channel) = self.get_channel(domain, local, remote) {
            return Some(channel);
        }
        if !local.is_wildcard() && !remote.is_wildcard() {
            return None;
        }
        self.shared.registry.channels.lock().values().find(|chan| {
            let key = chan.key();
            key.domain == domain
                && (local.is_wildcard() || key.local == local)
                && (remote.is_wildcard() || key.remote == remote)
        }).cloned()
    }

    /// Returns the matching channel, creating it if none exists.
    pub fn open_channel(&self, domain: DomainId, local: Port, remote: Port) -> Result<Arc<Channel>> {
        let _guard = self.shared.open_lock.lock();
        if let Some(channel) = self.find_channel(domain, local, remote) {
            return Ok(channel);
        }
        self.new_channel(domain, local, remote)
    }

    /// Opens a channel using `local_port`/`remote_port` from `record`, falling back to the given
    /// defaults for missing or malformed fields.
    ///
    /// Returns `None` if the channel cannot be opened.
    pub fn restore_from_record(
        &self,
        record: &Record,
        domain: DomainId,
        default_local: Port,
        default_remote: Port,
    ) -> Option<Arc<Channel>> {
        let local = record.parse_or("local_port", default_local);
        let remote = record.parse_or("remote_port", default_remote);
        match self.open_channel(domain, local, remote) {
            Ok(channel) => Some(channel),
            Err(err) => {
                warn!("factory: restore dom{domain} ports {local}:{remote} failed: {err}");
                None
            }
        }
    }

    /// Snapshot of live channels in registration order.
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.shared.registry.snapshot()
    }
}

impl Drop for ChannelFactory {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(all(test, feature = "host"))]
mod tests {
    use super::*;
    use crate::host::HostPlatform;
    use proptest::prelude::*;

    fn factory(host: &HostPlatform) -> ChannelFactory {
        ChannelFactory::new(ChannelConfig::default(), Arc::new(host.clone()), Arc::new(host.clone()))
            .expect("factory")
    }

    #[test]
    fn configured_virqs_are_bound() {
        let host = HostPlatform::new();
        let _factory = factory(&host);
        assert!(host.virq_port(Virq::DOM_EXC).is_some());
    }

    #[test]
    fn open_channel_is_idempotent() {
        let host = HostPlatform::new();
        let factory = factory(&host);
        let a = factory.open_channel(DomainId(3), Port(10), Port(11)).unwrap();
        let b = factory.open_channel(DomainId(3), Port(10), Port(11)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.channels().len(), 1);
    }

    #[test]
    fn wildcard_open_allocates_and_reuses() {
        let host = HostPlatform::new();
        let factory = factory(&host);
        let a = factory.open_channel(DomainId(4), Port::WILDCARD, Port::WILDCARD).unwrap();
        assert!(!a.key().local.is_wildcard());
        assert!(!a.key().remote.is_wildcard());
        let b = factory.open_channel(DomainId(4), Port::WILDCARD, Port::WILDCARD).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn find_channel_first_registered_wins() {
        let host = HostPlatform::new();
        let factory = factory(&host);
        let first = factory.new_channel(DomainId(5), Port(20), Port(30)).unwrap();
        let second = factory.new_channel(DomainId(5), Port(21), Port(31)).unwrap();
        factory.new_channel(DomainId(6), Port(22), Port(32)).unwrap();

        let found = factory.find_channel(DomainId(5), Port::WILDCARD, Port::WILDCARD).unwrap();
        assert!(Arc::ptr_eq(&found, &first));
        let by_remote = factory.find_channel(DomainId(5), Port::WILDCARD, Port(31)).unwrap();
        assert!(Arc::ptr_eq(&by_remote, &second));
        assert!(factory.find_channel(DomainId(5), Port(20), Port(31)).is_none());
        assert!(factory.find_channel(DomainId(9), Port::WILDCARD, Port::WILDCARD).is_none());

        first.close();
        let found = factory.find_channel(DomainId(5), Port::WILDCARD, Port::WILDCARD).unwrap();
        assert!(Arc::ptr_eq(&found, &second));
    }

    #[test]
    fn restore_with_malformed_local_port_uses_default() {
        let host = HostPlatform::new();
        let factory = factory(&host);
        let record: Record = [("local_port", "bogus"), ("remote_port", "44")].into_iter().collect();
        let chan = factory.restore_from_record(&record, DomainId(8), Port(40), Port(41)).unwrap();
        assert_eq!(chan.key(), ChannelKey { domain: DomainId(8), local: Port(40), remote: Port(44) });
    }

    #[test]
    fn restore_failure_is_none() {
        let host = HostPlatform::new();
        let factory = factory(&host);
        host.fail_port_creation(true);
        assert!(factory.restore_from_record(&Record::new(), DomainId(8), Port(1), Port(2)).is_none());
        assert!(factory.channels().is_empty());
    }

    #[test]
    fn start_is_idempotent_and_stop_is_cooperative() {
        let host = HostPlatform::new();
        let config = ChannelConfig { idle_wait_ms: 10, ..ChannelConfig::default() };
        let factory =
            ChannelFactory::new(config, Arc::new(host.clone()), Arc::new(host.clone())).unwrap();
        factory.start().unwrap();
        factory.start().unwrap();
        assert!(factory.is_running());
        factory.shutdown();
        assert!(!factory.is_running());
        factory.start().unwrap();
        factory.shutdown();
    }

    #[test]
    fn concurrent_opens_share_one_channel() {
        let host = HostPlatform::new();
        let factory = Arc::new(factory(&host));
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let openers: Vec<_> = (0..8)
            .map(|_| {
                let (factory, barrier) = (factory.clone(), barrier.clone());
                thread::spawn(move || {
                    barrier.wait();
                    factory.open_channel(DomainId(2), Port(5), Port(3)).unwrap()
                })
            })
            .collect();
        let chans: Vec<Arc<Channel>> = openers.into_iter().map(|t| t.join().unwrap()).collect();
        assert!(chans.iter().all(|c| Arc::ptr_eq(c, &chans[0])));
        assert_eq!(factory.channels().len(), 1);
    }

    proptest! {
        #[test]
        fn repeated_opens_keep_one_channel_per_key(
            opens in proptest::collection::vec((1u32..4, 1u32..4, 1u32..4), 1..24)
        ) {
            let host = HostPlatform::new();
            let factory = factory(&host);
            let mut first_seen: HashMap<(u32, u32, u32), Arc<Channel>> = HashMap::new();
            for (dom, local, remote) in opens {
                let chan = factory.open_channel(DomainId(dom), Port(local), Port(remote)).unwrap();
                let first = first_seen.entry((dom, local, remote)).or_insert_with(|| chan.clone());
                prop_assert!(Arc::ptr_eq(first, &chan));
            }
            prop_assert_eq!(factory.channels().len(), first_seen.len());
        }
    }
}
