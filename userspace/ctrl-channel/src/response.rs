// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Request/response correlation by message id
//! OWNERS: @runtime
//! STATUS: Functional
//! TEST_COVERAGE: Unit-tested (host)
//!
//! The id table lock is held only for insert/lookup/remove. Waiting happens on the per-message
//! [`PendingResponse`], so the dispatch thread resolving a response never blocks on a slow
//! waiter.
//!
//! Delivery is exactly-once per id: whichever of resolve, cancel or timeout removes the table
//! entry first decides the outcome, and late responses for a removed id are dropped.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ctrl_abi::{Message, MessageId};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::{ChannelError, Result};

/// Bound applied to a synchronous call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Timeout {
    /// The channel's configured default bound.
    #[default]
    Default,
    /// Wait until a response arrives or the wait is cancelled.
    Forever,
    /// Wait at most this long. A zero duration waits forever.
    After(Duration),
}

impl Timeout {
    /// Maps a timeout in seconds; zero, negative or unrepresentable values wait forever.
    pub fn from_secs_f64(secs: f64) -> Self {
        if secs > 0.0 {
            Duration::try_from_secs_f64(secs).map_or(Self::Forever, Self::After)
        } else {
            Self::Forever
        }
    }

    /// Resolves to a concrete bound, `None` meaning no bound.
    pub fn bound(self, default: Duration) -> Option<Duration> {
        match self {
            Self::Default => Some(default).filter(|d| !d.is_zero()),
            Self::Forever => None,
            Self::After(d) => Some(d).filter(|d| !d.is_zero()),
        }
    }
}

enum Slot {
    Waiting,
    Delivered(Message),
    Cancelled,
}

/// Waiter for the response to one outstanding request.
pub struct PendingResponse {
    id: MessageId,
    slot: Mutex<Slot>,
    ready: Condvar,
}

impl PendingResponse {
    fn new(id: MessageId) -> Self {
        Self { id, slot: Mutex::new(Slot::Waiting), ready: Condvar::new() }
    }

    /// Message id this waiter is keyed by.
    pub fn id(&self) -> MessageId {
        self.id
    }

    fn deliver(&self, msg: Message) {
        *self.slot.lock() = Slot::Delivered(msg);
        self.ready.notify_all();
    }

    fn cancel(&self) {
        let mut slot = self.slot.lock();
        if matches!(*slot, Slot::Waiting) {
            *slot = Slot::Cancelled;
        }
        drop(slot);
        self.ready.notify_all();
    }

    fn take(slot: &mut Slot) -> Option<Result<Message>> {
        match mem::replace(slot, Slot::Waiting) {
            Slot::Delivered(msg) => Some(Ok(msg)),
            Slot::Cancelled => Some(Err(ChannelError::Cancelled)),
            Slot::Waiting => None,
        }
    }

    fn wait(&self, bound: Option<Duration>) -> Result<Message> {
        // A bound past the clock's range is no bound at all.
        let deadline = bound.and_then(|b| Instant::now().checked_add(b));
        let mut slot = self.slot.lock();
        loop {
            if let Some(outcome) = Self::take(&mut slot) {
                return outcome;
            }
            match deadline {
                None => self.ready.wait(&mut slot),
                Some(deadline) => {
                    if self.ready.wait_until(&mut slot, deadline).timed_out() {
                        return Self::take(&mut slot).unwrap_or(Err(ChannelError::Timeout));
                    }
                }
            }
        }
    }
}

/// Table of waiters keyed by message id, owned by one channel.
#[derive(Default)]
pub struct ResponseQueue {
    pending: Mutex<HashMap<MessageId, Arc<PendingResponse>>>,
}

impl ResponseQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `msg.id`, sends the request via `send`, then blocks for the
    /// response.
    ///
    /// `bound` of `None` waits until a response arrives or the wait is cancelled. On timeout or
    /// send failure the waiter is removed from the table.
    pub fn call(
        &self,
        msg: &Message,
        bound: Option<Duration>,
        send: impl FnOnce(&Message) -> Result<()>,
    ) -> Result<Message> {
        let waiter = Arc::new(PendingResponse::new(msg.id));
        let displaced = self.pending.lock().insert(msg.id, waiter.clone());
        if let Some(old) = displaced {
            warn!("response queue: id {} reused while outstanding; cancelling previous waiter", msg.id);
            old.cancel();
        }

        if let Err(err) = send(msg) {
            self.forget(&waiter);
            return Err(err);
        }

        let outcome = waiter.wait(bound);
        if matches!(outcome, Err(ChannelError::Timeout)) {
            self.forget(&waiter);
        }
        outcome
    }

    /// Delivers `msg` to the waiter registered under `id`.
    ///
    /// Returns `false` when no waiter exists (late or duplicate response); the message is
    /// dropped.
    pub fn resolve(&self, id: MessageId, msg: Message) -> bool {
        let waiter = self.pending.lock().remove(&id);
        match waiter {
            Some(waiter) => {
                waiter.deliver(msg);
                true
            }
            None => {
                debug!("response queue: no waiter for id {id}, dropped");
                false
            }
        }
    }

    /// Cancels every outstanding waiter. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().map(|(_, waiter)| waiter).collect();
        for waiter in &drained {
            waiter.cancel();
        }
        drained.len()
    }

    /// Number of outstanding waiters.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns `true` if nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Returns `true` if a waiter is registered under `id`.
    pub fn is_pending(&self, id: MessageId) -> bool {
        self.pending.lock().contains_key(&id)
    }

    // Removes the entry only if it still belongs to `waiter`.
    fn forget(&self, waiter: &Arc<PendingResponse>) {
        let mut pending = self.pending.lock();
        if pending.get(&waiter.id).is_some_and(|current| Arc::ptr_eq(current, waiter)) {
            pending.remove(&waiter.id);
        }
    }
}
