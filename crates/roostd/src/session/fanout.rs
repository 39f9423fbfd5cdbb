// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Broadcast primitive owning the replay ring and the subscriber set.
//!
//! The two live in one object so nothing can interleave between the ring
//! append and the broadcast; that is what makes "replay, then live from
//! now" gap- and overlap-free for subscribers that attach in that order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::ring::ReplayRing;

/// Per-subscriber queue depth: absorbs a ~8 MiB burst at 32 KiB payloads
/// without ever blocking the reader.
pub const SUBSCRIBER_QUEUE: usize = 256;

struct SubscriberSlot {
    tx: mpsc::Sender<Bytes>,
    dropped: Arc<AtomicU64>,
}

/// Replay ring plus live subscriber set for one session.
pub struct Fanout {
    ring: Mutex<ReplayRing>,
    /// LOCK ORDER: `ring` before `subscribers`; the two are held together
    /// only inside [`publish`](Self::publish) and subscriber registration.
    subscribers: Mutex<HashMap<u64, SubscriberSlot>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Fanout {
    pub fn new(ring_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            ring: Mutex::new(ReplayRing::new(ring_capacity)),
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    /// Append one chunk to the ring, then offer it to every subscriber.
    ///
    /// A subscriber whose queue is full loses this payload (and only this
    /// payload); the others are unaffected. No-op after close.
    pub fn publish(&self, data: &[u8]) {
        if data.is_empty() || self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut ring = self.ring.lock();
        let mut subscribers = self.subscribers.lock();
        ring.append(data);
        drop(ring);

        let payload = Bytes::copy_from_slice(data);
        let mut gone = Vec::new();
        for (id, slot) in subscribers.iter() {
            match slot.tx.try_send(payload.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    slot.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => gone.push(*id),
            }
        }
        for id in gone {
            subscribers.remove(&id);
        }
    }

    /// Register a subscriber receiving every payload published from now on.
    ///
    /// After close, the returned subscription is already ended.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let dropped = Arc::new(AtomicU64::new(0));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        if !self.closed.load(Ordering::Acquire) {
            let mut subscribers = self.subscribers.lock();
            // Re-check under the lock so close() cannot race a late insert.
            if !self.closed.load(Ordering::Acquire) {
                subscribers.insert(
                    id,
                    SubscriberSlot { tx, dropped: Arc::clone(&dropped) },
                );
            }
        }
        // If the tx was not registered it drops here and rx reads None.

        Subscription { rx, dropped, fanout: Arc::downgrade(self), id }
    }

    /// Atomic "catch up, then follow": ring snapshot plus a subscription
    /// registered before the ring lock is released, so the snapshot and the
    /// stream neither overlap nor leave a gap.
    pub fn subscribe_with_replay(self: &Arc<Self>) -> (Vec<u8>, Subscription) {
        let ring = self.ring.lock();
        let snapshot = ring.snapshot();
        let sub = self.subscribe();
        drop(ring);
        (snapshot, sub)
    }

    /// Point-in-time copy of the replay ring.
    pub fn replay(&self) -> Vec<u8> {
        self.ring.lock().snapshot()
    }

    /// Copy of at most `max` of the most recent bytes.
    pub fn tail(&self, max: usize) -> Vec<u8> {
        self.ring.lock().tail(max)
    }

    /// Total bytes ever published.
    pub fn total_published(&self) -> u64 {
        self.ring.lock().total_appended()
    }

    /// Close every subscriber channel and refuse new payloads.
    ///
    /// Runs the teardown at most once; later calls are no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut subscribers = self.subscribers.lock();
        subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A live subscriber: bounded payload stream plus a drop counter.
///
/// Cancelling (explicitly or by drop) removes the subscriber immediately;
/// both paths are idempotent.
pub struct Subscription {
    rx: mpsc::Receiver<Bytes>,
    dropped: Arc<AtomicU64>,
    fanout: Weak<Fanout>,
    id: u64,
}

impl Subscription {
    /// Receive the next payload; `None` once the session ended or the
    /// subscription was cancelled.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Payloads lost to a full queue so far.
    pub fn dropped_payloads(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Remove this subscriber from the broadcast set.
    pub fn cancel(&self) {
        if let Some(fanout) = self.fanout.upgrade() {
            fanout.subscribers.lock().remove(&self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
#[path = "fanout_tests.rs"]
mod tests;
