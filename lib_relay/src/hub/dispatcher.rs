//! # Topic Dispatcher
//!
//! The registry behind the broadcast hub: which subscriber exists, which topics it listens
//! to, and how a published frame reaches each of them.
//!
//! ## Fan-out
//!
//! Every subscriber owns a bounded queue drained by its own socket task. `publish` only
//! ever calls `try_send` on those queues, so it never waits on a subscriber. When a queue
//! is full the `SlowSubscriberPolicy` decides: drop the frame for that subscriber alone, or
//! evict the subscriber (its session is told to close). A subscriber whose task is gone is
//! removed on the next publish that reaches it.
//!
//! Frames are cloned once per subscriber; with `Bytes`-backed messages that is a reference
//! count bump, not a copy of the payload.
//!
//! Subscriber ids come from a counter and are never reused. A subscriber only sees frames
//! published while it is registered: nothing is replayed on connect.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// The topic significant moves are published on.
pub const DEFAULT_TOPIC: &str = "trades";

/// Frames a subscriber may have in flight before the slow-subscriber policy applies.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

pub type SubscriberId = u64;

/// What `publish` does for a subscriber whose queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlowSubscriberPolicy {
    /// Skip this frame for the slow subscriber only.
    #[default]
    Drop,
    /// Remove the subscriber and close its connection.
    Disconnect,
}

impl FromStr for SlowSubscriberPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "disconnect" => Ok(Self::Disconnect),
            other => Err(format!(
                "unknown slow subscriber policy '{}' (expected drop or disconnect)",
                other
            )),
        }
    }
}

/// The receiving end handed to a subscriber's session task.
pub struct Subscription<T> {
    pub id: SubscriberId,
    frames: mpsc::Receiver<T>,
    evicted: CancellationToken,
}

impl<T> Subscription<T> {
    /// Next frame, or `None` once the subscriber has been removed and its queue drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.frames.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.frames.try_recv().ok()
    }

    /// Fires when the dispatcher evicts this subscriber for being too slow.
    pub fn evicted(&self) -> CancellationToken {
        self.evicted.clone()
    }
}

/// Outcome of a single `publish` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
    pub evicted: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStatsSnapshot {
    pub subscribers: usize,
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub evicted: u64,
}

struct Subscriber<T> {
    sender: mpsc::Sender<T>,
    topics: HashSet<String>,
    dropped: u64,
    evicted: CancellationToken,
}

struct Registry<T> {
    subscribers: HashMap<SubscriberId, Subscriber<T>>,
    topics: HashMap<String, BTreeSet<SubscriberId>>,
}

impl<T> Registry<T> {
    fn remove(&mut self, id: SubscriberId) -> Option<Subscriber<T>> {
        let subscriber = self.subscribers.remove(&id)?;
        for topic in &subscriber.topics {
            if let Some(members) = self.topics.get_mut(topic) {
                members.remove(&id);
                if members.is_empty() {
                    self.topics.remove(topic);
                }
            }
        }
        Some(subscriber)
    }
}

pub struct TopicDispatcher<T> {
    registry: Mutex<Registry<T>>,
    next_id: AtomicU64,
    buffer: usize,
    policy: SlowSubscriberPolicy,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    evicted: AtomicU64,
}

impl<T: Clone> TopicDispatcher<T> {
    pub fn new(buffer: usize, policy: SlowSubscriberPolicy) -> Self {
        Self {
            registry: Mutex::new(Registry {
                subscribers: HashMap::new(),
                topics: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            policy,
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry<T>> {
        self.registry.lock().expect("Dispatcher lock poisoned")
    }

    pub fn policy(&self) -> SlowSubscriberPolicy {
        self.policy
    }

    /// Registers a new subscriber with no topics.
    pub fn connect(&self) -> Subscription<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, frames) = mpsc::channel(self.buffer);
        let evicted = CancellationToken::new();

        self.lock().subscribers.insert(
            id,
            Subscriber {
                sender,
                topics: HashSet::new(),
                dropped: 0,
                evicted: evicted.clone(),
            },
        );
        log::debug!("[Hub] Subscriber {} registered", id);

        Subscription {
            id,
            frames,
            evicted,
        }
    }

    /// Adds `id` to `topic`. `false` if the subscriber is unknown or already listening.
    pub fn subscribe(&self, id: SubscriberId, topic: &str) -> bool {
        let mut registry = self.lock();
        let Some(subscriber) = registry.subscribers.get_mut(&id) else {
            return false;
        };
        if !subscriber.topics.insert(topic.to_string()) {
            return false;
        }
        registry.topics.entry(topic.to_string()).or_default().insert(id);
        true
    }

    pub fn unsubscribe(&self, id: SubscriberId, topic: &str) -> bool {
        let mut registry = self.lock();
        let Some(subscriber) = registry.subscribers.get_mut(&id) else {
            return false;
        };
        if !subscriber.topics.remove(topic) {
            return false;
        }
        if let Some(members) = registry.topics.get_mut(topic) {
            members.remove(&id);
            if members.is_empty() {
                registry.topics.remove(topic);
            }
        }
        true
    }

    /// Forgets a subscriber entirely. Returns the number of frames dropped for it.
    pub fn disconnect(&self, id: SubscriberId) -> Option<u64> {
        let removed = self.lock().remove(id)?;
        log::debug!("[Hub] Subscriber {} removed ({} frames dropped)", id, removed.dropped);
        Some(removed.dropped)
    }

    /// Offers `frame` to every subscriber of `topic` without waiting on any of them.
    pub fn publish(&self, topic: &str, frame: T) -> PublishReport {
        let mut report = PublishReport::default();
        let mut registry = self.lock();
        self.published.fetch_add(1, Ordering::Relaxed);

        let Some(members) = registry.topics.get(topic) else {
            return report;
        };
        let members: Vec<SubscriberId> = members.iter().copied().collect();

        let mut gone = Vec::new();
        for id in members {
            let Some(subscriber) = registry.subscribers.get_mut(&id) else {
                continue;
            };
            match subscriber.sender.try_send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => match self.policy {
                    SlowSubscriberPolicy::Drop => {
                        subscriber.dropped += 1;
                        report.dropped += 1;
                    }
                    SlowSubscriberPolicy::Disconnect => {
                        log::warn!("[Hub] Subscriber {} is too slow, disconnecting.", id);
                        subscriber.evicted.cancel();
                        report.evicted += 1;
                        gone.push(id);
                    }
                },
                Err(TrySendError::Closed(_)) => gone.push(id),
            }
        }
        for id in gone {
            registry.remove(id);
        }

        self.delivered.fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.dropped.fetch_add(report.dropped as u64, Ordering::Relaxed);
        self.evicted.fetch_add(report.evicted as u64, Ordering::Relaxed);
        report
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn topic_subscriber_count(&self, topic: &str) -> usize {
        self.lock().topics.get(topic).map_or(0, BTreeSet::len)
    }

    pub fn stats(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            subscribers: self.subscriber_count(),
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}
