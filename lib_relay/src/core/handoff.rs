//! # Handoff Channel
//!
//! The FIFO that decouples the ingestion rate (bounded by the exchange tick rate) from the
//! forwarding rate (bounded by the downstream socket). A slow or reconnecting downstream
//! never stalls the upstream read loop because `push` never waits.
//!
//! ## Behavior
//!
//! - **FIFO**: items come out in push order, whatever the number of producers.
//! - **Blocking pop**: `pop` suspends the calling task until an item is queued or the
//!   channel is closed.
//! - **Close**: `close` wakes every waiting consumer. Items already queued are still
//!   handed out; once drained, `pop` returns `None` immediately.
//! - **Capacity**: unbounded by default, so a long downstream outage grows the queue
//!   until process memory runs out. A capacity can be set together with an
//!   `OverflowPolicy` that decides what to give up when the queue is full.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

/// What a full, bounded channel does with the next push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest queued item to make room. Keeps the freshest prices.
    #[default]
    DropOldest,
    /// Refuse the new item and keep the queue as it is.
    RejectNewest,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop-oldest" | "drop_oldest" | "dropoldest" => Ok(Self::DropOldest),
            "reject-newest" | "reject_newest" | "rejectnewest" => Ok(Self::RejectNewest),
            other => Err(format!(
                "unknown overflow policy '{}' (expected drop-oldest or reject-newest)",
                other
            )),
        }
    }
}

/// Result of a `push`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The item was appended.
    Queued,
    /// The item was appended after evicting the oldest one.
    DisplacedOldest,
    /// The queue was full and the item was dropped.
    Rejected,
    /// The channel is closed and the item was dropped.
    Closed,
}

struct Queue<T> {
    items: VecDeque<T>,
    closed: bool,
}

struct Inner<T> {
    queue: Mutex<Queue<T>>,
    available: Notify,
    capacity: Option<usize>,
    policy: OverflowPolicy,
}

/// Multi-producer FIFO with an awaitable `pop`. Cloning yields another handle to the same
/// queue.
pub struct HandoffChannel<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for HandoffChannel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for HandoffChannel<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl<T> HandoffChannel<T> {
    /// A channel with no capacity limit.
    pub fn unbounded() -> Self {
        Self::with_capacity(None, OverflowPolicy::default())
    }

    /// A channel holding at most `capacity` items (at least one).
    pub fn bounded(capacity: usize, policy: OverflowPolicy) -> Self {
        Self::with_capacity(Some(capacity), policy)
    }

    pub fn with_capacity(capacity: Option<usize>, policy: OverflowPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(Queue {
                    items: VecDeque::new(),
                    closed: false,
                }),
                available: Notify::new(),
                capacity: capacity.map(|c| c.max(1)),
                policy,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queue<T>> {
        self.inner.queue.lock().expect("Handoff queue lock poisoned")
    }

    /// Appends an item without ever waiting.
    pub fn push(&self, item: T) -> PushOutcome {
        let outcome = {
            let mut queue = self.lock();
            if queue.closed {
                return PushOutcome::Closed;
            }

            match self.inner.capacity {
                Some(capacity) if queue.items.len() >= capacity => match self.inner.policy {
                    OverflowPolicy::DropOldest => {
                        queue.items.pop_front();
                        queue.items.push_back(item);
                        PushOutcome::DisplacedOldest
                    }
                    OverflowPolicy::RejectNewest => return PushOutcome::Rejected,
                },
                _ => {
                    queue.items.push_back(item);
                    PushOutcome::Queued
                }
            }
        };

        self.inner.available.notify_one();
        outcome
    }

    /// Waits for the next item. Returns `None` once the channel is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            // Register before checking so a push between the check and the await is not lost.
            notified.as_mut().enable();

            {
                let mut queue = self.lock();
                if let Some(item) = queue.items.pop_front() {
                    return Some(item);
                }
                if queue.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Takes the next item if one is queued.
    pub fn try_pop(&self) -> Option<T> {
        self.lock().items.pop_front()
    }

    /// Refuses further pushes and wakes every consumer waiting in `pop`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.inner.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.inner.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn pops_in_push_order() {
        let channel = HandoffChannel::unbounded();
        for i in 0..5 {
            assert_eq!(channel.push(i), PushOutcome::Queued);
        }
        for i in 0..5 {
            assert_eq!(channel.pop().await, Some(i));
        }
        assert!(channel.is_empty());
    }

    #[tokio::test]
    async fn preserves_each_producers_order_with_many_producers() {
        let channel = HandoffChannel::unbounded();
        let mut producers = Vec::new();
        for producer in 0..4u32 {
            let tx = channel.clone();
            producers.push(tokio::spawn(async move {
                for seq in 0..250u32 {
                    tx.push((producer, seq));
                    if seq % 50 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }
        channel.close();

        let mut last_seen = [None::<u32>; 4];
        let mut total = 0;
        while let Some((producer, seq)) = channel.pop().await {
            let slot = &mut last_seen[producer as usize];
            if let Some(prev) = *slot {
                assert!(seq > prev, "producer {} went backwards", producer);
            }
            *slot = Some(seq);
            total += 1;
        }
        assert_eq!(total, 1000);
    }

    #[tokio::test]
    async fn pop_waits_for_a_later_push() {
        let channel = HandoffChannel::unbounded();
        let consumer = {
            let rx = channel.clone();
            tokio::spawn(async move { rx.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        channel.push("late");
        let popped = timeout(Duration::from_secs(1), consumer).await.unwrap().unwrap();
        assert_eq!(popped, Some("late"));
    }

    #[tokio::test]
    async fn close_wakes_blocked_consumers() {
        let channel: HandoffChannel<String> = HandoffChannel::unbounded();
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let rx = channel.clone();
                tokio::spawn(async move { rx.pop().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        channel.close();
        for consumer in consumers {
            let popped = timeout(Duration::from_secs(1), consumer).await.unwrap().unwrap();
            assert_eq!(popped, None);
        }
    }

    #[tokio::test]
    async fn drains_before_reporting_closed() {
        let channel = HandoffChannel::unbounded();
        channel.push(1);
        channel.push(2);
        channel.close();

        assert_eq!(channel.push(3), PushOutcome::Closed);
        assert_eq!(channel.pop().await, Some(1));
        assert_eq!(channel.pop().await, Some(2));
        let closed = timeout(Duration::from_millis(100), channel.pop()).await.unwrap();
        assert_eq!(closed, None);
    }

    #[tokio::test]
    async fn bounded_drop_oldest_keeps_newest_items() {
        let channel = HandoffChannel::bounded(2, OverflowPolicy::DropOldest);
        assert_eq!(channel.push("a"), PushOutcome::Queued);
        assert_eq!(channel.push("b"), PushOutcome::Queued);
        assert_eq!(channel.push("c"), PushOutcome::DisplacedOldest);
        assert_eq!(channel.len(), 2);
        assert_eq!(channel.try_pop(), Some("b"));
        assert_eq!(channel.try_pop(), Some("c"));
    }

    #[test]
    fn bounded_reject_newest_keeps_queue() {
        let channel = HandoffChannel::bounded(1, OverflowPolicy::RejectNewest);
        assert_eq!(channel.push("a"), PushOutcome::Queued);
        assert_eq!(channel.push("b"), PushOutcome::Rejected);
        assert_eq!(channel.try_pop(), Some("a"));
        assert_eq!(channel.try_pop(), None);
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let channel: HandoffChannel<u8> = HandoffChannel::bounded(0, OverflowPolicy::DropOldest);
        assert_eq!(channel.capacity(), Some(1));
    }

    #[test]
    fn parses_overflow_policy() {
        assert_eq!("drop-oldest".parse::<OverflowPolicy>(), Ok(OverflowPolicy::DropOldest));
        assert_eq!("Reject_Newest".parse::<OverflowPolicy>(), Ok(OverflowPolicy::RejectNewest));
        assert!("block".parse::<OverflowPolicy>().is_err());
    }
}
