//! Per-subscriber bounded delivery queues
//!
//! The publisher never waits on a subscriber: when a queue is full the
//! oldest snapshot is discarded to make room for the newest one. The
//! subscriber side awaits the next item through a `Notify`.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use types::candle::CandleSnapshot;

/// Result of pushing onto a subscriber queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest entry.
    DroppedOldest,
    /// Queue already closed; nothing queued.
    Closed,
}

#[derive(Debug)]
struct QueueState {
    messages: VecDeque<CandleSnapshot>,
    closed: bool,
    dropped: u64,
}

/// Bounded, drop-oldest, single-consumer queue.
#[derive(Debug)]
pub struct SubscriberQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    notify: Notify,
}

impl SubscriberQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                messages: VecDeque::with_capacity(capacity),
                closed: false,
                dropped: 0,
            }),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Enqueue without ever blocking.
    pub fn push(&self, snapshot: CandleSnapshot) -> PushOutcome {
        let outcome = {
            let Ok(mut state) = self.state.lock() else {
                return PushOutcome::Closed;
            };
            if state.closed {
                return PushOutcome::Closed;
            }
            let outcome = if state.messages.len() >= self.capacity {
                state.messages.pop_front();
                state.dropped += 1;
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Queued
            };
            state.messages.push_back(snapshot);
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Next snapshot, waiting if empty. `None` once closed and drained.
    pub async fn pop(&self) -> Option<CandleSnapshot> {
        loop {
            {
                let Ok(mut state) = self.state.lock() else {
                    return None;
                };
                if let Some(snapshot) = state.messages.pop_front() {
                    return Some(snapshot);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<CandleSnapshot> {
        self.state
            .lock()
            .ok()
            .and_then(|mut state| state.messages.pop_front())
    }

    /// Stop accepting snapshots and wake the consumer.
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|state| state.closed).unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|state| state.messages.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total snapshots discarded for this subscriber.
    pub fn dropped(&self) -> u64 {
        self.state.lock().map(|state| state.dropped).unwrap_or(0)
    }
}
