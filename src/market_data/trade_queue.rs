// =============================================================================
// TradeQueue — bounded SPSC handoff between connector and interpreter
// =============================================================================
//
// Single producer (the WebSocket connector), single consumer (the trade
// interpreter). On overflow the oldest trade is dropped and counted; the
// producer never blocks. A hard reset rebinds a fresh connector to the same
// queue, so queued trades survive connector replacement.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::types::Trade;

/// Default queue capacity.
pub const TRADE_QUEUE_CAPACITY: usize = 4096;

pub struct TradeQueue {
    inner: Mutex<VecDeque<Trade>>,
    capacity: usize,
    dropped: AtomicU64,
    notify: Notify,
}

impl TradeQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Enqueue a trade, dropping the oldest entry when full.
    pub fn push(&self, trade: Trade) {
        {
            let mut queue = self.inner.lock();
            if queue.len() == self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(trade);
        }
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<Trade> {
        self.inner.lock().pop_front()
    }

    /// Await the next trade. Cancellation-safe: callers wrap this in
    /// `tokio::select!` with their stop signal.
    pub async fn pop(&self) -> Trade {
        loop {
            if let Some(trade) = self.try_pop() {
                return trade;
            }
            self.notify.notified().await;
        }
    }

    /// Await the next trade for at most `timeout`.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<Trade> {
        tokio::time::timeout(timeout, self.pop()).await.ok()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Total trades discarded due to overflow since construction.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
