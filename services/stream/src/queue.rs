//! Bounded per-connection outbound queue
//!
//! A slow websocket consumer must never stall the dispatcher, so pushes
//! are non-blocking: when the queue is full the oldest message is dropped
//! to make room. Recent messages always win.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;
use types::stream::BusMessage;

pub struct OutboundQueue {
    capacity: usize,
    inner: Mutex<VecDeque<BusMessage>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking, evicting the oldest message on overflow.
    /// Pushes after close are discarded.
    pub fn push(&self, message: BusMessage) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(message);
        }
        self.notify.notify_one();
    }

    /// Wait for the next message. Returns `None` once the queue is closed
    /// and drained.
    pub async fn recv(&self) -> Option<BusMessage> {
        loop {
            // Register interest before checking state so a push between
            // the check and the await still wakes us.
            let notified = self.notify.notified();
            {
                let mut queue = self.inner.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(message) = queue.pop_front() {
                    return Some(message);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Total messages evicted under backpressure.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn message(tag: &str) -> BusMessage {
        BusMessage::system_error("TEST", tag)
    }

    fn tag(message: &BusMessage) -> String {
        message.data["message"].as_str().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = OutboundQueue::new(8);
        queue.push(message("a"));
        queue.push(message("b"));

        assert_eq!(tag(&queue.recv().await.unwrap()), "a");
        assert_eq!(tag(&queue.recv().await.unwrap()), "b");
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let queue = OutboundQueue::new(2);
        queue.push(message("a"));
        queue.push(message("b"));
        queue.push(message("c"));

        assert_eq!(queue.dropped_count(), 1);
        assert_eq!(tag(&queue.recv().await.unwrap()), "b");
        assert_eq!(tag(&queue.recv().await.unwrap()), "c");
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = OutboundQueue::new(8);
        queue.push(message("a"));
        queue.close();

        assert_eq!(tag(&queue.recv().await.unwrap()), "a");
        assert!(queue.recv().await.is_none());
        // Pushes after close are discarded.
        queue.push(message("late"));
        assert!(queue.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let queue = Arc::new(OutboundQueue::new(8));
        let reader = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.recv().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(message("wake"));

        let received = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(tag(&received), "wake");
    }
}
