//! Outbound chat queue between the pipeline and the chat client.
//!
//! Multi-producer ([`Outbox`], cloneable, thread-safe) to single consumer
//! ([`OutboundQueue`]). The consumer can push messages back to the front
//! after a lost connection, so nothing enqueued is ever dropped.
//! [`DeliveryTracker`] counts enqueued, sent and acknowledged messages and
//! exposes a "publish complete" signal.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};

use crate::error::AppError;
use crate::models::OutboundMessage;

pub fn outbound_channel() -> (Outbox, OutboundQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    let tracker = Arc::new(DeliveryTracker::new());
    (
        Outbox {
            tx,
            tracker: tracker.clone(),
        },
        OutboundQueue {
            rx,
            pending: VecDeque::new(),
            tracker,
            upstream_closed: false,
        },
    )
}

/// Producer handle.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<OutboundMessage>,
    tracker: Arc<DeliveryTracker>,
}

impl Outbox {
    pub fn enqueue(&self, message: OutboundMessage) -> Result<(), AppError> {
        self.tracker.record_enqueued();
        if self.tx.send(message).is_err() {
            self.tracker.record_withdrawn();
            return Err(AppError::ChannelClosed("outbound queue".into()));
        }
        Ok(())
    }

    pub fn delivery(&self) -> Arc<DeliveryTracker> {
        self.tracker.clone()
    }
}

/// Consumer handle, owned by the chat client.
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::UnboundedReceiver<OutboundMessage>,
    pending: VecDeque<OutboundMessage>,
    tracker: Arc<DeliveryTracker>,
    upstream_closed: bool,
}

impl OutboundQueue {
    /// Next message: requeued ones first, then fresh ones. `None` once every
    /// producer is gone and nothing is left.
    pub async fn next(&mut self) -> Option<OutboundMessage> {
        if let Some(message) = self.pending.pop_front() {
            return Some(message);
        }
        if self.upstream_closed {
            return None;
        }
        match self.rx.recv().await {
            Some(message) => Some(message),
            None => {
                self.upstream_closed = true;
                None
            }
        }
    }

    /// Put one message back at the head of the queue.
    pub fn requeue_front(&mut self, message: OutboundMessage) {
        self.pending.push_front(message);
    }

    /// Put several messages back at the head, keeping their order.
    pub fn requeue_all_front(&mut self, messages: impl IntoIterator<Item = OutboundMessage>) {
        let messages: Vec<_> = messages.into_iter().collect();
        for message in messages.into_iter().rev() {
            self.pending.push_front(message);
        }
    }

    /// True once producers are gone and the local buffer is drained.
    pub fn is_finished(&self) -> bool {
        self.upstream_closed && self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len() + self.rx.len()
    }

    pub fn tracker(&self) -> Arc<DeliveryTracker> {
        self.tracker.clone()
    }
}

/// Counter values at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryCounts {
    pub enqueued: u64,
    pub sent: u64,
    pub acknowledged: u64,
}

/// Shared delivery accounting.
///
/// Complete means every enqueued message has been acknowledged, which
/// implies `acknowledged == sent` with nothing left in the queue.
#[derive(Debug)]
pub struct DeliveryTracker {
    counts: Mutex<DeliveryCounts>,
    complete: watch::Sender<bool>,
}

impl DeliveryTracker {
    fn new() -> Self {
        let (complete, _) = watch::channel(true);
        Self {
            counts: Mutex::new(DeliveryCounts::default()),
            complete,
        }
    }

    pub fn counts(&self) -> DeliveryCounts {
        *self.counts.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn enqueued(&self) -> u64 {
        self.counts().enqueued
    }

    pub fn sent(&self) -> u64 {
        self.counts().sent
    }

    pub fn acknowledged(&self) -> u64 {
        self.counts().acknowledged
    }

    pub fn is_complete(&self) -> bool {
        *self.complete.borrow()
    }

    /// Resolves once all enqueued messages are acknowledged.
    pub async fn wait_complete(&self) {
        let mut rx = self.complete.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|complete| *complete).await;
    }

    pub fn record_sent(&self) {
        self.update(|c| c.sent += 1);
    }

    pub fn record_acknowledged(&self) {
        self.update(|c| c.acknowledged += 1);
    }

    /// `n` published but unacknowledged messages went back to the queue.
    pub fn record_requeued(&self, n: u64) {
        self.update(|c| c.sent = c.sent.saturating_sub(n));
    }

    fn record_enqueued(&self) {
        self.update(|c| c.enqueued += 1);
    }

    fn record_withdrawn(&self) {
        self.update(|c| c.enqueued = c.enqueued.saturating_sub(1));
    }

    fn update(&self, f: impl FnOnce(&mut DeliveryCounts)) {
        let mut counts = self.counts.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut counts);
        let complete = counts.acknowledged >= counts.enqueued;
        // Publish while still holding the lock so signal and counters agree.
        self.complete.send_if_modified(|current| {
            let changed = *current != complete;
            *current = complete;
            changed
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn msg(n: u32) -> OutboundMessage {
        OutboundMessage::text(format!("u{n}"), format!("hello {n}"))
    }

    #[tokio::test]
    async fn requeued_messages_come_out_first_in_order() {
        let (outbox, mut queue) = outbound_channel();
        outbox.enqueue(msg(1)).unwrap();
        outbox.enqueue(msg(2)).unwrap();

        let first = queue.next().await.unwrap();
        let second = queue.next().await.unwrap();
        outbox.enqueue(msg(3)).unwrap();
        queue.requeue_all_front([first, second]);

        assert_eq!(queue.next().await.unwrap(), msg(1));
        assert_eq!(queue.next().await.unwrap(), msg(2));
        assert_eq!(queue.next().await.unwrap(), msg(3));
    }

    #[tokio::test]
    async fn queue_finishes_after_producers_drop() {
        let (outbox, mut queue) = outbound_channel();
        outbox.enqueue(msg(1)).unwrap();
        drop(outbox);

        assert!(queue.next().await.is_some());
        assert!(queue.next().await.is_none());
        assert!(queue.is_finished());

        queue.requeue_front(msg(9));
        assert!(!queue.is_finished());
        assert_eq!(queue.next().await.unwrap(), msg(9));
    }

    #[tokio::test]
    async fn completion_tracks_acknowledgements() {
        let (outbox, _queue) = outbound_channel();
        let tracker = outbox.delivery();
        assert!(tracker.is_complete());

        outbox.enqueue(msg(1)).unwrap();
        outbox.enqueue(msg(2)).unwrap();
        assert!(!tracker.is_complete());

        tracker.record_sent();
        tracker.record_sent();
        tracker.record_acknowledged();
        // Connection lost with one message unacknowledged.
        tracker.record_requeued(1);
        assert_eq!(
            tracker.counts(),
            DeliveryCounts {
                enqueued: 2,
                sent: 1,
                acknowledged: 1
            }
        );

        tracker.record_sent();
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_complete().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        tracker.record_acknowledged();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tracker.sent(), tracker.acknowledged());
    }

    #[test]
    fn enqueue_after_consumer_dropped_fails() {
        let (outbox, queue) = outbound_channel();
        drop(queue);
        assert!(matches!(
            outbox.enqueue(msg(1)),
            Err(AppError::ChannelClosed(_))
        ));
        assert_eq!(outbox.delivery().enqueued(), 0);
    }
}
