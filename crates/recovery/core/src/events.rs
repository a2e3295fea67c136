//! Recovery event channel.
//!
//! Fan-out of [`ErrorEvent`]s to any number of subscribers. Every subscriber
//! owns an unbounded queue: emitting never blocks and never drops an event,
//! and a slow subscriber only grows its own backlog. Events reach each
//! subscriber in emission order. Closing the channel ends every stream once
//! its backlog is drained.

use std::pin::Pin;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use crate::error::RecoveryError;

/// Failure or recovery notification. Never emitted for plain successes.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    /// Unique event id.
    pub event_id: Uuid,

    /// Operation the event belongs to.
    pub operation_id: String,

    /// Attempt number (1-indexed).
    pub attempt: u32,

    /// Attempts allowed for the call that produced the event.
    pub max_attempts: u32,

    /// What went wrong.
    pub error: RecoveryError,

    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,

    /// The caller got a result from a fallback.
    pub recovered_with_fallback: bool,
}

impl ErrorEvent {
    /// Create an event stamped now.
    pub fn new(
        operation_id: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
        error: RecoveryError,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            operation_id: operation_id.into(),
            attempt,
            max_attempts,
            error,
            timestamp: Utc::now(),
            recovered_with_fallback: false,
        }
    }

    /// Mark the event as recovered by a fallback.
    pub fn recovered(mut self) -> Self {
        self.recovered_with_fallback = true;
        self
    }
}

/// Multi-subscriber event channel.
pub struct EventChannel {
    /// `None` once closed.
    subscribers: Mutex<Option<Vec<mpsc::UnboundedSender<ErrorEvent>>>>,
}

impl EventChannel {
    /// Create an open channel with no subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Some(Vec::new())),
        }
    }

    /// Register a subscriber. Subscribing to a closed channel yields an
    /// already-finished subscription.
    pub fn subscribe(&self) -> EventSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(subscribers) = self.subscribers.lock().as_mut() {
            subscribers.push(tx);
        }
        EventSubscription { rx }
    }

    /// Deliver an event to every live subscriber. Returns how many received it.
    pub fn emit(&self, event: ErrorEvent) -> usize {
        let mut guard = self.subscribers.lock();
        let Some(subscribers) = guard.as_mut() else {
            trace!(operation_id = %event.operation_id, "Event dropped, channel closed");
            return 0;
        };
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .as_ref()
            .map(|subscribers| subscribers.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Close the channel. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        self.subscribers.lock().take().is_some()
    }

    /// Whether the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.subscribers.lock().is_none()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of an [`EventChannel`].
#[derive(Debug)]
pub struct EventSubscription {
    rx: mpsc::UnboundedReceiver<ErrorEvent>,
}

impl EventSubscription {
    /// Wait for the next event. `None` means the channel closed and the
    /// backlog is drained.
    pub async fn recv(&mut self) -> Option<ErrorEvent> {
        self.rx.recv().await
    }

    /// Take the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<ErrorEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain everything currently buffered.
    pub fn drain(&mut self) -> Vec<ErrorEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}

impl Stream for EventSubscription {
    type Item = ErrorEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OperationError;
    use futures::StreamExt;

    fn event(attempt: u32) -> ErrorEvent {
        ErrorEvent::new(
            "sync",
            attempt,
            5,
            RecoveryError::Operation(OperationError::Network("down".into())),
        )
    }

    #[tokio::test]
    async fn test_fan_out_in_order() {
        let channel = EventChannel::new();
        let mut first = channel.subscribe();
        let mut second = channel.subscribe();

        for attempt in 1..=3 {
            assert_eq!(channel.emit(event(attempt)), 2);
        }

        let attempts: Vec<u32> = first.drain().iter().map(|e| e.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert_eq!(second.recv().await.unwrap().attempt, 1);
        assert_eq!(second.recv().await.unwrap().attempt, 2);
    }

    #[tokio::test]
    async fn test_slow_subscriber_loses_nothing() {
        let channel = EventChannel::new();
        let mut subscription = channel.subscribe();

        for attempt in 0..10_000 {
            channel.emit(event(attempt));
        }

        assert_eq!(subscription.drain().len(), 10_000);
    }

    #[tokio::test]
    async fn test_close_ends_stream_after_backlog() {
        let channel = EventChannel::new();
        let subscription = channel.subscribe();
        channel.emit(event(1));
        assert!(channel.close());
        assert!(!channel.close());

        assert!(channel.is_closed());
        assert_eq!(channel.emit(event(2)), 0);

        let events: Vec<ErrorEvent> = subscription.collect().await;
        assert_eq!(events.len(), 1);

        let mut late = channel.subscribe();
        assert!(late.recv().await.is_none());
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let channel = EventChannel::new();
        let kept = channel.subscribe();
        let dropped = channel.subscribe();
        drop(dropped);

        assert_eq!(channel.subscriber_count(), 1);
        assert_eq!(channel.emit(event(1)), 1);
        drop(kept);
        assert_eq!(channel.emit(event(2)), 0);
    }
}
