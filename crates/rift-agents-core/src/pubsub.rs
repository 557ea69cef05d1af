//! Fire-once topic registry bridging a parked request to a later answer.
//!
//! Each topic holds at most one subscriber. Publishing hands the value to that
//! subscriber and clears the topic; there is no buffering and no fan-out.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;
use tokio::sync::oneshot;

/// Pub/sub error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PubSubError {
    #[error("Topic already has a pending subscriber: {0}")]
    AlreadySubscribed(String),
    #[error("No subscriber for topic: {0}")]
    NoSubscriber(String),
    #[error("Subscription cancelled: {0}")]
    Cancelled(String),
}

/// Pending answer for one topic.
#[derive(Debug)]
pub struct Subscription<T> {
    topic: String,
    rx: oneshot::Receiver<T>,
}

impl<T> Subscription<T> {
    /// Topic this subscription waits on.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the published value. There is no timeout.
    ///
    /// # Errors
    /// Returns `Cancelled` if the topic was cancelled before a publish.
    pub async fn recv(self) -> Result<T, PubSubError> {
        self.rx.await.map_err(|_| PubSubError::Cancelled(self.topic))
    }
}

/// Single-subscriber, fire-once registry.
#[derive(Debug)]
pub struct PubSub<T> {
    topics: Mutex<HashMap<String, oneshot::Sender<T>>>,
}

impl<T> Default for PubSub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PubSub<T> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn topics(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<T>>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the sole subscriber for `topic`.
    ///
    /// A previous subscriber whose receiver was dropped does not count.
    ///
    /// # Errors
    /// Returns `AlreadySubscribed` if a live subscriber is pending.
    pub fn subscribe(&self, topic: impl Into<String>) -> Result<Subscription<T>, PubSubError> {
        let topic = topic.into();
        let mut topics = self.topics();
        if topics.get(&topic).is_some_and(|tx| !tx.is_closed()) {
            return Err(PubSubError::AlreadySubscribed(topic));
        }
        let (tx, rx) = oneshot::channel();
        topics.insert(topic.clone(), tx);
        tracing::trace!(%topic, "subscribed");
        Ok(Subscription { topic, rx })
    }

    /// Deliver `value` to the pending subscriber and clear the topic.
    ///
    /// # Errors
    /// Returns `NoSubscriber` if nobody is waiting, including a second
    /// publish after the first consumed the subscription.
    pub fn publish(&self, topic: &str, value: T) -> Result<(), PubSubError> {
        let tx = self
            .topics()
            .remove(topic)
            .ok_or_else(|| PubSubError::NoSubscriber(topic.to_string()))?;
        tx.send(value)
            .map_err(|_| PubSubError::NoSubscriber(topic.to_string()))?;
        tracing::trace!(%topic, "published");
        Ok(())
    }

    /// Whether a live subscriber waits on `topic`.
    #[must_use]
    pub fn is_pending(&self, topic: &str) -> bool {
        self.topics().get(topic).is_some_and(|tx| !tx.is_closed())
    }

    /// Drop the subscriber of `topic`; its `recv` resolves to `Cancelled`.
    pub fn cancel(&self, topic: &str) -> bool {
        self.topics().remove(topic).is_some()
    }

    /// Drop every subscriber.
    pub fn cancel_all(&self) -> usize {
        let mut topics = self.topics();
        let n = topics.len();
        topics.clear();
        n
    }
}
