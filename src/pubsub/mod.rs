//! Event stream of a running execution.
//!
//! Observers attach with [`PubSub::subscribe`] and receive the history of
//! everything published so far plus a channel of what comes next. Delivery
//! is best effort with bounded latency: a subscriber whose buffer is full is
//! skipped (immediately, or after the configured send timeout), so a slow
//! observer can never stall the pipeline that publishes.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Subscription identifier. Never reused within one PubSub.
pub type Token = u64;

/// PubSub configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Capacity of each subscriber's channel.
    pub buffer_size: usize,
    /// How long a publish may wait on a full subscriber before dropping the
    /// event for it. Absent means never wait.
    pub send_timeout_ms: Option<u64>,
    /// Maximum number of events kept for replay. Absent means unbounded.
    pub history_limit: Option<usize>,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            buffer_size: 10,
            send_timeout_ms: None,
            history_limit: None,
        }
    }
}

impl PubSubConfig {
    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout_ms.map(Duration::from_millis)
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = Some(limit);
        self
    }
}

/// Something that happened during an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    description: String,
    timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Handle returned to an attached observer.
#[derive(Debug)]
pub struct Subscription {
    /// Identifies the subscription for [`PubSub::unsubscribe`].
    pub token: Token,
    /// Events published before the subscription, oldest first.
    pub history: Vec<Event>,
    /// Events published afterwards. Yields `None` once unsubscribed or
    /// closed.
    pub future: mpsc::Receiver<Event>,
}

struct Inner {
    history: VecDeque<Event>,
    subscribers: HashMap<Token, mpsc::Sender<Event>>,
    next_token: Token,
    closed: bool,
}

/// Broadcasts events to any number of subscribers with replay.
pub struct PubSub {
    config: PubSubConfig,
    inner: Mutex<Inner>,
}

impl PubSub {
    pub fn new(config: PubSubConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                history: VecDeque::new(),
                subscribers: HashMap::new(),
                next_token: 1,
                closed: false,
            }),
        }
    }

    pub fn config(&self) -> &PubSubConfig {
        &self.config
    }

    /// Attach a new subscriber.
    ///
    /// The history snapshot and the registration of the live channel happen
    /// under one lock: every event lands in exactly one of the two.
    pub async fn subscribe(&self) -> Result<Subscription> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(Error::failed_precondition("event stream is closed"));
        }

        let token = inner.next_token;
        inner.next_token += 1;

        let (tx, rx) = mpsc::channel(self.config.buffer_size.max(1));
        inner.subscribers.insert(token, tx);
        let history = inner.history.iter().cloned().collect();

        debug!(token, subscribers = inner.subscribers.len(), "Subscribed");
        Ok(Subscription {
            token,
            history,
            future: rx,
        })
    }

    /// Publish an event to the history and every current subscriber.
    pub async fn publish(&self, description: impl Into<String>) {
        let event = Event::new(description);
        let send_timeout = self.config.send_timeout();

        let mut inner = self.inner.lock().await;
        inner.history.push_back(event.clone());
        if let Some(limit) = self.config.history_limit {
            while inner.history.len() > limit {
                inner.history.pop_front();
            }
        }

        for (token, tx) in &inner.subscribers {
            let delivered = match send_timeout {
                Some(timeout) => tx.send_timeout(event.clone(), timeout).await.is_ok(),
                None => tx.try_send(event.clone()).is_ok(),
            };
            if !delivered {
                warn!(token = *token, "Subscriber not keeping up, dropped event");
            }
        }
    }

    /// Detach a subscriber and close its channel.
    pub async fn unsubscribe(&self, token: Token) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.subscribers.remove(&token) {
            // Dropping the sender closes the subscriber's channel.
            Some(_) => {
                debug!(token, "Unsubscribed");
                Ok(())
            }
            None => Err(Error::not_found(format!("subscription {}", token))),
        }
    }

    /// Close every remaining subscriber channel. History is kept.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        let count = inner.subscribers.len();
        inner.subscribers.clear();
        inner.closed = true;
        info!(subscribers = count, "Event stream closed");
    }

    /// Number of events available for replay.
    pub async fn history_len(&self) -> usize {
        self.inner.lock().await.history.len()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.lock().await.subscribers.len()
    }
}

impl Default for PubSub {
    fn default() -> Self {
        Self::new(PubSubConfig::default())
    }
}
