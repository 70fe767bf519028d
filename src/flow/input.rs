//! Consumer side of a stage: where its requests come from.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Interval, MissedTickBehavior};
use tracing::debug;

use super::{Connection, ConnectionRef, State, StateId};
use crate::error::{Error, Result};
use crate::reflection::Message;

/// How a stage combines its incoming flows.
///
/// Only `Single` has behavior. `Merge` and `Collect` are reserved for stages
/// fed by several producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
    /// Exactly one flow, carrying whole messages or one field.
    Single,
    /// Several flows, each filling one field of the request.
    Merge,
    /// Several flows, messages gathered by correlation id.
    Collect,
}

/// Flows registered on the consumer side of one stage.
#[derive(Debug, Clone)]
pub struct InputConfig {
    stage: String,
    connections: Vec<ConnectionRef>,
}

impl InputConfig {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            connections: Vec::new(),
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn connections(&self) -> &[ConnectionRef] {
        &self.connections
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Add an incoming connection.
    ///
    /// A whole-message connection must be the only one on the stage, and
    /// field-scoped connections must target distinct fields.
    pub fn register(&mut self, connection: ConnectionRef) -> Result<()> {
        if self.connections.iter().any(|c| c.is_whole_message()) {
            return Err(Error::failed_precondition(format!(
                "stage {} already receives an entire message",
                self.stage
            )));
        }
        if connection.is_whole_message() && !self.connections.is_empty() {
            return Err(Error::failed_precondition(format!(
                "stage {} already has {} field inputs, cannot receive an entire message",
                self.stage,
                self.connections.len()
            )));
        }
        if let Some(existing) = self
            .connections
            .iter()
            .find(|c| c.target_field() == connection.target_field())
        {
            return Err(Error::invalid_argument(format!(
                "field {} of stage {} is already fed by link {}",
                connection.target_field(),
                self.stage,
                existing.name()
            )));
        }

        debug!(stage = %self.stage, link = %connection.name(), "Registered input");
        self.connections.push(connection);
        Ok(())
    }

    /// Remove the connection for `link`, if present.
    pub fn unregister_if_exists(&mut self, link: &str) {
        if let Some(idx) = self.connections.iter().position(|c| c.name() == link) {
            self.connections.swap_remove(idx);
            debug!(stage = %self.stage, link = %link, "Unregistered input");
        }
    }

    /// Remove exactly `connection`, leaving any other flow of the same name.
    pub fn remove(&mut self, connection: &ConnectionRef) -> bool {
        match self.connections.iter().position(|c| Arc::ptr_eq(c, connection)) {
            Some(idx) => {
                self.connections.swap_remove(idx);
                debug!(stage = %self.stage, link = %connection.name(), "Removed input");
                true
            }
            None => false,
        }
    }

    /// Inferred fan-in type, if the current flows map onto one.
    pub fn input_type(&self) -> Option<InputType> {
        match self.connections.len() {
            1 => Some(InputType::Single),
            _ => None,
        }
    }

    /// Build the runtime input. Only defined for a single flow.
    pub fn to_input(&self) -> Option<Input> {
        match self.input_type()? {
            InputType::Single => Some(Input::Single(SingleInput {
                connection: self.connections[0].clone(),
            })),
            InputType::Merge | InputType::Collect => None,
        }
    }
}

/// Runtime input of a stage.
#[derive(Debug)]
pub enum Input {
    /// Pops from the one registered flow.
    Single(SingleInput),
    /// Generates fresh requests for a stage nothing feeds.
    Source(SourceInput),
}

impl Input {
    /// Source input producing empty instances of `message`.
    pub fn source(message: Message) -> Self {
        Input::Source(SourceInput::new(message))
    }

    /// Source input starting at most one request per `interval`.
    pub fn paced_source(message: Message, interval: Duration) -> Self {
        Input::Source(SourceInput::new(message).with_interval(interval))
    }

    /// Next request, waiting until one is available.
    ///
    /// `None` means the stream ended and the stage should finish.
    pub async fn next(&mut self) -> Option<State> {
        match self {
            Input::Single(single) => single.next().await,
            Input::Source(source) => {
                source.pace().await;
                Some(source.next())
            }
        }
    }

    /// Stop accepting states on the underlying flows.
    pub fn close(&self) {
        if let Input::Single(single) = self {
            single.connection.close();
        }
    }
}

/// Input backed by exactly one connection.
#[derive(Debug, Clone)]
pub struct SingleInput {
    connection: ConnectionRef,
}

impl SingleInput {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }

    pub async fn next(&self) -> Option<State> {
        self.connection.pop().await
    }
}

/// Input of a pipeline's first stage. Each request is an empty message with
/// a new correlation id, counting from 1.
///
/// Unpaced, a source issues the next request as soon as the stage has
/// answered the previous one. With an interval, requests start at most once
/// per tick.
#[derive(Debug)]
pub struct SourceInput {
    message: Message,
    next_id: StateId,
    interval: Option<Duration>,
    ticker: Option<Interval>,
}

impl SourceInput {
    pub fn new(message: Message) -> Self {
        Self {
            message,
            next_id: 1,
            interval: None,
            ticker: None,
        }
    }

    /// Start requests at most once per `interval`. A zero interval is unpaced.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = (!interval.is_zero()).then_some(interval);
        self
    }

    async fn pace(&mut self) {
        let Some(period) = self.interval else {
            // Never pending otherwise; let other tasks run between requests.
            tokio::task::yield_now().await;
            return;
        };
        let ticker = self.ticker.get_or_insert_with(|| {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        ticker.tick().await;
    }

    pub fn next(&mut self) -> State {
        let id = self.next_id;
        self.next_id += 1;
        State::new(id, self.message.new_instance())
    }
}
