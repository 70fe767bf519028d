//! Producer side of a stage: where its replies go.

use std::sync::Arc;

use tracing::debug;

use super::{ConnectionRef, State};
use crate::error::{Error, Result};

/// How a stage distributes its replies.
///
/// Only `Single` has behavior. `Split` and `Duplicate` are reserved for
/// stages feeding several consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputType {
    /// Exactly one flow.
    Single,
    /// Each flow receives one field of the reply.
    Split,
    /// Each flow receives a copy of the reply.
    Duplicate,
}

/// Flows registered on the producer side of one stage.
#[derive(Debug, Clone)]
pub struct OutputConfig {
    stage: String,
    connections: Vec<ConnectionRef>,
}

impl OutputConfig {
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

    /// Add an outgoing connection. A link can be registered only once.
    pub fn register(&mut self, connection: ConnectionRef) -> Result<()> {
        if self.connections.iter().any(|c| c.name() == connection.name()) {
            return Err(Error::already_exists(format!(
                "link {} is already an output of stage {}",
                connection.name(),
                self.stage
            )));
        }
        debug!(stage = %self.stage, link = %connection.name(), "Registered output");
        self.connections.push(connection);
        Ok(())
    }

    /// Remove the connection for `link`, if present.
    pub fn unregister_if_exists(&mut self, link: &str) {
        if let Some(idx) = self.connections.iter().position(|c| c.name() == link) {
            self.connections.swap_remove(idx);
            debug!(stage = %self.stage, link = %link, "Unregistered output");
        }
    }

    /// Remove exactly `connection`, leaving any other flow of the same name.
    pub fn remove(&mut self, connection: &ConnectionRef) -> bool {
        match self.connections.iter().position(|c| Arc::ptr_eq(c, connection)) {
            Some(idx) => {
                self.connections.swap_remove(idx);
                debug!(stage = %self.stage, link = %connection.name(), "Removed output");
                true
            }
            None => false,
        }
    }

    /// Inferred fan-out type, if the current flows map onto one.
    pub fn output_type(&self) -> Option<OutputType> {
        match self.connections.len() {
            1 => Some(OutputType::Single),
            _ => None,
        }
    }

    /// Build the runtime output. Only defined for a single flow.
    pub fn to_output(&self) -> Option<Output> {
        match self.output_type()? {
            OutputType::Single => Some(Output::Single(SingleOutput {
                connection: self.connections[0].clone(),
            })),
            OutputType::Split | OutputType::Duplicate => None,
        }
    }
}

/// Runtime output of a stage.
#[derive(Debug)]
pub enum Output {
    /// Pushes into the one registered flow.
    Single(SingleOutput),
    /// Discards replies of a stage nothing consumes.
    Sink(SinkOutput),
}

impl Output {
    pub fn sink(stage: impl Into<String>) -> Self {
        Output::Sink(SinkOutput {
            stage: stage.into(),
        })
    }

    /// Hand a reply downstream. Never blocks; a full flow drops its oldest
    /// state.
    pub fn yield_state(&self, state: State) {
        match self {
            Output::Single(single) => single.yield_state(state),
            Output::Sink(sink) => sink.yield_state(state),
        }
    }

    /// Stop the underlying flows.
    pub fn close(&self) {
        if let Output::Single(single) = self {
            single.connection.close();
        }
    }
}

/// Output backed by exactly one connection.
#[derive(Debug, Clone)]
pub struct SingleOutput {
    connection: ConnectionRef,
}

impl SingleOutput {
    pub fn new(connection: ConnectionRef) -> Self {
        Self { connection }
    }

    pub fn yield_state(&self, state: State) {
        self.connection.push(state);
    }
}

/// Output of a pipeline's last stage.
#[derive(Debug, Clone)]
pub struct SinkOutput {
    stage: String,
}

impl SinkOutput {
    pub fn yield_state(&self, state: State) {
        debug!(stage = %self.stage, id = state.id(), "Pipeline produced final state");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::Code;
    use crate::flow::Connection;
    use crate::test_utils::{counter, link};

    fn conn(name: &str) -> ConnectionRef {
        Arc::new(Connection::new(link(name, "src", "", "dst", ""), 2).unwrap())
    }

    #[test]
    fn test_duplicate_link_rejected() {
        let mut output = OutputConfig::new("src");
        output.register(conn("l1")).unwrap();
        let err = output.register(conn("l1")).unwrap_err();
        assert_eq!(err.code(), Code::AlreadyExists);
        assert_eq!(output.len(), 1);
    }

    #[test]
    fn test_several_links_register_but_have_no_runtime_output() {
        let mut output = OutputConfig::new("src");
        output.register(conn("l1")).unwrap();
        output.register(conn("l2")).unwrap();
        assert_eq!(output.output_type(), None);
        assert!(output.to_output().is_none());
    }

    #[test]
    fn test_unregister_if_exists() {
        let mut output = OutputConfig::new("src");
        output.register(conn("l1")).unwrap();
        output.unregister_if_exists("missing");
        assert_eq!(output.len(), 1);
        output.unregister_if_exists("l1");
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn test_single_output_pushes_to_connection() {
        let connection = conn("l1");
        let mut output = OutputConfig::new("src");
        output.register(connection.clone()).unwrap();

        let out = output.to_output().unwrap();
        out.yield_state(State::new(9, counter(1, "y")));
        assert_eq!(connection.queue().len(), 1);
        assert_eq!(connection.pop().await.unwrap().id(), 9);
    }

    #[test]
    fn test_yield_never_blocks_on_full_flow() {
        let connection = conn("l1");
        let out = Output::Single(SingleOutput::new(connection.clone()));
        for id in 0..10 {
            out.yield_state(State::new(id, counter(id as i64, "y")));
        }
        assert_eq!(connection.queue().len(), 2);
    }
}
