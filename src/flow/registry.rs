//! Per-stage routing tables and transactional link registration.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use super::{Connection, ConnectionRef, InputConfig, OutputConfig};
use crate::error::{Error, Result, ResultExt};

/// Input and output configs of every known stage.
#[derive(Debug, Default)]
pub struct FlowRegistry {
    inputs: HashMap<String, InputConfig>,
    outputs: HashMap<String, OutputConfig>,
}

impl FlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare empty configs for a stage. Existing configs are kept.
    pub fn add_stage(&mut self, stage: &str) {
        self.inputs
            .entry(stage.to_string())
            .or_insert_with(|| InputConfig::new(stage));
        self.outputs
            .entry(stage.to_string())
            .or_insert_with(|| OutputConfig::new(stage));
    }

    pub fn input(&self, stage: &str) -> Option<&InputConfig> {
        self.inputs.get(stage)
    }

    pub fn output(&self, stage: &str) -> Option<&OutputConfig> {
        self.outputs.get(stage)
    }

    /// Register a connection on both its source's output and its target's
    /// input, or on neither.
    ///
    /// If the input side rejects the connection, the output registration is
    /// rolled back before the error is returned.
    pub fn register(&mut self, connection: Connection) -> Result<ConnectionRef> {
        let connection = Arc::new(connection);
        let link = connection.link().clone();

        let output = self
            .outputs
            .get_mut(&link.source_stage)
            .ok_or_else(|| Error::not_found(format!("stage {}", link.source_stage)))?;
        output
            .register(connection.clone())
            .with_context(|| format!("output of stage {}", link.source_stage))?;

        let registered = match self.inputs.get_mut(&link.target_stage) {
            Some(input) => input
                .register(connection.clone())
                .with_context(|| format!("input of stage {}", link.target_stage)),
            None => Err(Error::not_found(format!("stage {}", link.target_stage))),
        };

        if let Err(e) = registered {
            if let Some(output) = self.outputs.get_mut(&link.source_stage) {
                output.remove(&connection);
            }
            return Err(e);
        }

        info!(
            link = %link.name,
            source = %link.source_stage,
            target = %link.target_stage,
            "Registered flow"
        );
        Ok(connection)
    }

    /// Undo a [`FlowRegistry::register`]. Only the given connection is
    /// removed, so a same-named flow registered by someone else survives.
    pub fn unregister_connection(&mut self, connection: &ConnectionRef) {
        let link = connection.link();
        if let Some(output) = self.outputs.get_mut(&link.source_stage) {
            output.remove(connection);
        }
        if let Some(input) = self.inputs.get_mut(&link.target_stage) {
            input.remove(connection);
        }
    }
}
