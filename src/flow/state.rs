//! In-flight pipeline data.

use prost_reflect::DynamicMessage;

/// Correlation identifier assigned at the pipeline's source.
pub type StateId = u64;

/// A message travelling between stages.
///
/// The id is assigned once, where the message enters the pipeline, and is
/// carried unchanged through every stage so that branches produced from the
/// same origin can be correlated. The payload is replaced at each hop.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    id: StateId,
    payload: DynamicMessage,
}

impl State {
    pub fn new(id: StateId, payload: DynamicMessage) -> Self {
        Self { id, payload }
    }

    pub fn id(&self) -> StateId {
        self.id
    }

    pub fn payload(&self) -> &DynamicMessage {
        &self.payload
    }

    pub fn into_payload(self) -> DynamicMessage {
        self.payload
    }

    /// Same correlation id, new payload.
    pub fn with_payload(&self, payload: DynamicMessage) -> Self {
        Self {
            id: self.id,
            payload,
        }
    }
}
