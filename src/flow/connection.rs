//! Runtime counterpart of a Link.

use std::sync::Arc;

use prost_reflect::{DynamicMessage, FieldDescriptor, Value};
use tracing::debug;

use super::{Queue, State};
use crate::domain::Link;
use crate::error::Result;
use crate::reflection::{Message, Rpc};

/// Narrows or widens payloads crossing a link with field restrictions.
#[derive(Debug, Clone)]
struct Projection {
    /// Field of the producer's reply that is sent, instead of the reply.
    source: Option<FieldDescriptor>,
    /// Field of the consumer's input the payload is placed into, with the
    /// consumer's input schema.
    target: Option<(Message, FieldDescriptor)>,
}

/// Binds a [`Link`] to the [`Queue`] carrying its messages.
///
/// Exclusively owned by the flow registry; the producer stage pushes through
/// [`Connection::push`] and the consumer stage pops through
/// [`Connection::pop`].
pub struct Connection {
    link: Link,
    queue: Queue,
    projection: Projection,
}

impl Connection {
    /// Connect whole messages, without field projection.
    pub fn new(link: Link, capacity: usize) -> Result<Self> {
        Ok(Self {
            link,
            queue: Queue::new(capacity)?,
            projection: Projection {
                source: None,
                target: None,
            },
        })
    }

    /// Connect two resolved RPCs, honoring the link's field restrictions.
    pub fn between(link: Link, source: &Rpc, target: &Rpc, capacity: usize) -> Result<Self> {
        let source_field = if link.source_field.is_empty() {
            None
        } else {
            Some(source.output().message_field(&link.source_field)?)
        };
        let target_field = if link.target_field.is_empty() {
            None
        } else {
            let input = target.input().clone();
            let field = input.message_field(&link.target_field)?;
            Some((input, field))
        };

        Ok(Self {
            link,
            queue: Queue::new(capacity)?,
            projection: Projection {
                source: source_field,
                target: target_field,
            },
        })
    }

    pub fn link(&self) -> &Link {
        &self.link
    }

    /// Name of the link this connection instantiates.
    pub fn name(&self) -> &str {
        &self.link.name
    }

    /// Target field, empty for whole-message connections.
    pub fn target_field(&self) -> &str {
        &self.link.target_field
    }

    pub fn is_whole_message(&self) -> bool {
        self.link.target_field.is_empty()
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Send a producer reply through the link. Never blocks.
    pub fn push(&self, state: State) {
        let state = match &self.projection.source {
            Some(field) => {
                let payload = extract(state.payload(), field);
                state.with_payload(payload)
            }
            None => state,
        };

        if let Some(evicted) = self.queue.push(state) {
            debug!(
                link = %self.link.name,
                id = evicted.id(),
                "Queue full, dropped oldest state"
            );
        }
    }

    /// Receive the next state for the consumer, waiting while empty.
    pub async fn pop(&self) -> Option<State> {
        let state = self.queue.pop().await?;
        Some(match &self.projection.target {
            Some((input, field)) => {
                let mut message = input.new_instance();
                message.set_field(field, Value::Message(state.payload().clone()));
                state.with_payload(message)
            }
            None => state,
        })
    }

    pub fn close(&self) {
        self.queue.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("link", &self.link.name)
            .field("queued", &self.queue.len())
            .field("capacity", &self.queue.capacity())
            .finish()
    }
}

/// The sub-message at `field`, or an empty one when unset.
fn extract(message: &DynamicMessage, field: &FieldDescriptor) -> DynamicMessage {
    match message.get_field(field).as_ref() {
        Value::Message(inner) => inner.clone(),
        _ => match field.kind() {
            prost_reflect::Kind::Message(desc) => DynamicMessage::new(desc),
            // message_field only admits message-kinded fields
            _ => message.clone(),
        },
    }
}

/// Shared handle used by both the input and the output side.
pub type ConnectionRef = Arc<Connection>;
