//! Reflected gRPC schemas.
//!
//! Wraps the descriptors a peer publishes through server reflection into
//! immutable values:
//! - [`Message`]: a message schema; structural compatibility checks and
//!   construction of empty instances
//! - [`Rpc`]: one method with its input/output messages
//! - [`Service`]: a service and the RPCs it exposes
//!
//! The descriptors are resolved once at discovery time and never change
//! afterwards. [`ReflectionClient`] is the network side that fetches them.

mod client;

use std::collections::{BTreeSet, HashSet};

use prost_reflect::{
    DynamicMessage, FieldDescriptor, Kind, MessageDescriptor, MethodDescriptor, ServiceDescriptor,
};

use crate::error::{Error, Result};

pub use client::{ReflectionClient, REFLECTION_SERVICES};

/// Schema of a protobuf message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    desc: MessageDescriptor,
}

impl Message {
    pub fn new(desc: MessageDescriptor) -> Self {
        Self { desc }
    }

    /// Short name, e.g. `Counter`.
    pub fn name(&self) -> &str {
        self.desc.name()
    }

    /// Fully-qualified name, e.g. `maestro.testing.Counter`.
    pub fn full_name(&self) -> &str {
        self.desc.full_name()
    }

    pub fn descriptor(&self) -> &MessageDescriptor {
        &self.desc
    }

    /// Fresh instance with every field unset.
    pub fn new_instance(&self) -> DynamicMessage {
        DynamicMessage::new(self.desc.clone())
    }

    /// Look up a message-typed field by name.
    ///
    /// Link fields must name a nested message: the value that flows through
    /// the link is that sub-message.
    pub fn message_field(&self, name: &str) -> Result<FieldDescriptor> {
        let field = self.desc.get_field_by_name(name).ok_or_else(|| {
            Error::invalid_argument(format!(
                "field '{}' does not exist in message {}",
                name,
                self.full_name()
            ))
        })?;

        if field.is_list() || field.is_map() {
            return Err(Error::invalid_argument(format!(
                "field '{}' of message {} is not a singular message",
                name,
                self.full_name()
            )));
        }

        match field.kind() {
            Kind::Message(_) => Ok(field),
            _ => Err(Error::invalid_argument(format!(
                "field '{}' of message {} is not a message",
                name,
                self.full_name()
            ))),
        }
    }

    /// Narrow this schema to the schema of one of its message fields.
    pub fn get_message_field(&self, name: &str) -> Result<Message> {
        let field = self.message_field(name)?;
        match field.kind() {
            Kind::Message(desc) => Ok(Message::new(desc)),
            // message_field only returns message-kinded fields
            _ => Err(Error::internal(format!("field '{}' lost its message kind", name))),
        }
    }

    /// Structural compatibility with another schema.
    ///
    /// Two messages are compatible when they declare the same field numbers
    /// and every pair of fields sharing a number agrees on cardinality and
    /// type. Scalars must be equal, enums must declare the same value
    /// numbers and nested messages must themselves be compatible. Names are
    /// ignored: only what reaches the wire matters.
    pub fn compatible(&self, other: &Message) -> bool {
        let mut visiting = HashSet::new();
        messages_compatible(&self.desc, &other.desc, &mut visiting)
    }
}

impl From<MessageDescriptor> for Message {
    fn from(desc: MessageDescriptor) -> Self {
        Self::new(desc)
    }
}

fn messages_compatible(
    a: &MessageDescriptor,
    b: &MessageDescriptor,
    visiting: &mut HashSet<(String, String)>,
) -> bool {
    // A pair already under comparison is assumed compatible; any mismatch is
    // reported by the frame that is checking its fields.
    if !visiting.insert((a.full_name().to_string(), b.full_name().to_string())) {
        return true;
    }

    let a_numbers: BTreeSet<u32> = a.fields().map(|f| f.number()).collect();
    let b_numbers: BTreeSet<u32> = b.fields().map(|f| f.number()).collect();
    if a_numbers != b_numbers {
        return false;
    }

    a.fields().all(|fa| match b.get_field(fa.number()) {
        Some(fb) => fields_compatible(&fa, &fb, visiting),
        None => false,
    })
}

fn fields_compatible(
    a: &FieldDescriptor,
    b: &FieldDescriptor,
    visiting: &mut HashSet<(String, String)>,
) -> bool {
    if a.cardinality() != b.cardinality() || a.is_map() != b.is_map() {
        return false;
    }
    match (a.kind(), b.kind()) {
        (Kind::Message(ma), Kind::Message(mb)) => messages_compatible(&ma, &mb, visiting),
        (Kind::Enum(ea), Kind::Enum(eb)) => {
            let va: BTreeSet<i32> = ea.values().map(|v| v.number()).collect();
            let vb: BTreeSet<i32> = eb.values().map(|v| v.number()).collect();
            va == vb
        }
        (Kind::Message(_), _) | (_, Kind::Message(_)) => false,
        (Kind::Enum(_), _) | (_, Kind::Enum(_)) => false,
        (ka, kb) => ka == kb,
    }
}

/// A single remote method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rpc {
    desc: MethodDescriptor,
    input: Message,
    output: Message,
}

impl Rpc {
    pub fn new(desc: MethodDescriptor) -> Self {
        let input = Message::new(desc.input());
        let output = Message::new(desc.output());
        Self {
            desc,
            input,
            output,
        }
    }

    /// Method name, e.g. `Echo`.
    pub fn name(&self) -> &str {
        self.desc.name()
    }

    /// Fully-qualified method name, e.g. `maestro.testing.EchoService.Echo`.
    pub fn full_name(&self) -> &str {
        self.desc.full_name()
    }

    /// Fully-qualified name of the owning service.
    pub fn service_name(&self) -> &str {
        self.desc.parent_service().full_name()
    }

    pub fn input(&self) -> &Message {
        &self.input
    }

    pub fn output(&self) -> &Message {
        &self.output
    }

    pub fn is_unary(&self) -> bool {
        !self.desc.is_client_streaming() && !self.desc.is_server_streaming()
    }

    /// HTTP/2 path the method is served on: `/<service>/<method>`.
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service_name(), self.name())
    }
}

impl From<MethodDescriptor> for Rpc {
    fn from(desc: MethodDescriptor) -> Self {
        Self::new(desc)
    }
}

/// A remote service and its methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    desc: ServiceDescriptor,
    rpcs: Vec<Rpc>,
}

impl Service {
    pub fn new(desc: ServiceDescriptor) -> Self {
        let rpcs = desc.methods().map(Rpc::new).collect();
        Self { desc, rpcs }
    }

    /// Fully-qualified service name.
    pub fn name(&self) -> &str {
        self.desc.full_name()
    }

    pub fn rpcs(&self) -> &[Rpc] {
        &self.rpcs
    }
}

impl From<ServiceDescriptor> for Service {
    fn from(desc: ServiceDescriptor) -> Self {
        Self::new(desc)
    }
}
