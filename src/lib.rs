//! Maestro - pipelines over independently deployed gRPC services.
//!
//! Stages are bound to remote unary RPCs discovered through server
//! reflection. Links connect one stage's reply to another stage's request,
//! optionally through a message-typed field, and are checked for schema
//! compatibility when they are created. An execution runs one worker per
//! stage and publishes what happens as a replayable event stream.

pub mod config;
pub mod discovery;
pub mod domain;
pub mod error;
pub mod execution;
pub mod flow;
pub mod grpc;
pub mod manager;
pub mod pubsub;
pub mod reflection;
pub mod storage;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use error::{Error, Result};
pub use manager::{Manager, StageSpec};
