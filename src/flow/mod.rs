//! Data flow between stages.
//!
//! This module contains:
//! - [`State`]: the correlated unit of data in flight
//! - [`Queue`]: bounded, lossy buffer between two stages
//! - [`Connection`]: a Link bound to its Queue
//! - [`InputConfig`] / [`OutputConfig`]: per-stage flow aggregates, and the
//!   runtime [`Input`] / [`Output`] built from them
//! - [`FlowRegistry`]: routing tables with all-or-nothing link registration

mod connection;
mod input;
mod output;
mod queue;
mod registry;
mod state;

pub use connection::{Connection, ConnectionRef};
pub use input::{Input, InputConfig, InputType, SingleInput, SourceInput};
pub use output::{Output, OutputConfig, OutputType, SingleOutput, SinkOutput};
pub use queue::Queue;
pub use registry::FlowRegistry;
pub use state::{State, StateId};
