//! Pipeline definition records.
//!
//! Plain values describing what to run. Runtime counterparts live in
//! [`crate::flow`] and [`crate::execution`].

use std::fmt;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::reflection::Rpc;

/// Maximum length of a resource name.
pub const MAX_NAME_LEN: usize = 63;

/// Check a resource name: lowercase alphanumerics and `-`, starting and
/// ending with an alphanumeric, at most [`MAX_NAME_LEN`] characters.
pub fn validate_name(kind: &str, name: &str) -> Result<()> {
    let valid_char = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();

    if name.is_empty() {
        return Err(Error::invalid_argument(format!("{} name is empty", kind)));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::invalid_argument(format!(
            "{} name '{}' exceeds {} characters",
            kind, name, MAX_NAME_LEN
        )));
    }
    let starts_ok = name.chars().next().is_some_and(valid_char);
    let ends_ok = name.chars().last().is_some_and(valid_char);
    let body_ok = name.chars().all(|c| valid_char(c) || c == '-');
    if !(starts_ok && ends_ok && body_ok) {
        return Err(Error::invalid_argument(format!(
            "invalid {} name '{}'",
            kind, name
        )));
    }
    Ok(())
}

/// Lifecycle phase shared by stages and orchestrations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Phase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Running => "Running",
            Phase::Succeeded => "Succeeded",
            Phase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// A deployable image that stages may reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Asset {
    pub name: String,
    pub image: String,
}

/// A named pipeline: its stages and the links between them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Orchestration {
    pub name: String,
    pub phase: Phase,
    pub stages: Vec<String>,
    pub links: Vec<String>,
}

impl Orchestration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A pipeline node bound to one remote RPC.
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub name: String,
    pub phase: Phase,
    pub orchestration: String,
    pub rpc: Rpc,
    pub address: String,
    pub asset: Option<String>,
}

impl Stage {
    pub fn new(
        name: impl Into<String>,
        orchestration: impl Into<String>,
        rpc: Rpc,
        address: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            phase: Phase::Pending,
            orchestration: orchestration.into(),
            rpc,
            address: address.into(),
            asset: None,
        }
    }

    pub fn with_asset(mut self, asset: impl Into<String>) -> Self {
        self.asset = Some(asset.into());
        self
    }
}

/// Data dependency from one stage's output to another stage's input.
///
/// An empty field means the entire message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Link {
    pub name: String,
    pub orchestration: String,
    pub source_stage: String,
    pub source_field: String,
    pub target_stage: String,
    pub target_field: String,
}

impl Link {
    pub fn new(
        name: impl Into<String>,
        source_stage: impl Into<String>,
        target_stage: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source_stage: source_stage.into(),
            target_stage: target_stage.into(),
            ..Default::default()
        }
    }

    pub fn in_orchestration(mut self, orchestration: impl Into<String>) -> Self {
        self.orchestration = orchestration.into();
        self
    }

    pub fn with_source_field(mut self, field: impl Into<String>) -> Self {
        self.source_field = field.into();
        self
    }

    pub fn with_target_field(mut self, field: impl Into<String>) -> Self {
        self.target_field = field.into();
        self
    }
}
