//! RPC discovery.
//!
//! Resolves the one RPC a stage binds to from a live connection and optional
//! `{service, rpc}` hints. Selection follows the same rule at both levels:
//! - a non-empty hint must match exactly one candidate (NotFound otherwise)
//! - an empty hint requires exactly one candidate (InvalidArgument otherwise)

use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result, ResultExt};
use crate::reflection::{ReflectionClient, Rpc, Service};

/// User-provided hints narrowing which RPC a stage binds to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Hints {
    /// Fully-qualified service name. Empty means "the only one".
    pub service: String,
    /// Method name. Empty means "the only one".
    pub rpc: String,
}

impl Hints {
    pub fn new(service: impl Into<String>, rpc: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            rpc: rpc.into(),
        }
    }
}

/// Pick one candidate by exact name, or the unique candidate when no name
/// is given.
fn select<'a, T>(
    kind: &str,
    hint: &str,
    candidates: &'a [T],
    name: impl Fn(&T) -> &str,
) -> Result<&'a T> {
    if !hint.is_empty() {
        return candidates
            .iter()
            .find(|c| name(c) == hint)
            .ok_or_else(|| Error::not_found(format!("{} '{}'", kind, hint)));
    }
    match candidates {
        [only] => Ok(only),
        _ => Err(Error::invalid_argument(format!(
            "{} not specified and ambiguous: {} found",
            kind,
            candidates.len()
        ))),
    }
}

/// Select a service name from the services a peer lists.
pub fn find_service<'a>(available: &'a [String], hint: &str) -> Result<&'a str> {
    select("service", hint, available, |s| s.as_str()).map(String::as_str)
}

/// Select an RPC within a resolved service.
///
/// Only unary methods can back a stage.
pub fn find_service_rpc(service: &Service, hint: &str) -> Result<Rpc> {
    let rpc = select("rpc", hint, service.rpcs(), |r| r.name())?;
    if !rpc.is_unary() {
        return Err(Error::invalid_argument(format!(
            "rpc {} is streaming, only unary rpcs are supported",
            rpc.full_name()
        )));
    }
    Ok(rpc.clone())
}

/// Resolve a concrete RPC on the peer behind `client`.
pub async fn find_rpc(client: &ReflectionClient, hints: &Hints) -> Result<Rpc> {
    async {
        let available = client.list_services().await?;
        let service_name = find_service(&available, &hints.service)?;
        debug!(service = %service_name, "Resolving service");

        let service = client.resolve_service(service_name).await?;
        find_service_rpc(&service, &hints.rpc)
    }
    .await
    .context("find rpc")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Code;
    use crate::test_utils::service;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_find_service_unique_without_hint() {
        let available = names(&["maestro.testing.EchoService"]);
        assert_eq!(
            find_service(&available, "").unwrap(),
            "maestro.testing.EchoService"
        );
    }

    #[test]
    fn test_find_service_ambiguous_without_hint() {
        let available = names(&["a.One", "a.Two"]);
        let err = find_service(&available, "").unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(err.to_string().contains("2 found"));
    }

    #[test]
    fn test_find_service_none_available() {
        let err = find_service(&[], "").unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(err.to_string().contains("0 found"));
    }

    #[test]
    fn test_find_service_hint_matches() {
        let available = names(&["a.One", "a.Two"]);
        assert_eq!(find_service(&available, "a.Two").unwrap(), "a.Two");
    }

    #[test]
    fn test_find_service_hint_missing() {
        let available = names(&["a.One"]);
        let err = find_service(&available, "a.Three").unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[test]
    fn test_find_service_hint_is_exact() {
        let available = names(&["a.One"]);
        let err = find_service(&available, "One").unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[test]
    fn test_find_rpc_unique_without_hint() {
        let rpc = find_service_rpc(&service("EchoService"), "").unwrap();
        assert_eq!(rpc.name(), "Echo");
    }

    #[test]
    fn test_find_rpc_ambiguous_without_hint() {
        let err = find_service_rpc(&service("EnvelopeService"), "").unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[test]
    fn test_find_rpc_with_hint() {
        let rpc = find_service_rpc(&service("EnvelopeService"), "Unwrap").unwrap();
        assert_eq!(rpc.full_name(), "maestro.testing.EnvelopeService.Unwrap");
    }

    #[test]
    fn test_find_rpc_hint_missing() {
        let err = find_service_rpc(&service("EnvelopeService"), "Open").unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[test]
    fn test_find_rpc_rejects_streaming() {
        let err = find_service_rpc(&service("WatchService"), "").unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(err.to_string().contains("streaming"));
    }
}
