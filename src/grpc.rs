//! gRPC utilities.

use std::time::Duration;

use backon::Retryable;
use tonic::transport::{Channel, Endpoint};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::utils::retry::{connection_backoff, is_retryable_connect};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Turn a stage address into a URI. Bare `host:port` gets `http://`.
pub fn endpoint_uri(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

/// Connect to a gRPC endpoint.
pub async fn connect_channel(address: &str) -> Result<Channel> {
    Endpoint::from_shared(endpoint_uri(address))
        .map_err(|e| Error::invalid_argument(format!("invalid address {}: {}", address, e)))?
        .connect_timeout(CONNECT_TIMEOUT)
        .connect()
        .await
        .map_err(|e| Error::unavailable(format!("connect to {}: {}", address, e)))
}

/// Connect with up to `attempts` tries and jittered exponential backoff.
/// Only unreachable endpoints are retried.
pub async fn connect_with_retry(service_name: &str, address: &str, attempts: u32) -> Result<Channel> {
    let channel = (|| connect_channel(address))
        .retry(connection_backoff(attempts))
        .when(is_retryable_connect)
        .notify(|err: &Error, dur: Duration| {
            warn!(service = %service_name, address = %address, error = %err, delay = ?dur, "Connection failed, retrying");
        })
        .await?;
    info!(service = %service_name, address = %address, "Connected");
    Ok(channel)
}
