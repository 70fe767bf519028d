//! Backoff policies for reaching stage services.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::error::{Code, Error};

/// Backoff for connecting to a stage.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Jitter enabled
///
/// `attempts` counts every try including the first, so it allows
/// `attempts - 1` retries. 0 is treated as 1.
pub fn connection_backoff(attempts: u32) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(attempts.saturating_sub(1) as usize)
        .with_jitter()
}

/// Only an unreachable endpoint is worth another try. A malformed address
/// fails the same way every time.
pub fn is_retryable_connect(error: &Error) -> bool {
    error.code() == Code::Unavailable
}
