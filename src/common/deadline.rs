//! Handshake deadlines
//!
//! A deadline is scoped to the future it wraps: when the future finishes,
//! fails or expires the stream carries no deadline any more.

use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Run `fut` with an optional deadline. A zero `timeout` disables it.
///
/// Expiry is reported as `Error::Io` labelled with `op` whose source has
/// kind `TimedOut`; errors from `fut` get `op` prefixed to their label.
pub async fn with_deadline<T, F>(timeout: Duration, op: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if timeout.is_zero() {
        return fut.await.map_err(|e| e.context(op));
    }

    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(|e| e.context(op)),
        Err(_) => Err(Error::timeout(op)),
    }
}

/// Absolute deadline for per-read bounding, `None` when disabled
pub fn deadline_from(timeout: Duration) -> Option<Instant> {
    if timeout.is_zero() {
        None
    } else {
        Some(Instant::now() + timeout)
    }
}

/// Bound a single step by an absolute deadline computed with [`deadline_from`]
pub async fn until<T, F>(deadline: Option<Instant>, op: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match deadline {
        None => fut.await,
        Some(at) => match tokio::time::timeout_at(at, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(op)),
        },
    }
}
