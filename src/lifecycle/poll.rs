//! Bounded, cancellable wait for a condition

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::Error;

/// Poll `check` until it returns `Ok(true)`
///
/// The first check runs immediately, later ones every `interval`. The wait
/// fails with [`Error::Timeout`] once `timeout` has elapsed and with
/// [`Error::Cancelled`] as soon as `cancel` fires. An error from `check`
/// aborts the wait and is returned as is.
pub async fn poll_until<F, Fut>(
    cancel: &CancellationToken,
    timeout: Duration,
    interval: Duration,
    what: &str,
    mut check: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let deadline = Instant::now() + timeout;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(format!("waiting for {what}")));
        }

        if check().await? {
            return Ok(());
        }
        trace!(what, "condition not yet met");

        if Instant::now() >= deadline {
            return Err(Error::timeout(format!(
                "{what} did not happen within {}s",
                timeout.as_secs()
            )));
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::cancelled(format!("waiting for {what}")));
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
