//! Paillier pre-parameter generation

use crate::paillier::PaillierSecretKey;
use crate::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Generate a Paillier key pair on the blocking pool.
///
/// Bounded by `timeout` independently of the session deadline. On timeout or
/// cancellation the prime search is told to stop and the caller gets an error
/// immediately.
pub async fn generate_preparams(
    bits: u64,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<PaillierSecretKey> {
    let abort = Arc::new(AtomicBool::new(false));
    let started = Instant::now();

    let task = {
        let abort = Arc::clone(&abort);
        tokio::task::spawn_blocking(move || PaillierSecretKey::generate(bits, &abort))
    };

    let outcome = tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled("pre-parameter generation".into())),
        joined = tokio::time::timeout(timeout, task) => match joined {
            Ok(result) => result?,
            Err(_) => {
                warn!(bits, ?timeout, "Pre-parameter generation timed out");
                Err(Error::Timeout("pre-parameter generation".into()))
            }
        },
    };

    if outcome.is_err() {
        abort.store(true, Ordering::Relaxed);
    } else {
        debug!(bits, elapsed_ms = started.elapsed().as_millis() as u64, "Pre-parameters ready");
    }
    outcome
}
