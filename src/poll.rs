//! Bounded polling for conditions that only hold eventually.

use crate::error::GroupError;
use std::{future::Future, time::Duration};

/// How often and for how long a condition is polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Pause between two checks.
    pub interval: Duration,
    /// Time after which polling gives up.
    pub timeout: Duration,
}

impl PollSettings {
    /// Creates poll settings.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Same interval, different timeout.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Runs `check` every `settings.interval` until it yields a value.
///
/// Errors of `check` are returned immediately. If no value was produced within
/// `settings.timeout`, the running check is cancelled and a
/// [`GroupError::ConvergenceTimeout`] naming `condition` is returned.
pub async fn poll_until<T, F, Fut>(
    settings: PollSettings,
    condition: &str,
    mut check: F,
) -> Result<T, GroupError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, GroupError>>,
{
    let polling = async {
        let mut attempt = 1u32;
        loop {
            if let Some(value) = check().await? {
                return Ok(value);
            }
            log::trace!("{} not reached after attempt {}", condition, attempt);
            attempt += 1;
            tokio::time::sleep(settings.interval).await;
        }
    };

    match tokio::time::timeout(settings.timeout, polling).await {
        Ok(result) => result,
        Err(_) => {
            log::warn!("Gave up waiting for {} after {:?}.", condition, settings.timeout);
            Err(GroupError::ConvergenceTimeout {
                condition: condition.to_owned(),
                waited: settings.timeout,
            })
        }
    }
}
