//! Sequential bulk actions
//!
//! Runs an action over a list of items one at a time, pausing after each
//! success and retrying failures with exponential backoff before giving up
//! on the item and moving on. An [`Abort`] error ends the run instead.

use std::fmt::Display;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::BulkConfig;

/// Pacing and retry rules for a bulk run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkPolicy {
    pub cooldown: Duration,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl From<&BulkConfig> for BulkPolicy {
    fn from(config: &BulkConfig) -> Self {
        Self {
            cooldown: Duration::from_millis(config.cooldown_ms),
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl BulkPolicy {
    /// Delay before retry number `attempt` (1-based), doubled each time and capped
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(exp)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Returned by an action when no further item can succeed. The item and
/// every one after it are marked failed without further attempts.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct Abort(pub String);

/// Outcome of a bulk run, in item order
#[derive(Debug)]
pub struct BulkReport<T> {
    pub succeeded: Vec<T>,
    pub failed: Vec<(T, String)>,
    /// The run ended early on an [`Abort`]
    pub aborted: bool,
}

impl<T> Default for BulkReport<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
            aborted: false,
        }
    }
}

/// Spread retries of different items apart: 0.8x - 1.2x
fn jitter_multiplier(key: &str, attempt: u32) -> f64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    attempt.hash(&mut hasher);
    let bucket = (hasher.finish() % 401) as f64;
    0.8 + (bucket / 1000.0)
}

/// Run `action` over `items` strictly one after another
pub async fn run_sequential<T, F, Fut>(
    items: Vec<T>,
    policy: &BulkPolicy,
    mut action: F,
) -> BulkReport<T>
where
    T: Display,
    F: FnMut(&T) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut report = BulkReport::default();
    let total = items.len();
    let mut items = items.into_iter().enumerate();

    while let Some((index, item)) = items.next() {
        let key = item.to_string();
        let mut attempt = 1;

        loop {
            match action(&item).await {
                Ok(()) => {
                    info!("Bulk item {} done ({}/{})", key, index + 1, total);
                    report.succeeded.push(item);
                    if index + 1 < total && !policy.cooldown.is_zero() {
                        tokio::time::sleep(policy.cooldown).await;
                    }
                    break;
                }
                Err(e) if e.is::<Abort>() => {
                    let reason = format!("{:#}", e);
                    warn!(
                        "Bulk run aborted at item {} ({}/{}): {}",
                        key,
                        index + 1,
                        total,
                        reason
                    );
                    report.failed.push((item, reason.clone()));
                    report
                        .failed
                        .extend(items.map(|(_, rest)| (rest, reason.clone())));
                    report.aborted = true;
                    return report;
                }
                Err(e) if attempt < policy.max_attempts => {
                    let delay = policy
                        .backoff_for_attempt(attempt)
                        .mul_f64(jitter_multiplier(&key, attempt))
                        .min(policy.max_backoff);
                    warn!(
                        "Bulk item {} failed (attempt {}): {:#}, retrying in {:?}",
                        key, attempt, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(
                        "Giving up on bulk item {} after {} attempts: {:#}",
                        key, attempt, e
                    );
                    report.failed.push((item, format!("{:#}", e)));
                    break;
                }
            }
        }
    }

    report
}
