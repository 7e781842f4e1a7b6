//! Creation confirmation: turn "the backend accepted the create request"
//! into "the resource is queryable and carries the machine's uid".
//!
//! Backends return a provisional resource long before caller-supplied tags
//! are visible to lookups. Returning early would make the next `get` miss
//! the resource and trigger a duplicate create.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Error, ProviderName};

/// Polling cadence and bounds for [`confirm_creation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationPolicy {
    /// Delay before each describe call.
    pub interval: Duration,
    /// Extra delay after a failed describe call.
    pub failure_backoff: Duration,
    /// Overall bound on the whole loop.
    pub timeout: Duration,
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            failure_backoff: Duration::from_secs(10),
            timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Why confirmation ended without a confirmed resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unconfirmed {
    TimedOut { waited: Duration },
    Cancelled,
}

impl Unconfirmed {
    pub fn into_error(self, provider: ProviderName, resource_id: impl Into<String>) -> Error {
        match self {
            Self::TimedOut { waited } => Error::ConfirmationTimeout {
                provider,
                resource_id: resource_id.into(),
                waited,
            },
            Self::Cancelled => Error::ConfirmationCancelled {
                provider,
                resource_id: resource_id.into(),
            },
        }
    }
}

/// Poll `describe` until `is_confirmed` accepts the result.
///
/// Each attempt waits `policy.interval` first. A failed describe is logged
/// and followed by an extra `policy.failure_backoff` before the next attempt.
/// The loop stops at `policy.timeout` or when `cancel` fires, whichever comes
/// first, and no describe call is issued after it returns.
pub async fn confirm_creation<T, E, F, Fut, P>(
    policy: &ConfirmationPolicy,
    cancel: &CancellationToken,
    mut describe: F,
    is_confirmed: P,
) -> Result<T, Unconfirmed>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&T) -> bool,
{
    let started = Instant::now();
    let deadline = started + policy.timeout;

    let attempts = async {
        let mut attempt = 0u32;
        loop {
            tokio::time::sleep(policy.interval).await;
            attempt += 1;

            match describe().await {
                Ok(resource) if is_confirmed(&resource) => {
                    debug!(attempt, "resource creation confirmed");
                    return resource;
                }
                Ok(_) => debug!(attempt, "waiting until resource is fully created"),
                Err(e) => {
                    warn!(attempt, error = %e, "resource was created but fetching its status failed");
                    tokio::time::sleep(policy.failure_backoff).await;
                }
            }
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Unconfirmed::Cancelled),
        res = tokio::time::timeout_at(deadline, attempts) => res.map_err(|_| Unconfirmed::TimedOut {
            waited: started.elapsed(),
        }),
    }
}
