//! The poll loop.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{Condition, ConvergeError, QueryError, SnapshotSource, Summarize, WaitOptions};

/// State of a single wait (not of the resource being watched).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    /// Still querying.
    Polling,

    /// The condition held on an observed snapshot.
    Satisfied,

    /// An observed snapshot ruled the condition out.
    Failed,

    /// Deadline or attempt ceiling reached.
    TimedOut,
}

impl PollState {
    /// Returns true once the wait has ended.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Polling)
    }
}

/// Stand-in for "no deadline" when a duration does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `base + delay`, saturating at a far-future instant instead of overflowing.
fn instant_after(base: Instant, delay: Duration) -> Instant {
    base.checked_add(delay)
        .or_else(|| base.checked_add(FAR_FUTURE))
        .unwrap_or(base)
}

/// Successful end of a wait.
#[derive(Debug, Clone)]
pub struct Converged<S> {
    /// The snapshot that satisfied the condition, or `None` if the resource
    /// disappeared and the condition accepts that.
    pub snapshot: Option<S>,

    /// Number of queries issued.
    pub attempts: u32,

    /// Time spent waiting.
    pub elapsed: Duration,
}

impl<S> Converged<S> {
    /// Returns true if the wait ended because the resource is gone.
    pub fn is_gone(&self) -> bool {
        self.snapshot.is_none()
    }
}

/// Poll `source` for `key` until `condition` holds.
///
/// Transient query failures are logged and polled through. Non-transient
/// failures end the wait with [`ConvergeError::Query`] unless the resource is
/// reported missing and the condition accepts that.
pub async fn wait_for<Src>(
    source: &Src,
    key: &Src::Key,
    condition: &Condition<Src::Snapshot>,
    options: &WaitOptions,
) -> Result<Converged<Src::Snapshot>, ConvergeError<Src::Error>>
where
    Src: SnapshotSource + ?Sized,
{
    let started = Instant::now();
    let deadline = instant_after(started, options.timeout);
    let mut state = PollState::Polling;
    let mut attempts: u32 = 0;
    let mut last_observed: Option<String> = None;
    let mut last_error: Option<String> = None;

    debug!(
        resource = %key,
        condition = %condition,
        timeout_ms = options.timeout.as_millis() as u64,
        interval_ms = options.interval.as_millis() as u64,
        "Waiting for condition"
    );

    if !options.initial_delay.is_zero() {
        tokio::time::sleep_until(instant_after(started, options.initial_delay).min(deadline)).await;
    }

    while !state.is_terminal() {
        attempts += 1;

        // A query that hangs past the deadline counts as a timeout.
        let Ok(result) = tokio::time::timeout_at(deadline, source.snapshot(key)).await else {
            state = PollState::TimedOut;
            last_error = Some("query did not complete before the deadline".to_string());
            break;
        };

        match result {
            Ok(snapshot) => {
                if condition.is_satisfied(&snapshot) {
                    state = PollState::Satisfied;
                    let elapsed = started.elapsed();
                    info!(
                        resource = %key,
                        condition = %condition,
                        state = ?state,
                        attempts,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Condition satisfied"
                    );
                    return Ok(Converged {
                        snapshot: Some(snapshot),
                        attempts,
                        elapsed,
                    });
                }

                if let Some(reason) = condition.unrecoverable(&snapshot) {
                    state = PollState::Failed;
                    warn!(
                        resource = %key,
                        condition = %condition,
                        state = ?state,
                        reason = %reason,
                        "Condition can no longer be satisfied"
                    );
                    return Err(ConvergeError::Unrecoverable {
                        target: key.to_string(),
                        condition: condition.description().to_string(),
                        reason,
                        snapshot: snapshot.summary(),
                    });
                }

                let summary = snapshot.summary();
                debug!(attempt = attempts, observed = %summary, "Condition not yet satisfied");
                last_observed = Some(summary);
                last_error = None;
            }
            Err(e) if e.is_not_found() && condition.accepts_gone() => {
                state = PollState::Satisfied;
                info!(
                    resource = %key,
                    condition = %condition,
                    state = ?state,
                    attempts,
                    "Resource is gone"
                );
                return Ok(Converged {
                    snapshot: None,
                    attempts,
                    elapsed: started.elapsed(),
                });
            }
            Err(e) if e.is_transient() => {
                warn!(attempt = attempts, error = %e, "Poll query failed, will retry");
                last_error = Some(e.to_string());
            }
            Err(e) => {
                state = PollState::Failed;
                debug!(resource = %key, state = ?state, error = %e, "Poll query failed hard");
                return Err(ConvergeError::Query(e));
            }
        }

        if options.max_attempts.is_some_and(|max| attempts >= max) {
            state = PollState::TimedOut;
            continue;
        }

        let now = Instant::now();
        if now >= deadline {
            state = PollState::TimedOut;
            continue;
        }

        tokio::time::sleep_until(instant_after(now, options.next_delay()).min(deadline)).await;
    }

    let elapsed = started.elapsed();
    warn!(
        resource = %key,
        condition = %condition,
        state = ?state,
        attempts,
        elapsed_ms = elapsed.as_millis() as u64,
        last_observed = last_observed.as_deref().unwrap_or("-"),
        "Timed out waiting for condition"
    );

    Err(ConvergeError::Timeout {
        target: key.to_string(),
        condition: condition.description().to_string(),
        attempts,
        elapsed,
        last_observed,
        last_error,
    })
}
