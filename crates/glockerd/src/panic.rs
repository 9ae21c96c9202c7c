//! Panic mode
//!
//! Suspends the machine until a deadline. Waking up early puts it straight
//! back to sleep; the deadline is the only way out.

use crate::context::DaemonContext;
use crate::notifier;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// How often the controller re-reads the clock while suspended
const PANIC_POLL: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PanicState {
    #[default]
    Idle,
    Suspended {
        deadline: DateTime<Utc>,
        /// Early wakes answered with another suspend
        wake_count: u32,
    },
}

impl PanicState {
    pub fn is_active(&self) -> bool {
        matches!(self, PanicState::Suspended { .. })
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        match self {
            PanicState::Suspended { deadline, .. } => Some(*deadline),
            PanicState::Idle => None,
        }
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.deadline().map(|d| (d - now).max(Duration::zero()))
    }
}

/// Enter panic mode for `minutes`. Re-entering never shortens the
/// deadline. Returns the deadline in force.
pub async fn enter(ctx: &Arc<DaemonContext>, minutes: u64) -> DateTime<Utc> {
    let now = ctx.clock.now();
    let requested = i64::try_from(minutes)
        .ok()
        .and_then(Duration::try_minutes)
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);

    let (deadline, start) = ctx.store.with_panic(|state| match *state {
        PanicState::Idle => {
            *state = PanicState::Suspended {
                deadline: requested,
                wake_count: 0,
            };
            (requested, true)
        }
        PanicState::Suspended { deadline, wake_count } => {
            let later = deadline.max(requested);
            *state = PanicState::Suspended {
                deadline: later,
                wake_count,
            };
            (later, false)
        }
    });

    warn!("Panic mode until {}", deadline.to_rfc3339());
    // Suspend first; the notifier may take its whole timeout
    if start {
        tokio::spawn(controller(Arc::clone(ctx)));
    } else {
        info!("Already in panic mode, deadline is now {}", deadline.to_rfc3339());
    }

    let config = ctx.config();
    let _ = notifier::notify(
        &ctx.system,
        &config,
        notifier::alert(
            "Glocker Panic Mode",
            format!("Suspending system for {} minutes", minutes),
        ),
    )
    .await;
    deadline
}

async fn suspend(ctx: &DaemonContext) {
    let command = ctx.config().panic_command.clone();
    if let Err(e) = ctx.system.suspender.suspend(&command).await {
        error!("Suspend failed: {}", e);
    }
}

async fn controller(ctx: Arc<DaemonContext>) {
    suspend(&ctx).await;
    loop {
        let Some(deadline) = ctx.store.panic_state().deadline() else {
            break;
        };
        let now = ctx.clock.now();
        if now >= deadline {
            ctx.store.with_panic(|state| *state = PanicState::Idle);
            info!("Panic mode ended");
            let config = ctx.config();
            let _ = notifier::notify(
                &ctx.system,
                &config,
                notifier::info("Glocker", "Panic mode ended"),
            )
            .await;
            break;
        }

        let remaining = (deadline - now).to_std().unwrap_or_default();
        if !ctx.system.wake.wait_for_wake(remaining.min(PANIC_POLL)).await {
            continue;
        }

        // Read the deadline again: it may have been extended meanwhile
        let still_due = ctx
            .store
            .panic_state()
            .deadline()
            .is_some_and(|d| ctx.clock.now() < d);
        if still_due {
            let wakes = ctx.store.with_panic(|state| match state {
                PanicState::Suspended { wake_count, .. } => {
                    *wake_count += 1;
                    *wake_count
                }
                PanicState::Idle => 0,
            });
            warn!("Woke before panic deadline (wake #{}), suspending again", wakes);
            suspend(&ctx).await;
        } else {
            debug!("Wake at or after panic deadline");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_remaining_never_negative() {
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap();
        let state = PanicState::Suspended {
            deadline: now,
            wake_count: 0,
        };
        assert_eq!(state.remaining(now + Duration::minutes(5)), Some(Duration::zero()));
        assert_eq!(PanicState::Idle.remaining(now), None);
        assert!(state.is_active());
    }
}
