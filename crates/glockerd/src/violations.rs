//! Violation tracking
//!
//! Access attempts observed by an outside collaborator arrive over a
//! channel. The trailing-window count fires the configured action once when
//! it reaches the threshold, then stays quiet until the count falls back
//! below it.

use crate::context::DaemonContext;
use crate::notifier;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const TICK: std::time::Duration = std::time::Duration::from_secs(60);

/// One observed access attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViolationEvent {
    /// e.g. "domain", "url", "content"
    pub kind: String,
    pub subject: String,
    pub timestamp: DateTime<Utc>,
}

impl ViolationEvent {
    pub fn new(kind: impl Into<String>, subject: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind: kind.into(),
            subject: subject.into(),
            timestamp,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ViolationLog {
    recent: VecDeque<ViolationEvent>,
    total: u64,
    armed: bool,
    last_reset: Option<NaiveDate>,
}

impl Default for ViolationLog {
    fn default() -> Self {
        Self {
            recent: VecDeque::new(),
            total: 0,
            armed: true,
            last_reset: None,
        }
    }
}

impl ViolationLog {
    fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        let cutoff = now - window;
        while self.recent.front().is_some_and(|e| e.timestamp <= cutoff) {
            self.recent.pop_front();
        }
    }

    fn rearm(&mut self, threshold: usize) {
        if self.recent.len() < threshold {
            self.armed = true;
        }
    }

    /// Append `event`. Returns the window count if this append crossed the
    /// threshold.
    pub fn record(&mut self, event: ViolationEvent, window: Duration, threshold: usize) -> Option<usize> {
        let now = event.timestamp;
        self.total += 1;
        let at = self
            .recent
            .iter()
            .rposition(|e| e.timestamp <= now)
            .map_or(0, |i| i + 1);
        self.recent.insert(at, event);
        self.prune(now, window);
        self.rearm(threshold);

        let count = self.recent.len();
        if self.armed && count >= threshold {
            self.armed = false;
            return Some(count);
        }
        None
    }

    /// Age out old events without recording a new one
    pub fn refresh(&mut self, now: DateTime<Utc>, window: Duration, threshold: usize) {
        self.prune(now, window);
        self.rearm(threshold);
    }

    pub fn recent_count(&self) -> usize {
        self.recent.len()
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Clear the window once per local day. Returns true if it cleared.
    pub fn reset_if_new_day(&mut self, today: NaiveDate) -> bool {
        match self.last_reset {
            Some(day) if day >= today => false,
            Some(_) => {
                self.recent.clear();
                self.armed = true;
                self.last_reset = Some(today);
                true
            }
            None => {
                // First tick just records the day
                self.last_reset = Some(today);
                false
            }
        }
    }
}

/// Record an event and run the action if it crossed the threshold.
/// Returns true if the action fired.
pub async fn report(ctx: &DaemonContext, event: ViolationEvent) -> bool {
    let config = ctx.config();
    let tracking = &config.violation_tracking;
    if !tracking.enabled {
        return false;
    }
    debug!(kind = %event.kind, subject = %event.subject, "Violation recorded");

    let window = config.violation_window();
    let threshold = tracking.max_violations;
    let Some(count) = ctx
        .store
        .with_violations(|log| log.record(event, window, threshold))
    else {
        return false;
    };

    warn!(
        "Violation threshold exceeded: {}/{} in {} minutes",
        count, threshold, tracking.time_window_minutes
    );
    let _ = notifier::notify(
        &ctx.system,
        &config,
        notifier::alert(
            "Glocker Alert",
            format!("Violation threshold exceeded: {}/{}", count, threshold),
        ),
    )
    .await;

    let command = tracking.command.trim();
    if !command.is_empty() {
        let env = vec![
            ("GLOCKER_VIOLATION_COUNT".to_string(), count.to_string()),
            ("GLOCKER_VIOLATION_THRESHOLD".to_string(), threshold.to_string()),
        ];
        if let Err(e) = ctx.system.launcher.launch(command, &env).await {
            error!("Violation command failed: {}", e);
        }
    }
    true
}

/// Daily reset plus window refresh, run once a minute
pub fn tick(ctx: &DaemonContext) {
    let config = ctx.config();
    let tracking = &config.violation_tracking;
    let today = ctx.clock.local().date_naive();
    let now = ctx.clock.now();
    ctx.store.with_violations(|log| {
        if tracking.reset_daily && log.reset_if_new_day(today) {
            info!("Violation log reset for {}", today);
        }
        log.refresh(now, config.violation_window(), tracking.max_violations);
    });
}

/// Evaluate incoming events until shutdown or the channel closes
pub async fn run(ctx: Arc<DaemonContext>, mut events: mpsc::Receiver<ViolationEvent>) {
    let mut shutdown = ctx.shutdown_signal();
    let mut ticker = tokio::time::interval(TICK);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    report(&ctx, event).await;
                }
                None => break,
            },
            _ = ticker.tick() => tick(&ctx),
            _ = shutdown.changed() => break,
        }
    }
    debug!("Violation tracker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn event(minute: i64) -> ViolationEvent {
        ViolationEvent::new("domain", "reddit.com", at(minute))
    }

    #[test]
    fn test_fires_once_at_threshold() {
        let mut log = ViolationLog::default();
        let window = Duration::minutes(60);
        let fired: Vec<_> = (0..8).map(|m| log.record(event(m), window, 5)).collect();
        assert_eq!(fired.iter().filter(|f| f.is_some()).count(), 1);
        assert_eq!(fired[4], Some(5));
        assert_eq!(log.total(), 8);
    }

    #[test]
    fn test_four_never_fire() {
        let mut log = ViolationLog::default();
        for m in 0..4 {
            assert_eq!(log.record(event(m), Duration::minutes(60), 5), None);
        }
    }

    #[test]
    fn test_events_age_out_and_rearm() {
        let mut log = ViolationLog::default();
        let window = Duration::minutes(60);
        for m in 0..5 {
            log.record(event(m), window, 5);
        }
        assert!(!log.is_armed());

        log.refresh(at(62), window, 5);
        assert_eq!(log.recent_count(), 2);
        assert!(log.is_armed());

        // Crossing again after re-arming fires again
        assert_eq!(log.record(event(62), window, 5), None);
        assert_eq!(log.record(event(62), window, 5), None);
        assert_eq!(log.record(event(62), window, 5), Some(5));
    }

    #[test]
    fn test_event_at_cutoff_is_outside() {
        let mut log = ViolationLog::default();
        log.record(event(0), Duration::minutes(60), 5);
        log.refresh(at(60), Duration::minutes(60), 5);
        assert_eq!(log.recent_count(), 0);
    }

    #[test]
    fn test_daily_reset() {
        let mut log = ViolationLog::default();
        let day = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap();
        for m in 0..5 {
            log.record(event(m), Duration::minutes(60), 5);
        }
        assert!(!log.reset_if_new_day(day));
        assert!(!log.reset_if_new_day(day));
        assert!(log.reset_if_new_day(day.succ_opt().unwrap()));
        assert_eq!(log.recent_count(), 0);
        assert!(log.is_armed());
        assert_eq!(log.total(), 5);
    }
}
