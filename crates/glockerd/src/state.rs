//! Shared runtime state
//!
//! One mutex per state group. Access goes through synchronous closures, so
//! a guard can never be held across an `.await`: callers read what they
//! need, drop the lock, do their I/O, then lock again to commit.

use crate::panic::PanicState;
use crate::tamper::{FileFingerprint, Snapshot, TamperBaseline};
use crate::violations::ViolationLog;
use chrono::{DateTime, Duration, Utc};
use glocker_common::{Config, ExceptionSet, GlockerError, PolicyDecision, Result, TemporaryException};
use std::sync::{Mutex, MutexGuard};
use tracing::info;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Forces the blocked sudoers line until the computed flag changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SudoLock {
    pub computed_at_lock: bool,
    pub locked_at: DateTime<Utc>,
}

/// Outcome of the most recent reconciliation cycle
#[derive(Debug, Clone, Default)]
pub struct RuntimeStatus {
    pub last_cycle: Option<DateTime<Utc>>,
    pub last_decision: Option<PolicyDecision>,
    /// Sudo state actually applied (after any lock)
    pub sudo_applied: Option<bool>,
    pub sudo_lock: Option<SudoLock>,
    /// Set by uninstall; no cycle enforces anything afterwards
    pub decommissioned: bool,
}

#[derive(Default)]
pub struct StateStore {
    exceptions: Mutex<ExceptionSet>,
    violations: Mutex<ViolationLog>,
    baseline: Mutex<TamperBaseline>,
    panic: Mutex<PanicState>,
    runtime: Mutex<RuntimeStatus>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exceptions<R>(&self, f: impl FnOnce(&mut ExceptionSet) -> R) -> R {
        f(&mut lock(&self.exceptions))
    }

    pub fn with_violations<R>(&self, f: impl FnOnce(&mut ViolationLog) -> R) -> R {
        f(&mut lock(&self.violations))
    }

    pub fn with_baseline<R>(&self, f: impl FnOnce(&mut TamperBaseline) -> R) -> R {
        f(&mut lock(&self.baseline))
    }

    pub fn with_panic<R>(&self, f: impl FnOnce(&mut PanicState) -> R) -> R {
        f(&mut lock(&self.panic))
    }

    pub fn with_runtime<R>(&self, f: impl FnOnce(&mut RuntimeStatus) -> R) -> R {
        f(&mut lock(&self.runtime))
    }

    /// Create (or replace) a temporary exception. Absolute domains are refused.
    pub fn grant_exception(
        &self,
        config: &Config,
        domain: &str,
        reason: &str,
        now: DateTime<Utc>,
        duration: Duration,
    ) -> Result<TemporaryException> {
        if config.is_absolute(domain) {
            return Err(GlockerError::AbsoluteDomain(domain.to_string()));
        }
        if reason.trim().is_empty() {
            return Err(GlockerError::Protocol("Reason cannot be empty".to_string()));
        }
        let exception = TemporaryException {
            domain: domain.to_string(),
            reason: reason.trim().to_string(),
            granted_at: now,
            expires_at: now + duration,
        };
        self.with_exceptions(|set| set.insert(exception.clone()));
        Ok(exception)
    }

    pub fn cancel_exception(&self, domain: &str) -> Option<TemporaryException> {
        self.with_exceptions(|set| set.cancel(domain))
    }

    pub fn expire_exceptions(&self, now: DateTime<Utc>) -> Vec<TemporaryException> {
        self.with_exceptions(|set| set.expire(now))
    }

    pub fn exceptions_snapshot(&self) -> ExceptionSet {
        self.with_exceptions(|set| set.clone())
    }

    /// Mark the start of a legitimate write to a monitored resource
    pub fn begin_write(&self) {
        self.with_baseline(|b| b.begin_write());
    }

    /// Commit a file's new fingerprint, whether or not the write succeeded
    pub fn finish_write(&self, fingerprint: FileFingerprint) {
        self.with_baseline(|b| b.finish_write(fingerprint));
    }

    pub fn finish_firewall(&self, rules: usize) {
        self.with_baseline(|b| b.finish_firewall(rules));
    }

    pub fn replace_baseline(&self, snapshot: Snapshot) {
        self.with_baseline(|b| b.replace(snapshot));
    }

    /// Engage the sudo lock. `computed` is the policy's current sudo flag.
    pub fn lock_sudo(&self, computed: bool, now: DateTime<Utc>) {
        self.with_runtime(|rt| {
            rt.sudo_lock = Some(SudoLock {
                computed_at_lock: computed,
                locked_at: now,
            })
        });
    }

    /// Sudo flag to apply given the policy's flag; releases the lock once
    /// the policy flips
    pub fn effective_sudo(&self, computed: bool) -> bool {
        self.with_runtime(|rt| match rt.sudo_lock {
            Some(lock) if lock.computed_at_lock == computed => false,
            Some(_) => {
                rt.sudo_lock = None;
                info!("Sudo lock released, policy now says allowed={}", computed);
                computed
            }
            None => computed,
        })
    }

    pub fn record_cycle(&self, now: DateTime<Utc>, decision: PolicyDecision, sudo_applied: bool) {
        self.with_runtime(|rt| {
            rt.last_cycle = Some(now);
            rt.last_decision = Some(decision);
            rt.sudo_applied = Some(sudo_applied);
        });
    }

    pub fn decommission(&self) {
        self.with_runtime(|rt| rt.decommissioned = true);
    }

    pub fn is_decommissioned(&self) -> bool {
        self.with_runtime(|rt| rt.decommissioned)
    }

    pub fn runtime(&self) -> RuntimeStatus {
        self.with_runtime(|rt| rt.clone())
    }

    pub fn panic_state(&self) -> PanicState {
        self.with_panic(|p| *p)
    }
}
