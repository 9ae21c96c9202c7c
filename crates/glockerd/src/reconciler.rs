//! Reconciliation cycle
//!
//! Expires due exceptions, evaluates the policy against one snapshot of
//! config and exceptions, re-protects the installed binary, then drives
//! hosts, firewall and sudoers towards it. Each resource is applied on its own; one failing never stops the
//! others.

use crate::context::DaemonContext;
use crate::{firewall, hosts, sudoers, tamper};
use chrono::{DateTime, Utc};
use glocker_common::{evaluate, GlockerError, PolicyDecision, Resource};
use std::sync::Arc;
use tracing::{debug, error, info};

/// What one cycle did
#[derive(Debug)]
pub struct CycleReport {
    pub at: DateTime<Utc>,
    pub decision: PolicyDecision,
    pub sudo_applied: bool,
    /// Domains whose exception ran out this cycle
    pub restored: Vec<String>,
    pub failures: Vec<(Resource, GlockerError)>,
    /// False once uninstalled: nothing was evaluated or applied
    pub enforced: bool,
}

impl CycleReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub async fn run_cycle(ctx: &DaemonContext) -> CycleReport {
    let _cycle = ctx.cycle_lock.lock().await;

    let now = ctx.clock.now();
    if ctx.store.is_decommissioned() {
        debug!("Uninstalled, not enforcing");
        return CycleReport {
            at: now,
            decision: PolicyDecision::default(),
            sudo_applied: false,
            restored: Vec::new(),
            failures: Vec::new(),
            enforced: false,
        };
    }
    let restored: Vec<String> = ctx
        .store
        .expire_exceptions(now)
        .into_iter()
        .map(|e| {
            info!(domain = %e.domain, "Temporary unblock expired, blocking again");
            e.domain
        })
        .collect();

    let config = ctx.config();
    let exceptions = ctx.store.exceptions_snapshot();
    let decision = evaluate(&config, &ctx.clock.local(), &exceptions);
    let sudo_applied = ctx.store.effective_sudo(decision.sudo_allowed);
    debug!(
        blocked = decision.blocked.len(),
        sudo_allowed = decision.sudo_allowed,
        sudo_applied,
        "Policy evaluated"
    );

    let mut failures = Vec::new();

    if config.enable_self_healing {
        if let Err(e) = tamper::self_heal(ctx, &config).await {
            error!("Self-healing failed: {}", e);
            failures.push((Resource::Binary, e));
        }
    }

    if config.enable_hosts {
        if let Err(e) = hosts::reconcile(
            &config.hosts_path,
            &decision.blocked,
            ctx.system.immutable.as_ref(),
            &ctx.store,
        )
        .await
        {
            error!("Hosts update failed: {}", e);
            failures.push((Resource::Hosts, e));
        }
    }

    if config.enable_firewall {
        if let Err(e) = firewall::reconcile(
            &decision.blocked,
            ctx.system.resolver.as_ref(),
            ctx.system.firewall.as_ref(),
            &ctx.store,
        )
        .await
        {
            error!("Firewall update failed: {}", e);
            failures.push((Resource::Firewall, e));
        }
    }

    if config.sudoers.enabled {
        if let Err(e) = sudoers::reconcile(
            &config.sudoers,
            sudo_applied,
            ctx.system.validator.as_ref(),
            &ctx.store,
        )
        .await
        {
            error!("Sudoers update failed: {}", e);
            failures.push((Resource::Sudoers, e));
        }
    }

    ctx.store.record_cycle(now, decision.clone(), sudo_applied);
    CycleReport {
        at: now,
        decision,
        sudo_applied,
        restored,
        failures,
        enforced: true,
    }
}

/// Run a cycle every `enforce_interval_seconds` until shutdown
pub async fn run(ctx: Arc<DaemonContext>) {
    let mut shutdown = ctx.shutdown_signal();
    loop {
        let mut wait = ctx.config().enforce_interval();
        // Wake early for the next exception expiry
        if let Some(at) = ctx.store.with_exceptions(|set| set.next_expiry()) {
            wait = wait.min((at - ctx.clock.now()).to_std().unwrap_or_default());
        }
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => break,
        }
        let report = run_cycle(&ctx).await;
        if !report.enforced {
            break;
        }
        if !report.is_clean() {
            info!("Cycle finished with {} failed resource(s)", report.failures.len());
        }
    }
    debug!("Enforcement loop stopped");
}
