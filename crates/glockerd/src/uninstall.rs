//! Uninstall restoration
//!
//! Undoes every system change the daemon made. Each step is attempted
//! regardless of earlier failures; problems are collected as warnings.

use crate::audit::{AuditLogger, LifecycleLogEntry};
use crate::context::DaemonContext;
use crate::{hosts, notifier, sudoers};
use tracing::{info, warn};

#[derive(Debug, Default)]
pub struct UninstallReport {
    pub firewall_rules_removed: usize,
    pub hosts_cleaned: bool,
    pub sudoers_restored: Option<sudoers::RestoreOutcome>,
    pub warnings: Vec<String>,
}

impl UninstallReport {
    pub fn summary(&self) -> String {
        if self.warnings.is_empty() {
            "System changes restored".to_string()
        } else {
            format!(
                "System changes restored with {} warning(s): {}",
                self.warnings.len(),
                self.warnings.join("; ")
            )
        }
    }
}

/// Restore the system. Holds the cycle lock throughout and leaves the
/// store decommissioned, so no later cycle re-applies anything.
pub async fn run(ctx: &DaemonContext, reason: &str) -> UninstallReport {
    let _cycle = ctx.cycle_lock.lock().await;
    ctx.store.decommission();

    let config = ctx.config();
    let mut report = UninstallReport::default();
    warn!("Uninstall requested (reason: {})", reason);

    // Our own writes from here on must not alarm
    ctx.store.with_baseline(|b| b.pause());

    if let Some(path) = &config.uninstall.log_file {
        let entry = LifecycleLogEntry {
            time: ctx.clock.now(),
            action: "uninstall".to_string(),
            reason: reason.to_string(),
        };
        if let Err(e) = AuditLogger::new(path).log(&entry).await {
            report.warnings.push(format!("uninstall log: {}", e));
        }
    }

    let _ = notifier::notify(
        &ctx.system,
        &config,
        notifier::alert("Glocker Uninstall", format!("Uninstall requested: {}", reason)),
    )
    .await;

    if config.enable_firewall {
        match ctx.system.firewall.clear_tagged().await {
            Ok(n) => {
                info!("Removed {} firewall rules", n);
                report.firewall_rules_removed = n;
            }
            Err(e) => report.warnings.push(format!("firewall: {}", e)),
        }
    }

    if config.enable_hosts {
        match hosts::remove_section(&config.hosts_path, ctx.system.immutable.as_ref()).await {
            Ok(changed) => report.hosts_cleaned = changed,
            Err(e) => report.warnings.push(format!("hosts: {}", e)),
        }
    }

    if config.sudoers.enabled {
        match sudoers::restore(&config.sudoers, ctx.system.validator.as_ref(), &ctx.store).await {
            Ok(outcome) => report.sudoers_restored = Some(outcome),
            Err(e) => report.warnings.push(format!("sudoers: {}", e)),
        }
    }

    let binary = config
        .enable_self_healing
        .then_some(&config.install_path);
    for path in config.tamper_detection.extra_paths.iter().chain(binary) {
        if let Err(e) = ctx.system.immutable.set_immutable(path, false).await {
            report
                .warnings
                .push(format!("{}: {}", path.display(), e));
        }
    }

    for warning in &report.warnings {
        warn!("Uninstall: {}", warning);
    }
    info!("{}", report.summary());
    report
}
