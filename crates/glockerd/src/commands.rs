//! Command handlers
//!
//! `precheck` runs before the acknowledgment is sent, so requests that can
//! never succeed get an `ERROR:` line instead of an `OK:`. `execute` does
//! the work and is spawned off the connection task.

use crate::audit::{AuditLogger, UnblockLogEntry};
use crate::context::DaemonContext;
use crate::panic::PanicState;
use crate::{notifier, panic, reconciler, tamper, uninstall};
use glocker_common::{evaluate, Command, GlockerError, Result};
use std::sync::Arc;
use tracing::{info, warn};

/// Reject what can be rejected without touching anything
pub fn precheck(ctx: &DaemonContext, command: &Command) -> Result<()> {
    let config = ctx.config();
    if let Command::Unblock { domains, reason } = command {
        if !config.is_valid_reason(reason) {
            warn!("Unblock rejected: invalid reason '{}'", reason);
            return Err(GlockerError::InvalidReason {
                reason: reason.clone(),
                valid: config.unblocking.reasons.join(", "),
            });
        }
        if domains.iter().all(|d| config.is_absolute(d)) {
            warn!("Unblock rejected: all requested domains are absolute");
            return Err(GlockerError::AbsoluteDomain(domains.join(", ")));
        }
    }
    Ok(())
}

/// Carry out a command. Returns a one-line summary for the log.
pub async fn execute(ctx: &Arc<DaemonContext>, command: Command) -> Result<String> {
    match command {
        Command::Status => Ok(status_lines(ctx).join("\n")),
        Command::Reload => reload(ctx).await,
        Command::Unblock { domains, reason } => unblock(ctx, &domains, &reason).await,
        Command::Block { domains } => block(ctx, &domains).await,
        Command::Panic { minutes } => {
            let deadline = panic::enter(ctx, minutes).await;
            Ok(format!("Panic mode until {}", deadline.to_rfc3339()))
        }
        Command::Lock => lock(ctx).await,
        Command::AddKeyword { keywords } => {
            let added = ctx.update_config(|c| c.add_keywords(&keywords)).await?;
            info!("Added {} keywords", added);
            Ok(format!("Added {} keywords", added))
        }
        Command::Uninstall { reason } => {
            let report = uninstall::run(ctx, &reason).await;
            Ok(report.summary())
        }
    }
}

async fn reload(ctx: &DaemonContext) -> Result<String> {
    let config = match ctx.config_source.load().and_then(|c| c.validate().map(|_| c)) {
        Ok(c) => c,
        Err(e) => {
            warn!("Reload failed, keeping current config: {}", e);
            return Err(e);
        }
    };
    let domains = config.domains.len();
    ctx.replace_config(config).await;
    reconciler::run_cycle(ctx).await;
    if let Err(e) = tamper::rebaseline(ctx).await {
        warn!("Could not rebaseline after reload: {}", e);
    }
    info!("Configuration reloaded ({} domains)", domains);
    Ok(format!("Configuration reloaded ({} domains)", domains))
}

async fn unblock(ctx: &DaemonContext, domains: &[String], reason: &str) -> Result<String> {
    let config = ctx.config();
    let now = ctx.clock.now();
    let duration = config.unblock_duration();

    let mut granted = Vec::new();
    let mut rejected = Vec::new();
    for domain in domains {
        match ctx.store.grant_exception(&config, domain, reason, now, duration) {
            Ok(exception) => granted.push(exception),
            Err(GlockerError::AbsoluteDomain(name)) => rejected.push(name),
            Err(e) => return Err(e),
        }
    }
    if !rejected.is_empty() {
        warn!("Cannot unblock absolute domains: {}", rejected.join(", "));
    }
    if granted.is_empty() {
        return Err(GlockerError::AbsoluteDomain(rejected.join(", ")));
    }

    let minutes = duration.num_minutes();
    let names: Vec<&str> = granted.iter().map(|e| e.domain.as_str()).collect();
    warn!(
        "Temporarily unblocking {} domains for {} minutes: {} (reason: {})",
        granted.len(),
        minutes,
        names.join(", "),
        reason
    );

    if let Some(path) = &config.unblocking.log_file {
        let logger = AuditLogger::new(path);
        for exception in &granted {
            let entry = UnblockLogEntry {
                unblock_time: exception.granted_at,
                restore_time: exception.expires_at,
                reason: exception.reason.clone(),
                domain: exception.domain.clone(),
            };
            if let Err(e) = logger.log(&entry).await {
                warn!("Could not write unblock log {}: {}", path.display(), e);
            }
        }
    }

    reconciler::run_cycle(ctx).await;

    let message = format!(
        "Temporarily unblocked {} domains for {} minutes",
        granted.len(),
        minutes
    );
    let _ = notifier::notify(
        &ctx.system,
        &config,
        notifier::info("Glocker Unblock", message.clone()),
    )
    .await;
    Ok(message)
}

async fn block(ctx: &DaemonContext, domains: &[String]) -> Result<String> {
    let changed = ctx.update_config(|c| c.block_domains(domains)).await?;
    for domain in domains {
        if ctx.store.cancel_exception(domain).is_some() {
            info!(domain = %domain, "Temporary unblock cancelled");
        }
    }
    reconciler::run_cycle(ctx).await;

    let message = format!("Added {} domains to block list", changed.len());
    info!("{}: {}", message, changed.join(", "));
    let config = ctx.config();
    let _ = notifier::notify(
        &ctx.system,
        &config,
        notifier::info("Glocker Block", message.clone()),
    )
    .await;
    Ok(message)
}

async fn lock(ctx: &DaemonContext) -> Result<String> {
    let config = ctx.config();
    let decision = evaluate(&config, &ctx.clock.local(), &ctx.store.exceptions_snapshot());
    ctx.store.lock_sudo(decision.sudo_allowed, ctx.clock.now());
    warn!("Sudo access locked");
    reconciler::run_cycle(ctx).await;
    Ok("Sudo access locked until the next scheduled change".to_string())
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "enabled"
    } else {
        "disabled"
    }
}

/// Status reply body, without the `END` line
pub fn status_lines(ctx: &DaemonContext) -> Vec<String> {
    let config = ctx.config();
    let now = ctx.clock.now();
    let runtime = ctx.store.runtime();
    let mut lines = Vec::new();

    lines.push(format!(
        "Current Time: {}",
        ctx.clock.local().format("%Y-%m-%d %H:%M:%S")
    ));
    lines.push(format!(
        "Service Status: {}",
        if runtime.decommissioned {
            "Uninstalled"
        } else {
            "Running"
        }
    ));
    lines.push(format!(
        "Enforcement Interval: {} seconds",
        config.enforce_interval_seconds
    ));
    match runtime.last_cycle {
        Some(at) => lines.push(format!(
            "Last Enforcement: {}s ago",
            (now - at).num_seconds().max(0)
        )),
        None => lines.push("Last Enforcement: never".to_string()),
    }

    let blocked = runtime
        .last_decision
        .as_ref()
        .map(|d| d.blocked.len())
        .unwrap_or(0);
    lines.push(format!("Currently Blocked Domains: {}", blocked));

    if config.sudoers.enabled {
        let state = match (runtime.sudo_applied, runtime.sudo_lock.is_some()) {
            (_, true) => "blocked (locked)",
            (Some(true), false) => "allowed",
            (Some(false), false) => "blocked",
            (None, false) => "unknown",
        };
        lines.push(format!("Sudo Access: {}", state));
    } else {
        lines.push("Sudo Access: not managed".to_string());
    }

    let exceptions = ctx.store.exceptions_snapshot();
    let active: Vec<_> = exceptions.iter().filter(|e| e.is_active(now)).collect();
    lines.push(format!("Temporary Unblocks: {} active", active.len()));
    for exception in active {
        lines.push(format!(
            "  - {} (expires in {}m, reason: {})",
            exception.domain,
            exception.remaining_minutes(now),
            exception.reason
        ));
    }

    if config.violation_tracking.enabled {
        let (recent, total) = ctx
            .store
            .with_violations(|log| (log.recent_count(), log.total()));
        lines.push(format!(
            "Violations: {}/{} in last {} minutes ({} total)",
            recent,
            config.violation_tracking.max_violations,
            config.violation_tracking.time_window_minutes,
            total
        ));
    }

    let panic_state = ctx.store.panic_state();
    match (panic_state, panic_state.remaining(now)) {
        (PanicState::Suspended { wake_count, .. }, Some(left)) => lines.push(format!(
            "Panic Mode: active, {}m remaining ({} early wakes)",
            left.num_minutes(),
            wake_count
        )),
        _ => lines.push("Panic Mode: inactive".to_string()),
    }

    lines.push(String::new());
    lines.push("Configuration:".to_string());
    lines.push(format!("  Hosts File Management: {}", on_off(config.enable_hosts)));
    lines.push(format!("  Firewall Management: {}", on_off(config.enable_firewall)));
    lines.push(format!("  Sudoers Management: {}", on_off(config.sudoers.enabled)));
    lines.push(format!(
        "  Tamper Detection: {}",
        on_off(config.tamper_detection.enabled)
    ));
    lines.push(format!(
        "  Forbidden Programs: {} ({} configured)",
        on_off(config.forbidden_programs_active()),
        config.forbidden_programs.programs.len()
    ));
    lines.push(format!("  Self Healing: {}", on_off(config.enable_self_healing)));

    let always = config.domains.iter().filter(|d| d.always_block).count();
    let absolute = config.domains.iter().filter(|d| d.absolute).count();
    lines.push(format!(
        "Domains: {} total ({} always blocked, {} time-based, {} absolute)",
        config.domains.len(),
        always,
        config.domains.len() - always,
        absolute
    ));
    for domain in config.domains.iter().filter(|d| !d.always_block) {
        let windows: Vec<String> = domain.time_windows.iter().map(|w| w.describe()).collect();
        lines.push(format!("  - {}: {}", domain.name, windows.join(", ")));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::fake::FakeSystem;
    use chrono::{TimeZone, Utc};
    use glocker_common::{ClockTime, Config, Domain, ManualClock, TimeWindow, YamlConfigSource};

    fn context(config: Config) -> Arc<DaemonContext> {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap(),
        ));
        let (ctx, _events) = DaemonContext::new(
            config,
            Arc::new(YamlConfigSource::new("/nonexistent/config.yaml")),
            FakeSystem::new().system(),
            clock,
        );
        ctx
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.enable_hosts = false;
        config.domains.push(Domain::always("example.com"));
        config.domains.push(Domain {
            absolute: true,
            ..Domain::always("casino.example")
        });
        config.unblocking.reasons = vec!["work".to_string(), "research".to_string()];
        config
    }

    #[test]
    fn test_precheck_reason_allow_list() {
        let ctx = context(config());
        let bad = Command::Unblock {
            domains: vec!["example.com".to_string()],
            reason: "bored".to_string(),
        };
        assert!(matches!(
            precheck(&ctx, &bad),
            Err(GlockerError::InvalidReason { .. })
        ));
        let good = Command::Unblock {
            domains: vec!["example.com".to_string()],
            reason: "Work".to_string(),
        };
        assert!(precheck(&ctx, &good).is_ok());
    }

    #[test]
    fn test_precheck_all_absolute() {
        let ctx = context(config());
        let cmd = Command::Unblock {
            domains: vec!["casino.example".to_string()],
            reason: "work".to_string(),
        };
        assert!(matches!(
            precheck(&ctx, &cmd),
            Err(GlockerError::AbsoluteDomain(_))
        ));
    }

    #[tokio::test]
    async fn test_mixed_unblock_skips_absolute() {
        let ctx = context(config());
        let cmd = Command::Unblock {
            domains: vec!["example.com".to_string(), "casino.example".to_string()],
            reason: "work".to_string(),
        };
        let summary = execute(&ctx, cmd).await.unwrap();
        assert_eq!(summary, "Temporarily unblocked 1 domains for 30 minutes");
        let exceptions = ctx.store.exceptions_snapshot();
        assert!(exceptions.get("example.com").is_some());
        assert!(exceptions.get("casino.example").is_none());
    }

    #[tokio::test]
    async fn test_block_cancels_exception() {
        let ctx = context(config());
        execute(
            &ctx,
            Command::Unblock {
                domains: vec!["example.com".to_string()],
                reason: "work".to_string(),
            },
        )
        .await
        .unwrap();
        execute(
            &ctx,
            Command::Block {
                domains: vec!["example.com".to_string(), "new.example".to_string()],
            },
        )
        .await
        .unwrap();
        assert!(ctx.store.exceptions_snapshot().is_empty());
        assert!(ctx.config().find_domain("new.example").is_some());
        let blocked = ctx.store.runtime().last_decision.unwrap().blocked;
        assert!(blocked.contains(&"example.com".to_string()));
    }

    #[tokio::test]
    async fn test_reload_failure_keeps_config() {
        let ctx = context(config());
        assert!(execute(&ctx, Command::Reload).await.is_err());
        assert_eq!(ctx.config().domains.len(), 2);
    }

    #[tokio::test]
    async fn test_status_lists_exceptions() {
        let ctx = context(config());
        execute(
            &ctx,
            Command::Unblock {
                domains: vec!["example.com".to_string()],
                reason: "work".to_string(),
            },
        )
        .await
        .unwrap();
        let lines = status_lines(&ctx);
        assert!(lines.contains(&"Temporary Unblocks: 1 active".to_string()));
        assert!(lines
            .iter()
            .any(|l| l.contains("example.com (expires in 30m, reason: work)")));
        assert!(lines.contains(&"Currently Blocked Domains: 1".to_string()));
    }

    #[test]
    fn test_status_shows_panic_and_windows() {
        let mut config = config();
        config.domains.push(Domain {
            always_block: false,
            time_windows: vec![TimeWindow::new(
                ClockTime::new(9, 0).unwrap(),
                ClockTime::new(17, 0).unwrap(),
                vec![chrono::Weekday::Mon, chrono::Weekday::Tue],
            )],
            ..Domain::always("news.example")
        });
        let ctx = context(config);
        let deadline = ctx.clock.now() + chrono::Duration::minutes(15);
        ctx.store.with_panic(|state| {
            *state = PanicState::Suspended {
                deadline,
                wake_count: 2,
            }
        });

        let lines = status_lines(&ctx);
        assert!(lines.contains(&"Panic Mode: active, 15m remaining (2 early wakes)".to_string()));
        assert!(lines.contains(&"  - news.example: 09:00-17:00 (Mon,Tue)".to_string()));
        assert!(lines.contains(&"Service Status: Running".to_string()));

        ctx.store.decommission();
        assert!(status_lines(&ctx).contains(&"Service Status: Uninstalled".to_string()));
    }
}
