//! Forbidden programs
//!
//! Kills processes whose command line names a forbidden program while one
//! of that program's windows is open. Each kill is reported as a violation.

use crate::context::DaemonContext;
use crate::notifier;
use crate::system::ProcessInfo;
use crate::violations::ViolationEvent;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Never killed, whatever the filter says
const PROTECTED: &[&str] = &["glocker", "systemd", "kernel"];

/// Processes matching `filter`, minus pid 1, `own_pid` and protected names
pub fn matching<'a>(processes: &'a [ProcessInfo], filter: &str, own_pid: u32) -> Vec<&'a ProcessInfo> {
    let filter = filter.trim().to_lowercase();
    if filter.is_empty() {
        return Vec::new();
    }
    processes
        .iter()
        .filter(|p| p.command_line.to_lowercase().contains(&filter))
        .filter(|p| p.pid != 1 && p.pid != own_pid)
        .filter(|p| {
            let name = p.name.to_lowercase();
            !PROTECTED.iter().any(|protected| name.contains(protected))
        })
        .collect()
}

/// One pass over the process table. Returns what was killed.
pub async fn sweep(ctx: &DaemonContext) -> Vec<ProcessInfo> {
    let config = ctx.config();
    if !config.forbidden_programs_active() {
        return Vec::new();
    }

    let now = ctx.clock.local();
    let forbidden: Vec<_> = config
        .forbidden_programs
        .programs
        .iter()
        .filter(|p| p.is_forbidden_at(&now))
        .collect();
    if forbidden.is_empty() {
        return Vec::new();
    }

    let processes = match ctx.system.processes.list().await {
        Ok(list) => list,
        Err(e) => {
            debug!("Failed to get process list: {}", e);
            return Vec::new();
        }
    };

    let own_pid = std::process::id();
    let mut seen = HashSet::new();
    let mut killed = Vec::new();
    for program in forbidden {
        for process in matching(&processes, &program.name, own_pid) {
            if !seen.insert(process.pid) {
                continue;
            }
            if let Err(e) = ctx.system.processes.terminate(process.pid).await {
                warn!("Could not kill {} (PID {}): {}", process.name, process.pid, e);
                continue;
            }
            warn!(
                "Killed forbidden program {} (PID {}), matched filter {}",
                process.name, process.pid, program.name
            );

            let event = ViolationEvent::new("forbidden_program", process.name.clone(), ctx.clock.now());
            if ctx.violation_sender().try_send(event).is_err() {
                warn!("Violation queue full, dropping forbidden program event");
            }
            let _ = notifier::notify(
                &ctx.system,
                &config,
                notifier::info(
                    "Glocker Alert",
                    format!("Terminated forbidden program: {}", process.name),
                ),
            )
            .await;
            killed.push(process.clone());
        }
    }
    killed
}

/// Sweep every `check_interval_seconds` until shutdown or uninstall
pub async fn run(ctx: Arc<DaemonContext>) {
    let mut shutdown = ctx.shutdown_signal();
    loop {
        let interval = ctx.config().forbidden_interval();
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
        if ctx.store.is_decommissioned() {
            break;
        }
        let killed = sweep(&ctx).await;
        if !killed.is_empty() {
            info!("Forbidden program sweep killed {} process(es)", killed.len());
        }
    }
    debug!("Forbidden program monitor stopped");
}
