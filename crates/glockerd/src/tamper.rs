//! Tamper detection
//!
//! Compares monitored files, the tagged firewall rule count and service
//! liveness against the baseline held in the state store. Legitimate
//! writers bracket their writes with `begin_write`/`finish_write`; a check
//! that overlaps one is thrown away. After an alarm the baseline is
//! recaptured wholesale, so the same drift alarms once.

use crate::context::DaemonContext;
use crate::hosts;
use crate::notifier;
use glocker_common::{Config, GlockerError, Resource, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What part of a file the hash covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashScope {
    WholeFile,
    /// Only the glocker section of the hosts file
    ManagedSection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFingerprint {
    pub path: PathBuf,
    pub scope: HashScope,
    /// None if the file exists but could not be read
    pub hash: Option<String>,
    pub existed: bool,
}

/// Observed integrity state at one instant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub files: BTreeMap<PathBuf, FileFingerprint>,
    pub firewall_rules: usize,
    pub service_active: bool,
}

/// Last trusted snapshot plus write bookkeeping
#[derive(Debug, Clone, Default)]
pub struct TamperBaseline {
    pub trusted: Snapshot,
    generation: u64,
    writes_in_flight: usize,
    paused: bool,
}

impl TamperBaseline {
    pub fn begin_write(&mut self) {
        self.generation += 1;
        self.writes_in_flight += 1;
    }

    pub fn finish_write(&mut self, fingerprint: FileFingerprint) {
        self.generation += 1;
        self.writes_in_flight = self.writes_in_flight.saturating_sub(1);
        self.trusted
            .files
            .insert(fingerprint.path.clone(), fingerprint);
    }

    pub fn finish_firewall(&mut self, rules: usize) {
        self.generation += 1;
        self.writes_in_flight = self.writes_in_flight.saturating_sub(1);
        self.trusted.firewall_rules = rules;
    }

    pub fn replace(&mut self, snapshot: Snapshot) {
        self.generation += 1;
        self.trusted = snapshot;
    }

    /// Stop checking for good (uninstall)
    pub fn pause(&mut self) {
        self.generation += 1;
        self.paused = true;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// No write in flight and not paused
    pub fn is_settled(&self) -> bool {
        self.writes_in_flight == 0 && !self.paused
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TamperReason {
    FileDeleted(PathBuf),
    FileModified(PathBuf),
    FirewallRulesReduced { from: usize, to: usize },
    ServiceStopped(String),
}

impl fmt::Display for TamperReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TamperReason::FileDeleted(p) => write!(f, "File deleted: {}", p.display()),
            TamperReason::FileModified(p) => write!(f, "File modified: {}", p.display()),
            TamperReason::FirewallRulesReduced { from, to } => {
                write!(f, "Firewall rules reduced from {} to {}", from, to)
            }
            TamperReason::ServiceStopped(name) => write!(f, "Service {} was stopped", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Clean,
    /// Overlapped a legitimate write or could not observe; retried next tick
    Skipped,
    Tampered(Vec<TamperReason>),
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub async fn fingerprint(path: &Path, scope: HashScope) -> FileFingerprint {
    let (hash, existed) = match tokio::fs::read(path).await {
        Ok(bytes) => {
            let hash = match scope {
                HashScope::WholeFile => sha256_hex(&bytes),
                HashScope::ManagedSection => {
                    let text = String::from_utf8_lossy(&bytes);
                    sha256_hex(hosts::managed_section(&text).as_bytes())
                }
            };
            (Some(hash), true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (None, false),
        Err(e) => {
            debug!("Cannot read {} for fingerprint: {}", path.display(), e);
            (None, true)
        }
    };
    FileFingerprint {
        path: path.to_path_buf(),
        scope,
        hash,
        existed,
    }
}

/// Files watched under `config`, hosts first
pub fn monitored_paths(config: &Config) -> Vec<(PathBuf, HashScope)> {
    let mut paths: Vec<(PathBuf, HashScope)> = Vec::new();
    if config.enable_hosts {
        paths.push((config.hosts_path.clone(), HashScope::ManagedSection));
    }
    if config.sudoers.enabled {
        paths.push((config.sudoers.path.clone(), HashScope::WholeFile));
    }
    for extra in &config.tamper_detection.extra_paths {
        if !paths.iter().any(|(p, _)| p == extra) {
            paths.push((extra.clone(), HashScope::WholeFile));
        }
    }
    paths
}

/// Observe the current state. Fails if the firewall cannot be queried.
pub async fn capture(ctx: &DaemonContext, config: &Config) -> Result<Snapshot> {
    let mut files = BTreeMap::new();
    for (path, scope) in monitored_paths(config) {
        let fp = fingerprint(&path, scope).await;
        files.insert(path, fp);
    }
    let firewall_rules = if config.enable_firewall {
        ctx.system.firewall.count_tagged().await?
    } else {
        0
    };
    let service_active = ctx
        .system
        .service
        .is_active(&config.tamper_detection.service_name)
        .await;
    Ok(Snapshot {
        files,
        firewall_rules,
        service_active,
    })
}

/// Differences between trusted and current state that count as tampering
pub fn compare(trusted: &Snapshot, current: &Snapshot, service_name: &str) -> Vec<TamperReason> {
    let mut reasons = Vec::new();
    for (path, now) in &current.files {
        let Some(before) = trusted.files.get(path) else {
            continue;
        };
        if before.existed && !now.existed {
            reasons.push(TamperReason::FileDeleted(path.clone()));
        } else if before.existed && now.existed {
            if let (Some(a), Some(b)) = (&before.hash, &now.hash) {
                if a != b {
                    reasons.push(TamperReason::FileModified(path.clone()));
                }
            }
        }
    }
    if current.firewall_rules < trusted.firewall_rules {
        reasons.push(TamperReason::FirewallRulesReduced {
            from: trusted.firewall_rules,
            to: current.firewall_rules,
        });
    }
    if trusted.service_active && !current.service_active {
        reasons.push(TamperReason::ServiceStopped(service_name.to_string()));
    }
    reasons
}

/// Capture and trust the current state
pub async fn rebaseline(ctx: &DaemonContext) -> Result<()> {
    let config = ctx.config();
    let snapshot = capture(ctx, &config).await?;
    info!(
        "Tamper baseline captured: {} files, {} firewall rules, service active={}",
        snapshot.files.len(),
        snapshot.firewall_rules,
        snapshot.service_active
    );
    ctx.store.replace_baseline(snapshot);
    Ok(())
}

/// One tamper check
pub async fn check_once(ctx: &DaemonContext) -> CheckOutcome {
    let config = ctx.config();

    let Some((trusted, generation)) = ctx.store.with_baseline(|b| {
        b.is_settled()
            .then(|| (b.trusted.clone(), b.generation()))
    }) else {
        debug!("Write in flight, skipping tamper check");
        return CheckOutcome::Skipped;
    };

    let current = match capture(ctx, &config).await {
        Ok(s) => s,
        Err(e) => {
            warn!("Tamper check could not observe state: {}", e);
            return CheckOutcome::Skipped;
        }
    };

    let unchanged = ctx
        .store
        .with_baseline(|b| b.is_settled() && b.generation() == generation);
    if !unchanged {
        debug!("Baseline moved during tamper check, discarding result");
        return CheckOutcome::Skipped;
    }

    let reasons = compare(&trusted, &current, &config.tamper_detection.service_name);
    if reasons.is_empty() {
        return CheckOutcome::Clean;
    }

    raise_alarm(ctx, &config, &reasons).await;

    // Trust whatever is there now so the same drift does not alarm again
    if let Err(e) = rebaseline(ctx).await {
        warn!("Rebaseline after alarm failed ({}), trusting last observation", e);
        ctx.store.replace_baseline(current);
    }
    CheckOutcome::Tampered(reasons)
}

async fn raise_alarm(ctx: &DaemonContext, config: &Config, reasons: &[TamperReason]) {
    let lines: Vec<String> = reasons.iter().map(|r| r.to_string()).collect();
    error!("TAMPER DETECTED: {}", lines.join("; "));

    let _ = notifier::notify(
        &ctx.system,
        config,
        notifier::alert("Glocker Security Alert", "System tampering detected!"),
    )
    .await;

    let command = config.tamper_detection.alarm_command.trim();
    if command.is_empty() {
        return;
    }
    let mut message = String::from("GLOCKER TAMPER DETECTED:\n");
    for line in &lines {
        message.push_str("  - ");
        message.push_str(line);
        message.push('\n');
    }
    let env = vec![
        ("GLOCKER_TAMPER_MESSAGE".to_string(), message),
        ("GLOCKER_TAMPER_REASONS".to_string(), lines.join("; ")),
    ];
    if let Err(e) = ctx.system.launcher.launch(command, &env).await {
        error!("Alarm command failed: {}", e);
    }
}

/// Re-apply the immutable flag to the installed binary. A missing binary
/// is reported; there is nothing left to protect.
pub async fn self_heal(ctx: &DaemonContext, config: &Config) -> Result<()> {
    let path = &config.install_path;
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        error!("CRITICAL: {} was deleted, self-healing failed", path.display());
        return Err(GlockerError::mutation(
            Resource::Binary,
            format!("{} is missing", path.display()),
        ));
    }
    ctx.system.immutable.set_immutable(path, true).await?;

    if let Ok(exe) = std::env::current_exe().and_then(|p| p.canonicalize()) {
        if exe != *path {
            debug!(
                "Running from {} rather than {}",
                exe.display(),
                path.display()
            );
        }
    }
    Ok(())
}

/// Check on `check_interval_seconds` until shutdown
pub async fn run(ctx: Arc<DaemonContext>) {
    let mut shutdown = ctx.shutdown_signal();
    loop {
        let interval = ctx.config().tamper_interval();
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
        if !ctx.config().tamper_detection.enabled {
            continue;
        }
        match check_once(&ctx).await {
            CheckOutcome::Clean => debug!("Tamper check clean"),
            CheckOutcome::Skipped => {}
            CheckOutcome::Tampered(reasons) => {
                warn!("Tamper alarm raised for {} condition(s), baseline reset", reasons.len())
            }
        }
    }
    debug!("Tamper monitor stopped");
}
