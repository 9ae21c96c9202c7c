//! Policy configuration
//!
//! Loaded from /etc/glocker/config.yaml. Every section carries serde
//! defaults so a partial file still loads; `validate` rejects malformed
//! policy before the daemon touches anything.

use crate::error::{GlockerError, Result};
use crate::schedule::{any_matches, TimeWindow};
use chrono::{DateTime, Duration, TimeZone};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Config file path
pub const CONFIG_PATH: &str = "/etc/glocker/config.yaml";

/// Default control socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/glocker.sock";

/// A blocklist entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub name: String,

    #[serde(default)]
    pub always_block: bool,

    /// Absolute domains can never be temporarily unblocked
    #[serde(default)]
    pub absolute: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub time_windows: Vec<TimeWindow>,

    /// Log every evaluation of this domain
    #[serde(default)]
    pub log_blocking: bool,
}

impl Domain {
    /// Permanently blocked entry, as created by the `block` command
    pub fn always(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            always_block: true,
            absolute: false,
            time_windows: Vec::new(),
            log_blocking: true,
        }
    }
}

/// Privilege-escalation policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SudoersConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub allowed_sudoers_line: String,

    #[serde(default)]
    pub blocked_sudoers_line: String,

    #[serde(default)]
    pub time_allowed: Vec<TimeWindow>,

    #[serde(default = "default_sudoers_path")]
    pub path: PathBuf,

    /// Pristine copy taken before the first managed write
    #[serde(default = "default_sudoers_backup")]
    pub backup_path: PathBuf,
}

fn default_sudoers_path() -> PathBuf {
    PathBuf::from("/etc/sudoers")
}

fn default_sudoers_backup() -> PathBuf {
    PathBuf::from("/etc/sudoers.glocker.backup")
}

impl Default for SudoersConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            user: String::new(),
            allowed_sudoers_line: String::new(),
            blocked_sudoers_line: String::new(),
            time_allowed: Vec::new(),
            path: default_sudoers_path(),
            backup_path: default_sudoers_backup(),
        }
    }
}

/// Integrity monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TamperConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_tamper_interval")]
    pub check_interval_seconds: u64,

    #[serde(default)]
    pub alarm_command: String,

    /// Monitored in addition to hosts and sudoers (binary, unit file, ...)
    #[serde(default)]
    pub extra_paths: Vec<PathBuf>,

    #[serde(default = "default_service_name")]
    pub service_name: String,
}

fn default_tamper_interval() -> u64 {
    30
}

fn default_service_name() -> String {
    "glocker.service".to_string()
}

impl Default for TamperConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval_seconds: default_tamper_interval(),
            alarm_command: String::new(),
            extra_paths: Vec::new(),
            service_name: default_service_name(),
        }
    }
}

/// Violation threshold tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_max_violations")]
    pub max_violations: usize,

    #[serde(default = "default_violation_window")]
    pub time_window_minutes: i64,

    #[serde(default)]
    pub command: String,

    #[serde(default)]
    pub reset_daily: bool,
}

fn default_max_violations() -> usize {
    5
}

fn default_violation_window() -> i64 {
    60
}

impl Default for ViolationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_violations: default_max_violations(),
            time_window_minutes: default_violation_window(),
            command: String::new(),
            reset_daily: false,
        }
    }
}

/// Temporary unblocking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnblockingConfig {
    /// Accepted reasons; empty accepts any non-empty reason
    #[serde(default)]
    pub reasons: Vec<String>,

    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Minutes
    #[serde(default = "default_unblock_minutes")]
    pub temp_unblock_time: i64,
}

/// Upper bound for any configured span in minutes (one year)
pub const MAX_SPAN_MINUTES: i64 = 525_600;

fn default_unblock_minutes() -> i64 {
    30
}

impl Default for UnblockingConfig {
    fn default() -> Self {
        Self {
            reasons: Vec::new(),
            log_file: None,
            temp_unblock_time: default_unblock_minutes(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UninstallConfig {
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

/// A program killed on sight while one of its windows is open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForbiddenProgram {
    /// Matched case-insensitively against process command lines
    pub name: String,

    /// Empty means forbidden at all times
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub time_windows: Vec<TimeWindow>,
}

impl ForbiddenProgram {
    pub fn is_forbidden_at<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> bool {
        self.time_windows.is_empty() || any_matches(&self.time_windows, at)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForbiddenProgramsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_forbidden_interval")]
    pub check_interval_seconds: u64,

    #[serde(default)]
    pub programs: Vec<ForbiddenProgram>,
}

fn default_forbidden_interval() -> u64 {
    5
}

impl Default for ForbiddenProgramsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval_seconds: default_forbidden_interval(),
            programs: Vec::new(),
        }
    }
}

/// Keywords pushed to the browser-side monitor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtensionKeywords {
    #[serde(default)]
    pub url_keywords: Vec<String>,

    #[serde(default)]
    pub content_keywords: Vec<String>,

    #[serde(default)]
    pub whitelist: Vec<String>,
}

/// Main glocker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_true")]
    pub enable_hosts: bool,

    #[serde(default)]
    pub enable_firewall: bool,

    #[serde(default = "default_hosts_path")]
    pub hosts_path: PathBuf,

    #[serde(default = "default_enforce_interval")]
    pub enforce_interval_seconds: u64,

    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    #[serde(default)]
    pub domains: Vec<Domain>,

    #[serde(default)]
    pub sudoers: SudoersConfig,

    #[serde(default)]
    pub tamper_detection: TamperConfig,

    #[serde(default)]
    pub violation_tracking: ViolationConfig,

    #[serde(default)]
    pub unblocking: UnblockingConfig,

    #[serde(default)]
    pub uninstall: UninstallConfig,

    #[serde(default)]
    pub extension_keywords: ExtensionKeywords,

    #[serde(default)]
    pub enable_forbidden_programs: bool,

    #[serde(default)]
    pub forbidden_programs: ForbiddenProgramsConfig,

    /// Re-apply the immutable flag to `install_path` every cycle
    #[serde(default)]
    pub enable_self_healing: bool,

    #[serde(default = "default_install_path")]
    pub install_path: PathBuf,

    /// Seconds to wait after the uninstall confirmation is typed
    #[serde(default = "default_mindful_delay")]
    pub mindful_delay: u64,

    /// Supports {title}, {message} and {urgency} placeholders
    #[serde(default)]
    pub notification_command: String,

    #[serde(default = "default_notification_timeout")]
    pub notification_timeout_seconds: u64,

    #[serde(default)]
    pub panic_command: String,

    #[serde(default)]
    pub dev: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_true() -> bool {
    true
}

fn default_hosts_path() -> PathBuf {
    PathBuf::from("/etc/hosts")
}

fn default_enforce_interval() -> u64 {
    60
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

fn default_install_path() -> PathBuf {
    PathBuf::from("/usr/local/bin/glockerd")
}

fn default_mindful_delay() -> u64 {
    30
}

fn default_notification_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enable_hosts: true,
            enable_firewall: false,
            hosts_path: default_hosts_path(),
            enforce_interval_seconds: default_enforce_interval(),
            socket_path: default_socket_path(),
            domains: Vec::new(),
            sudoers: SudoersConfig::default(),
            tamper_detection: TamperConfig::default(),
            violation_tracking: ViolationConfig::default(),
            unblocking: UnblockingConfig::default(),
            uninstall: UninstallConfig::default(),
            extension_keywords: ExtensionKeywords::default(),
            enable_forbidden_programs: false,
            forbidden_programs: ForbiddenProgramsConfig::default(),
            enable_self_healing: false,
            install_path: default_install_path(),
            mindful_delay: default_mindful_delay(),
            notification_command: String::new(),
            notification_timeout_seconds: default_notification_timeout(),
            panic_command: String::new(),
            dev: false,
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Parse and validate YAML text
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(text)
            .map_err(|e| GlockerError::ConfigValidation(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Reject malformed policy
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(GlockerError::ConfigValidation(msg));

        for domain in &self.domains {
            if domain.name.trim().is_empty() {
                return invalid("domain name cannot be empty".to_string());
            }
            for window in &domain.time_windows {
                if window.days.is_empty() {
                    return invalid(format!(
                        "time window for {} must specify at least one day",
                        domain.name
                    ));
                }
            }
        }

        if self.sudoers.enabled {
            if self.sudoers.user.trim().is_empty() {
                return invalid("sudoers.user cannot be empty when sudoers is enabled".to_string());
            }
            if self.sudoers.allowed_sudoers_line.trim().is_empty() {
                return invalid(
                    "sudoers.allowed_sudoers_line cannot be empty when sudoers is enabled"
                        .to_string(),
                );
            }
            if self.sudoers.blocked_sudoers_line.trim().is_empty() {
                return invalid(
                    "sudoers.blocked_sudoers_line cannot be empty when sudoers is enabled"
                        .to_string(),
                );
            }
            if self.sudoers.time_allowed.iter().any(|w| w.days.is_empty()) {
                return invalid(
                    "sudoers time_allowed window must specify at least one day".to_string(),
                );
            }
        }

        if self.violation_tracking.enabled {
            if self.violation_tracking.max_violations == 0 {
                return invalid("violation_tracking.max_violations must be at least 1".to_string());
            }
            if self.violation_tracking.time_window_minutes <= 0 {
                return invalid(
                    "violation_tracking.time_window_minutes must be positive".to_string(),
                );
            }
            if self.violation_tracking.time_window_minutes > MAX_SPAN_MINUTES {
                return invalid(format!(
                    "violation_tracking.time_window_minutes cannot exceed {}",
                    MAX_SPAN_MINUTES
                ));
            }
        }

        if self.unblocking.temp_unblock_time > MAX_SPAN_MINUTES {
            return invalid(format!(
                "unblocking.temp_unblock_time cannot exceed {}",
                MAX_SPAN_MINUTES
            ));
        }

        if self.forbidden_programs_active() {
            for program in &self.forbidden_programs.programs {
                if program.name.trim().is_empty() {
                    return invalid("forbidden program name cannot be empty".to_string());
                }
                if program.time_windows.iter().any(|w| w.days.is_empty()) {
                    return invalid(format!(
                        "time window for forbidden program {} must specify at least one day",
                        program.name
                    ));
                }
            }
        }

        if self.enforce_interval_seconds == 0 {
            return invalid("enforce_interval_seconds must be positive".to_string());
        }

        Ok(())
    }

    pub fn find_domain(&self, name: &str) -> Option<&Domain> {
        self.domains.iter().find(|d| d.name.eq_ignore_ascii_case(name))
    }

    pub fn is_absolute(&self, name: &str) -> bool {
        self.find_domain(name).map(|d| d.absolute).unwrap_or(false)
    }

    /// Case-insensitive reason check; an empty allow-list accepts anything
    pub fn is_valid_reason(&self, reason: &str) -> bool {
        self.unblocking.reasons.is_empty()
            || self
                .unblocking
                .reasons
                .iter()
                .any(|r| r.eq_ignore_ascii_case(reason.trim()))
    }

    pub fn unblock_duration(&self) -> Duration {
        let minutes = if self.unblocking.temp_unblock_time > 0 {
            self.unblocking.temp_unblock_time.min(MAX_SPAN_MINUTES)
        } else {
            default_unblock_minutes()
        };
        Duration::minutes(minutes)
    }

    /// Trailing window for violation counting
    pub fn violation_window(&self) -> Duration {
        Duration::minutes(
            self.violation_tracking
                .time_window_minutes
                .clamp(1, MAX_SPAN_MINUTES),
        )
    }

    pub fn enforce_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.enforce_interval_seconds.max(1))
    }

    /// Both switches must be on
    pub fn forbidden_programs_active(&self) -> bool {
        self.enable_forbidden_programs && self.forbidden_programs.enabled
    }

    pub fn forbidden_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.forbidden_programs.check_interval_seconds.max(1))
    }

    pub fn tamper_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.tamper_detection.check_interval_seconds.max(1))
    }

    pub fn notification_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.notification_timeout_seconds.max(1))
    }

    /// Add domains as permanent blocks. Existing entries are converted in
    /// place. Returns the names that were added or changed.
    pub fn block_domains(&mut self, names: &[String]) -> Vec<String> {
        let mut changed = Vec::new();
        for name in names {
            match self
                .domains
                .iter_mut()
                .find(|d| d.name.eq_ignore_ascii_case(name))
            {
                Some(existing) => {
                    if !existing.always_block || !existing.time_windows.is_empty() {
                        existing.always_block = true;
                        existing.time_windows.clear();
                        existing.log_blocking = true;
                        changed.push(existing.name.clone());
                    }
                }
                None => {
                    self.domains.push(Domain::always(name.clone()));
                    changed.push(name.clone());
                }
            }
        }
        changed
    }

    /// Append keywords to both URL and content lists, skipping duplicates
    pub fn add_keywords(&mut self, keywords: &[String]) -> usize {
        let mut added = 0;
        for keyword in keywords {
            let kw = &mut self.extension_keywords;
            if !kw.url_keywords.contains(keyword) {
                kw.url_keywords.push(keyword.clone());
                added += 1;
            }
            if !kw.content_keywords.contains(keyword) {
                kw.content_keywords.push(keyword.clone());
            }
        }
        added
    }
}

/// Where the daemon gets its policy from and persists command-driven edits to
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<Config>;
    fn persist(&self, config: &Config) -> Result<()>;
}

/// YAML file on disk
#[derive(Debug, Clone)]
pub struct YamlConfigSource {
    path: PathBuf,
}

impl YamlConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for YamlConfigSource {
    fn default() -> Self {
        Self::new(CONFIG_PATH)
    }
}

impl ConfigSource for YamlConfigSource {
    fn load(&self) -> Result<Config> {
        let text = fs::read_to_string(&self.path).map_err(|e| {
            GlockerError::ConfigValidation(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        let config = Config::from_yaml_str(&text)?;
        info!(
            "Loaded config from {} ({} domains)",
            self.path.display(),
            config.domains.len()
        );
        Ok(config)
    }

    fn persist(&self, config: &Config) -> Result<()> {
        let yaml = config.to_yaml()?;
        let tmp = self.path.with_extension("yaml.tmp");
        fs::write(&tmp, yaml)?;
        fs::rename(&tmp, &self.path)?;
        info!("Persisted config to {}", self.path.display());
        Ok(())
    }
}
