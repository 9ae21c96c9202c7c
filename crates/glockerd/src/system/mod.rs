//! OS collaborators
//!
//! Everything that shells out or touches kernel state sits behind one of
//! these traits. `real` talks to the machine, `fake` records calls and
//! returns scripted answers for tests.

pub mod fake;
pub mod real;

use async_trait::async_trait;
use glocker_common::Result;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Tag carried by every firewall rule glocker installs
pub const FIREWALL_TAG: &str = "GLOCKER-BLOCK";

#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// A and AAAA records for `domain`
    async fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>>;
}

#[async_trait]
pub trait Firewall: Send + Sync {
    /// Remove every tagged rule. Returns how many were removed.
    async fn clear_tagged(&self) -> Result<usize>;

    /// Install one tagged reject rule for outbound traffic to `addr`
    async fn reject(&self, addr: IpAddr) -> Result<()>;

    async fn count_tagged(&self) -> Result<usize>;
}

#[async_trait]
pub trait SyntaxValidator: Send + Sync {
    /// Ok if `path` is a syntactically valid sudoers file
    async fn validate(&self, path: &Path) -> Result<()>;
}

#[async_trait]
pub trait ImmutableFlag: Send + Sync {
    async fn set_immutable(&self, path: &Path, immutable: bool) -> Result<()>;
}

#[async_trait]
pub trait ServiceProbe: Send + Sync {
    async fn is_active(&self, service: &str) -> bool;
}

/// One running process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Executable name
    pub name: String,
    pub command_line: String,
}

#[async_trait]
pub trait ProcessControl: Send + Sync {
    async fn list(&self) -> Result<Vec<ProcessInfo>>;

    /// Ask `pid` to exit; implementations escalate if it does not
    async fn terminate(&self, pid: u32) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Low,
    Normal,
    Critical,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Normal => "normal",
            Urgency::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub urgency: Urgency,
}

impl Notification {
    pub fn new(title: impl Into<String>, message: impl Into<String>, urgency: Urgency) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            urgency,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `note` through `template` (the configured notification command)
    async fn notify(&self, template: &str, note: &Notification) -> Result<()>;
}

#[async_trait]
pub trait CommandLauncher: Send + Sync {
    /// Run `command` (whitespace-split) with extra environment variables
    async fn launch(&self, command: &str, env: &[(String, String)]) -> Result<()>;
}

#[async_trait]
pub trait Suspender: Send + Sync {
    async fn suspend(&self, command: &str) -> Result<()>;
}

#[async_trait]
pub trait WakeSource: Send + Sync {
    /// Wait up to `max` for a resume from suspend. True if one was seen.
    async fn wait_for_wake(&self, max: Duration) -> bool;
}

/// The full set of collaborators a daemon runs against
#[derive(Clone)]
pub struct System {
    pub resolver: Arc<dyn DnsResolver>,
    pub firewall: Arc<dyn Firewall>,
    pub validator: Arc<dyn SyntaxValidator>,
    pub immutable: Arc<dyn ImmutableFlag>,
    pub service: Arc<dyn ServiceProbe>,
    pub notifier: Arc<dyn Notifier>,
    pub launcher: Arc<dyn CommandLauncher>,
    pub suspender: Arc<dyn Suspender>,
    pub wake: Arc<dyn WakeSource>,
    pub processes: Arc<dyn ProcessControl>,
}

impl System {
    /// Collaborators that act on this machine
    pub fn real() -> Self {
        Self {
            resolver: Arc::new(real::DigResolver),
            firewall: Arc::new(real::IptablesFirewall),
            validator: Arc::new(real::Visudo),
            immutable: Arc::new(real::Chattr),
            service: Arc::new(real::Systemctl),
            notifier: Arc::new(real::CommandNotifier),
            launcher: Arc::new(real::ProcessLauncher),
            suspender: Arc::new(real::CommandSuspender),
            wake: Arc::new(real::ClockJumpWake::default()),
            processes: Arc::new(real::PsProcesses),
        }
    }
}
