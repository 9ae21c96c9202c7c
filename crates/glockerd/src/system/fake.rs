//! In-memory collaborators for tests
//!
//! Each fake records what it was asked to do. `FakeSystem` bundles one of
//! each and hands out a `System` wired to them.

use super::{
    CommandLauncher, DnsResolver, Firewall, ImmutableFlag, Notification, Notifier, ProcessControl,
    ProcessInfo, ServiceProbe, Suspender, SyntaxValidator, System, WakeSource,
};
use async_trait::async_trait;
use glocker_common::{GlockerError, Resource, Result};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Default)]
pub struct FakeResolver {
    answers: Mutex<HashMap<String, Vec<IpAddr>>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl FakeResolver {
    pub fn answer(&self, domain: &str, addrs: Vec<IpAddr>) {
        lock(&self.answers).insert(domain.to_string(), addrs);
    }

    pub fn fail(&self, domain: &str) {
        lock(&self.failing).insert(domain.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl DnsResolver for FakeResolver {
    async fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>> {
        lock(&self.calls).push(domain.to_string());
        if lock(&self.failing).contains(domain) {
            return Err(GlockerError::TransientExternal(format!(
                "could not resolve {}",
                domain
            )));
        }
        Ok(lock(&self.answers).get(domain).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct FakeFirewall {
    rules: Mutex<Vec<IpAddr>>,
    fail_reject: AtomicBool,
}

impl FakeFirewall {
    pub fn rules(&self) -> Vec<IpAddr> {
        lock(&self.rules).clone()
    }

    /// Simulate someone deleting a rule by hand
    pub fn remove_rule(&self, addr: IpAddr) {
        lock(&self.rules).retain(|r| *r != addr);
    }

    pub fn set_fail_reject(&self, fail: bool) {
        self.fail_reject.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Firewall for FakeFirewall {
    async fn clear_tagged(&self) -> Result<usize> {
        let mut rules = lock(&self.rules);
        let removed = rules.len();
        rules.clear();
        Ok(removed)
    }

    async fn reject(&self, addr: IpAddr) -> Result<()> {
        if self.fail_reject.load(Ordering::SeqCst) {
            return Err(GlockerError::mutation(
                Resource::Firewall,
                format!("reject {} refused", addr),
            ));
        }
        lock(&self.rules).push(addr);
        Ok(())
    }

    async fn count_tagged(&self) -> Result<usize> {
        Ok(lock(&self.rules).len())
    }
}

#[derive(Default)]
pub struct FakeValidator {
    rejecting: AtomicBool,
    validated: Mutex<Vec<PathBuf>>,
}

impl FakeValidator {
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    pub fn validated(&self) -> Vec<PathBuf> {
        lock(&self.validated).clone()
    }
}

#[async_trait]
impl SyntaxValidator for FakeValidator {
    async fn validate(&self, path: &Path) -> Result<()> {
        lock(&self.validated).push(path.to_path_buf());
        if self.rejecting.load(Ordering::SeqCst) {
            Err(GlockerError::mutation(
                Resource::Sudoers,
                format!("validation failed for {}", path.display()),
            ))
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
pub struct FakeImmutable {
    flags: Mutex<HashMap<PathBuf, bool>>,
    calls: AtomicUsize,
}

impl FakeImmutable {
    pub fn is_immutable(&self, path: &Path) -> bool {
        lock(&self.flags).get(path).copied().unwrap_or(false)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImmutableFlag for FakeImmutable {
    async fn set_immutable(&self, path: &Path, immutable: bool) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.flags).insert(path.to_path_buf(), immutable);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeService {
    active: AtomicBool,
}

impl FakeService {
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }
}

#[async_trait]
impl ServiceProbe for FakeService {
    async fn is_active(&self, _service: &str) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct FakeNotifier {
    sent: Mutex<Vec<Notification>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        lock(&self.sent).clone()
    }

    pub fn titles(&self) -> Vec<String> {
        lock(&self.sent).iter().map(|n| n.title.clone()).collect()
    }

    /// Make every delivery take `delay` (for timeout tests)
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn notify(&self, _template: &str, note: &Notification) -> Result<()> {
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.sent).push(note.clone());
        Ok(())
    }
}

/// A launched command and its extra environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub command: String,
    pub env: Vec<(String, String)>,
}

impl Launch {
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Default)]
pub struct FakeLauncher {
    launched: Mutex<Vec<Launch>>,
}

impl FakeLauncher {
    pub fn launched(&self) -> Vec<Launch> {
        lock(&self.launched).clone()
    }

    pub fn count(&self, command: &str) -> usize {
        lock(&self.launched)
            .iter()
            .filter(|l| l.command == command)
            .count()
    }
}

#[async_trait]
impl CommandLauncher for FakeLauncher {
    async fn launch(&self, command: &str, env: &[(String, String)]) -> Result<()> {
        lock(&self.launched).push(Launch {
            command: command.to_string(),
            env: env.to_vec(),
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSuspender {
    count: AtomicUsize,
}

impl FakeSuspender {
    pub fn suspends(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Suspender for FakeSuspender {
    async fn suspend(&self, _command: &str) -> Result<()> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Wake events are injected with `wake()`
#[derive(Default)]
pub struct FakeWake {
    notify: Notify,
}

impl FakeWake {
    pub fn wake(&self) {
        self.notify.notify_one();
    }
}

#[async_trait]
impl WakeSource for FakeWake {
    async fn wait_for_wake(&self, max: Duration) -> bool {
        tokio::time::timeout(max, self.notify.notified()).await.is_ok()
    }
}

/// A process table; terminated processes disappear from it
#[derive(Default)]
pub struct FakeProcesses {
    running: Mutex<Vec<ProcessInfo>>,
    terminated: Mutex<Vec<u32>>,
}

impl FakeProcesses {
    pub fn spawn(&self, pid: u32, name: &str, command_line: &str) {
        lock(&self.running).push(ProcessInfo {
            pid,
            name: name.to_string(),
            command_line: command_line.to_string(),
        });
    }

    pub fn terminated(&self) -> Vec<u32> {
        lock(&self.terminated).clone()
    }

    pub fn running(&self) -> Vec<ProcessInfo> {
        lock(&self.running).clone()
    }
}

#[async_trait]
impl ProcessControl for FakeProcesses {
    async fn list(&self) -> Result<Vec<ProcessInfo>> {
        Ok(self.running())
    }

    async fn terminate(&self, pid: u32) -> Result<()> {
        let mut running = lock(&self.running);
        let before = running.len();
        running.retain(|p| p.pid != pid);
        if running.len() == before {
            return Err(GlockerError::TransientExternal(format!("no such process {}", pid)));
        }
        lock(&self.terminated).push(pid);
        Ok(())
    }
}

/// One of every fake, plus the `System` that uses them
#[derive(Default, Clone)]
pub struct FakeSystem {
    pub resolver: Arc<FakeResolver>,
    pub firewall: Arc<FakeFirewall>,
    pub validator: Arc<FakeValidator>,
    pub immutable: Arc<FakeImmutable>,
    pub service: Arc<FakeService>,
    pub notifier: Arc<FakeNotifier>,
    pub launcher: Arc<FakeLauncher>,
    pub suspender: Arc<FakeSuspender>,
    pub wake: Arc<FakeWake>,
    pub processes: Arc<FakeProcesses>,
}

impl FakeSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn system(&self) -> System {
        System {
            resolver: self.resolver.clone(),
            firewall: self.firewall.clone(),
            validator: self.validator.clone(),
            immutable: self.immutable.clone(),
            service: self.service.clone(),
            notifier: self.notifier.clone(),
            launcher: self.launcher.clone(),
            suspender: self.suspender.clone(),
            wake: self.wake.clone(),
            processes: self.processes.clone(),
        }
    }
}
