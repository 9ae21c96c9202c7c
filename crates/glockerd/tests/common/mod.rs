//! Shared fixtures: a daemon context wired to fakes, a temp dir and a
//! manual clock set to Monday 2025-03-10 09:00 UTC.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use glocker_common::{Config, Domain, ManualClock, YamlConfigSource};
use glockerd::system::fake::FakeSystem;
use glockerd::{DaemonContext, ViolationEvent};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const HOSTS_BASE: &str = "127.0.0.1 localhost\n::1 localhost\n";

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap()
}

pub struct Harness {
    pub dir: TempDir,
    pub fakes: FakeSystem,
    pub clock: Arc<ManualClock>,
    pub ctx: Arc<DaemonContext>,
    pub events: Option<mpsc::Receiver<ViolationEvent>>,
}

impl Harness {
    /// Hosts and firewall enabled, one always-blocked domain, files in a
    /// temp dir. `edit` adjusts the config before the context is built.
    pub fn new(edit: impl FnOnce(&mut Config, &TempDir)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.enable_hosts = true;
        config.enable_firewall = true;
        config.hosts_path = dir.path().join("hosts");
        config.socket_path = dir.path().join("glocker.sock");
        config.domains.push(Domain::always("example.com"));
        edit(&mut config, &dir);
        config.validate().unwrap();

        std::fs::write(&config.hosts_path, HOSTS_BASE).unwrap();
        std::fs::write(dir.path().join("config.yaml"), config.to_yaml().unwrap()).unwrap();

        let fakes = FakeSystem::new();
        fakes
            .resolver
            .answer("example.com", vec!["93.184.216.34".parse().unwrap()]);
        let clock = Arc::new(ManualClock::new(start()));
        let (ctx, events) = DaemonContext::new(
            config,
            Arc::new(YamlConfigSource::new(dir.path().join("config.yaml"))),
            fakes.system(),
            clock.clone(),
        );
        Self {
            dir,
            fakes,
            clock,
            ctx,
            events: Some(events),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn hosts(&self) -> String {
        std::fs::read_to_string(&self.ctx.config().hosts_path).unwrap()
    }
}

/// Poll `check` every 20ms for up to `secs` seconds
pub async fn eventually(secs: u64, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
