//! Daemon context shared by every task

use crate::state::StateStore;
use crate::system::System;
use crate::violations::ViolationEvent;
use glocker_common::{Clock, Config, ConfigSource, Result};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, warn};

/// Capacity of the violation event queue
pub const VIOLATION_QUEUE: usize = 256;

pub struct DaemonContext {
    config: RwLock<Arc<Config>>,
    /// Serializes config edits; never held by readers
    config_edits: Mutex<()>,
    pub config_source: Arc<dyn ConfigSource>,
    pub store: StateStore,
    pub clock: Arc<dyn Clock>,
    pub system: System,
    /// Serializes reconciliation cycles
    pub cycle_lock: Mutex<()>,
    shutdown: watch::Sender<bool>,
    violations: mpsc::Sender<ViolationEvent>,
}

impl DaemonContext {
    /// Build a context plus the receiving end of the violation queue
    pub fn new(
        config: Config,
        config_source: Arc<dyn ConfigSource>,
        system: System,
        clock: Arc<dyn Clock>,
    ) -> (Arc<Self>, mpsc::Receiver<ViolationEvent>) {
        let (shutdown, _) = watch::channel(false);
        let (violations, events) = mpsc::channel(VIOLATION_QUEUE);
        let ctx = Arc::new(Self {
            config: RwLock::new(Arc::new(config)),
            config_edits: Mutex::new(()),
            config_source,
            store: StateStore::new(),
            clock,
            system,
            cycle_lock: Mutex::new(()),
            shutdown,
            violations,
        });
        (ctx, events)
    }

    /// Current config snapshot
    pub fn config(&self) -> Arc<Config> {
        match self.config.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    fn swap_config(&self, config: Arc<Config>) {
        match self.config.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }

    pub async fn replace_config(&self, config: Config) {
        let _edit = self.config_edits.lock().await;
        self.swap_config(Arc::new(config));
    }

    /// Apply `edit` to a copy of the config, validate, swap it in and
    /// persist. A persist failure is logged; the change stays in memory.
    pub async fn update_config<R>(&self, edit: impl FnOnce(&mut Config) -> R) -> Result<R> {
        let _edit = self.config_edits.lock().await;
        let mut next = (*self.config()).clone();
        let out = edit(&mut next);
        next.validate()?;
        let next = Arc::new(next);
        self.swap_config(Arc::clone(&next));

        let source = Arc::clone(&self.config_source);
        match tokio::task::spawn_blocking(move || source.persist(&next)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Could not persist config change: {}", e),
            Err(e) => warn!("Config persist task failed: {}", e),
        }
        Ok(out)
    }

    /// Sender for access violations observed outside the daemon
    pub fn violation_sender(&self) -> mpsc::Sender<ViolationEvent> {
        self.violations.clone()
    }

    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::fake::FakeSystem;
    use glocker_common::{Domain, ManualClock, YamlConfigSource};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_update_config_persists() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(YamlConfigSource::new(dir.path().join("config.yaml")));
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let (ctx, _events) = DaemonContext::new(
            Config::default(),
            source.clone(),
            FakeSystem::new().system(),
            clock,
        );

        ctx.update_config(|c| c.domains.push(Domain::always("example.com")))
            .await
            .unwrap();
        assert!(ctx.config().find_domain("example.com").is_some());
        let reloaded = source.load().unwrap();
        assert!(reloaded.find_domain("example.com").is_some());

        // Invalid edit is refused and nothing changes
        assert!(ctx
            .update_config(|c| c.domains.push(Domain::always("")))
            .await
            .is_err());
        assert_eq!(ctx.config().domains.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let (ctx, _events) = DaemonContext::new(
            Config::default(),
            Arc::new(YamlConfigSource::default()),
            FakeSystem::new().system(),
            clock,
        );
        let mut rx = ctx.shutdown_signal();
        assert!(!ctx.is_shutting_down());
        ctx.shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_readers_not_blocked_during_persist() {
        struct SlowSource(std::sync::Mutex<Option<Config>>);
        impl ConfigSource for SlowSource {
            fn load(&self) -> Result<Config> {
                Ok(Config::default())
            }
            fn persist(&self, config: &Config) -> Result<()> {
                std::thread::sleep(std::time::Duration::from_millis(500));
                *self.0.lock().unwrap() = Some(config.clone());
                Ok(())
            }
        }

        let source = Arc::new(SlowSource(std::sync::Mutex::new(None)));
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let (ctx, _events) = DaemonContext::new(
            Config::default(),
            source.clone(),
            FakeSystem::new().system(),
            clock,
        );

        let editor = Arc::clone(&ctx);
        let edit = tokio::spawn(async move {
            editor
                .update_config(|c| c.domains.push(Domain::always("example.com")))
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // Edit is visible while the slow write is still running
        let started = std::time::Instant::now();
        assert!(ctx.config().find_domain("example.com").is_some());
        assert!(started.elapsed() < std::time::Duration::from_millis(100));
        assert!(!edit.is_finished());

        edit.await.unwrap().unwrap();
        assert!(source.0.lock().unwrap().is_some());
    }
}
