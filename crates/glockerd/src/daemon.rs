//! Daemon wiring
//!
//! Runs one enforcement cycle, trusts the result as the tamper baseline,
//! then starts the gateway and the background loops and waits for shutdown.

use crate::context::DaemonContext;
use crate::system::System;
use crate::violations::{self, ViolationEvent};
use crate::{forbidden, gateway, reconciler, signals, tamper};
use anyhow::Result;
use glocker_common::{Clock, Config, ConfigSource};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub struct Daemon {
    ctx: Arc<DaemonContext>,
    events: mpsc::Receiver<ViolationEvent>,
    trap_signals: bool,
}

impl Daemon {
    pub fn new(
        config: Config,
        config_source: Arc<dyn ConfigSource>,
        system: System,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (ctx, events) = DaemonContext::new(config, config_source, system, clock);
        Self {
            ctx,
            events,
            trap_signals: true,
        }
    }

    /// Leave process signals alone (embedding and tests)
    pub fn without_signal_handlers(mut self) -> Self {
        self.trap_signals = false;
        self
    }

    pub fn context(&self) -> Arc<DaemonContext> {
        Arc::clone(&self.ctx)
    }

    pub fn violation_sender(&self) -> mpsc::Sender<ViolationEvent> {
        self.ctx.violation_sender()
    }

    pub async fn run(self) -> Result<()> {
        let Daemon {
            ctx,
            events,
            trap_signals,
        } = self;
        let config = ctx.config();
        info!(
            "Glocker daemon v{} starting ({} domains)",
            env!("CARGO_PKG_VERSION"),
            config.domains.len()
        );

        let report = reconciler::run_cycle(&ctx).await;
        info!(
            "Initial enforcement: {} domains blocked, sudo allowed={}",
            report.decision.blocked.len(),
            report.sudo_applied
        );
        if let Err(e) = tamper::rebaseline(&ctx).await {
            warn!("Initial tamper baseline incomplete: {}", e);
        }

        let listener = gateway::bind(&config.socket_path).await?;

        let mut tasks = vec![
            tokio::spawn(gateway::serve(Arc::clone(&ctx), listener)),
            tokio::spawn(reconciler::run(Arc::clone(&ctx))),
            tokio::spawn(tamper::run(Arc::clone(&ctx))),
            tokio::spawn(violations::run(Arc::clone(&ctx), events)),
            tokio::spawn(forbidden::run(Arc::clone(&ctx))),
        ];
        if trap_signals {
            match signals::spawn(Arc::clone(&ctx)) {
                Ok(handle) => tasks.push(handle),
                Err(e) => error!("Signal handlers not installed: {}", e),
            }
        }

        info!("Glocker daemon ready");

        let mut shutdown = ctx.shutdown_signal();
        while !*shutdown.borrow_and_update() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        for task in tasks {
            if let Err(e) = task.await {
                warn!("Task ended abnormally: {}", e);
            }
        }
        let _ = tokio::fs::remove_file(&config.socket_path).await;
        info!("Glocker daemon stopped");
        Ok(())
    }
}
