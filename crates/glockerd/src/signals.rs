//! Termination signal handling
//!
//! Outside dev mode the daemon does not stop on a signal. It logs and
//! reports each attempt and keeps enforcing.

use crate::context::DaemonContext;
use crate::notifier;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{debug, info, warn};

struct Trapped {
    name: &'static str,
    stream: Signal,
    /// Stops the daemon in dev mode
    stops_in_dev: bool,
}

/// Install the handlers and spawn the task that answers them
pub fn spawn(ctx: Arc<DaemonContext>) -> Result<tokio::task::JoinHandle<()>> {
    let trapped = vec![
        trap("SIGTERM", SignalKind::terminate(), true)?,
        trap("SIGINT", SignalKind::interrupt(), true)?,
        trap("SIGHUP", SignalKind::hangup(), false)?,
        trap("SIGQUIT", SignalKind::quit(), false)?,
    ];
    Ok(tokio::spawn(watch(ctx, trapped)))
}

fn trap(name: &'static str, kind: SignalKind, stops_in_dev: bool) -> Result<Trapped> {
    let stream = signal(kind).with_context(|| format!("Failed to trap {}", name))?;
    Ok(Trapped {
        name,
        stream,
        stops_in_dev,
    })
}

/// Resolves with the index of whichever signal arrives first
async fn next_signal(trapped: &mut [Trapped]) -> Option<usize> {
    let [term, int, hup, quit] = trapped else {
        return None;
    };
    tokio::select! {
        Some(()) = term.stream.recv() => Some(0),
        Some(()) = int.stream.recv() => Some(1),
        Some(()) = hup.stream.recv() => Some(2),
        Some(()) = quit.stream.recv() => Some(3),
        else => None,
    }
}

async fn watch(ctx: Arc<DaemonContext>, mut trapped: Vec<Trapped>) {
    let mut shutdown = ctx.shutdown_signal();
    loop {
        let index = tokio::select! {
            index = next_signal(&mut trapped) => index,
            _ = shutdown.changed() => break,
        };
        let Some(index) = index else {
            break;
        };
        let (name, stops_in_dev) = (trapped[index].name, trapped[index].stops_in_dev);

        let config = ctx.config();
        if config.dev && stops_in_dev {
            info!("Received {} in dev mode, shutting down", name);
            ctx.shutdown();
            break;
        }

        warn!("Termination attempt: received {}, ignoring", name);
        let _ = notifier::notify(
            &ctx.system,
            &config,
            notifier::alert(
                "Glocker Alert",
                format!(
                    "Termination attempt detected ({}) at {}",
                    name,
                    ctx.clock.local().format("%Y-%m-%d %H:%M:%S")
                ),
            ),
        )
        .await;
    }
    debug!("Signal watcher stopped");
}
