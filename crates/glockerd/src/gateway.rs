//! Command gateway - Unix socket server for glockerctl and scripts

use crate::commands;
use crate::context::DaemonContext;
use crate::uninstall;
use anyhow::{Context, Result};
use glocker_common::protocol::{completed_line, end_line, error_line, ok_line};
use glocker_common::Command;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

/// Bind the control socket, replacing a stale one, owner-only
pub async fn bind(path: &Path) -> Result<UnixListener> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .context("Failed to create socket directory")?;
    }
    let _ = tokio::fs::remove_file(path).await;

    let listener = UnixListener::bind(path)
        .with_context(|| format!("Failed to bind {}", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .context("Failed to set socket permissions")?;

    info!("Listening on {}", path.display());
    Ok(listener)
}

/// Accept connections until shutdown, one task each
pub async fn serve(ctx: Arc<DaemonContext>, listener: UnixListener) {
    let mut shutdown = ctx.shutdown_signal();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, ctx).await {
                            debug!("Connection ended: {}", e);
                        }
                    });
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("Gateway stopped");
}

async fn handle_connection(stream: UnixStream, ctx: Arc<DaemonContext>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        respond(&ctx, &line, &mut writer).await?;
        if ctx.is_shutting_down() {
            break;
        }
    }
    Ok(())
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, text: &str) -> Result<()> {
    writer.write_all(text.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Answer one request line. Mutating commands are acknowledged before any
/// work starts.
pub async fn respond<W: AsyncWrite + Unpin>(
    ctx: &Arc<DaemonContext>,
    line: &str,
    writer: &mut W,
) -> Result<()> {
    let command = match Command::parse(line) {
        Ok(c) => c,
        Err(e) => {
            warn!("Bad request {:?}: {}", line.trim(), e);
            return send(writer, &error_line(&e.to_string())).await;
        }
    };
    debug!(action = command.action(), "Request");

    if let Err(e) = commands::precheck(ctx, &command) {
        return send(writer, &error_line(&e.to_string())).await;
    }

    if !command.is_mutating() {
        let mut reply = String::new();
        for line in commands::status_lines(ctx) {
            reply.push_str(&line);
            reply.push('\n');
        }
        reply.push_str(&end_line());
        return send(writer, &reply).await;
    }

    // The request stands even if the client has gone away
    let acked = send(writer, &ok_line(&command.ack())).await;

    match command {
        Command::Uninstall { reason } => {
            let report = uninstall::run(ctx, &reason).await;
            let mut reply = completed_line(&report.summary());
            reply.push_str(&end_line());
            let sent = match acked {
                Ok(()) => send(writer, &reply).await,
                Err(e) => Err(e),
            };
            ctx.shutdown();
            sent
        }
        command => {
            let ctx = Arc::clone(ctx);
            tokio::spawn(async move {
                let action = command.action();
                match commands::execute(&ctx, command).await {
                    Ok(summary) => info!(action, "{}", summary),
                    Err(e) if e.is_fatal() => error!(action, "Command failed: {}", e),
                    Err(e) => warn!(action, "Command failed: {}", e),
                }
            });
            acked
        }
    }
}
