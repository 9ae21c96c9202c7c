//! Audit Logger - Append-only JSONL records of unblocks and uninstalls

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs::{create_dir_all, OpenOptions};
use tokio::io::AsyncWriteExt;

/// One granted temporary unblock
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnblockLogEntry {
    pub unblock_time: DateTime<Utc>,
    pub restore_time: DateTime<Utc>,
    pub reason: String,
    pub domain: String,
}

/// Daemon lifecycle events requested over the socket (uninstall)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LifecycleLogEntry {
    pub time: DateTime<Utc>,
    pub action: String,
    pub reason: String,
}

pub struct AuditLogger {
    log_path: PathBuf,
}

impl AuditLogger {
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
        }
    }

    /// Append one entry as a JSON line
    pub async fn log<T: Serialize>(&self, entry: &T) -> Result<()> {
        let json = serde_json::to_string(entry)? + "\n";

        if let Some(dir) = self.log_path.parent() {
            if !dir.as_os_str().is_empty() {
                create_dir_all(dir)
                    .await
                    .context("Failed to create audit log directory")?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await
            .with_context(|| format!("Failed to open {}", self.log_path.display()))?;

        file.write_all(json.as_bytes())
            .await
            .context("Failed to write audit entry")?;
        file.sync_all().await.context("Failed to sync audit log")?;

        Ok(())
    }
}
