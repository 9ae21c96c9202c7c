//! Control socket client

use crate::protocol::{Command, END_MARKER, ERROR_PREFIX};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

/// Connection to a running glockerd
pub struct GlockerClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Reply lines, without `END`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub lines: Vec<String>,
}

impl Reply {
    pub fn is_error(&self) -> bool {
        self.lines
            .first()
            .map(|l| l.starts_with(ERROR_PREFIX))
            .unwrap_or(false)
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

impl GlockerClient {
    /// Socket path from $GLOCKER_SOCKET or the given default
    pub fn discover_socket_path(default: &Path) -> PathBuf {
        std::env::var_os("GLOCKER_SOCKET")
            .map(PathBuf::from)
            .unwrap_or_else(|| default.to_path_buf())
    }

    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = tokio::time::timeout(Duration::from_secs(2), UnixStream::connect(path))
            .await
            .with_context(|| format!("Connection to {} timed out", path.display()))?
            .with_context(|| {
                format!("Failed to connect to {}. Is glockerd running?", path.display())
            })?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Send one command and read its reply.
    ///
    /// Framed replies are read up to `END`; everything else is one line.
    /// An `ERROR:` first line always ends the reply.
    pub async fn send(&mut self, command: &Command) -> Result<Reply> {
        let line = format!("{}\n", command.to_line());
        self.writer
            .write_all(line.as_bytes())
            .await
            .context("Failed to send command")?;
        self.writer.flush().await?;

        let mut lines = Vec::new();
        loop {
            let mut buf = String::new();
            let n = self
                .reader
                .read_line(&mut buf)
                .await
                .context("Failed to read reply")?;
            if n == 0 {
                break;
            }
            let line = buf.trim_end_matches(['\r', '\n']).to_string();
            if line == END_MARKER {
                break;
            }
            let is_error = line.starts_with(ERROR_PREFIX);
            lines.push(line);
            if !command.expects_frame() || (is_error && lines.len() == 1) {
                break;
            }
        }

        if lines.is_empty() {
            anyhow::bail!("Connection closed without a reply");
        }
        Ok(Reply { lines })
    }
}

/// Connect, send one command, disconnect
pub async fn send_command(path: &Path, command: &Command) -> Result<Reply> {
    let mut client = GlockerClient::connect(path).await?;
    client.send(command).await
}
