//! Control socket line protocol
//!
//! One command per line, `action` or `action:payload`. Mutating commands
//! get a single acknowledgment line. Multi-line replies end with `END`.

use crate::error::{GlockerError, Result};
use std::fmt;

/// Terminates multi-line replies
pub const END_MARKER: &str = "END";

pub const OK_PREFIX: &str = "OK: ";
pub const ERROR_PREFIX: &str = "ERROR: ";
pub const COMPLETED_PREFIX: &str = "COMPLETED: ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    Reload,
    Unblock { domains: Vec<String>, reason: String },
    Block { domains: Vec<String> },
    Panic { minutes: u64 },
    Lock,
    AddKeyword { keywords: Vec<String> },
    Uninstall { reason: String },
}

fn split_list(payload: &str) -> Vec<String> {
    payload
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn invalid(msg: &str) -> GlockerError {
    GlockerError::Protocol(msg.to_string())
}

impl Command {
    /// Parse one request line
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let (action, payload) = match line.split_once(':') {
            Some((a, p)) => (a.trim(), Some(p)),
            None => (line, None),
        };

        match (action, payload) {
            ("status", None) => Ok(Command::Status),
            ("reload", None) => Ok(Command::Reload),
            ("lock", None) => Ok(Command::Lock),

            ("unblock", Some(payload)) => {
                // Reasons may contain colons, domains never do
                let (domains, reason) = payload
                    .split_once(':')
                    .ok_or_else(|| invalid("Reason required. Use 'unblock:domains:reason'"))?;
                let domains = split_list(domains);
                if domains.is_empty() {
                    return Err(invalid("Invalid format. Use 'unblock:domains:reason'"));
                }
                let reason = reason.trim();
                if reason.is_empty() {
                    return Err(invalid("Reason cannot be empty"));
                }
                Ok(Command::Unblock {
                    domains,
                    reason: reason.to_string(),
                })
            }
            ("unblock", None) => Err(invalid("Invalid format. Use 'unblock:domains:reason'")),

            ("block", Some(payload)) => {
                let domains = split_list(payload);
                if domains.is_empty() {
                    return Err(invalid("Invalid format. Use 'block:domains'"));
                }
                Ok(Command::Block { domains })
            }
            ("block", None) => Err(invalid("Invalid format. Use 'block:domains'")),

            ("panic", Some(payload)) => match payload.trim().parse::<u64>() {
                Ok(minutes) if minutes > 0 => Ok(Command::Panic { minutes }),
                _ => Err(invalid(
                    "Invalid minutes value. Must be a positive integer",
                )),
            },
            ("panic", None) => Err(invalid("Invalid format. Use 'panic:minutes'")),

            ("add-keyword", Some(payload)) => {
                let keywords = split_list(payload);
                if keywords.is_empty() {
                    return Err(invalid("Invalid format. Use 'add-keyword:keywords'"));
                }
                Ok(Command::AddKeyword { keywords })
            }
            ("add-keyword", None) => Err(invalid("Invalid format. Use 'add-keyword:keywords'")),

            ("uninstall", Some(payload)) => {
                let reason = payload.trim();
                if reason.is_empty() {
                    return Err(invalid("Reason cannot be empty"));
                }
                Ok(Command::Uninstall {
                    reason: reason.to_string(),
                })
            }
            ("uninstall", None) => Err(invalid("Invalid format. Use 'uninstall:reason'")),

            ("", _) => Err(invalid("Invalid format")),
            _ => Err(invalid(
                "Unknown action. Use 'status', 'reload', 'unblock:domains:reason', \
                 'block:domains', 'panic:minutes', 'lock', 'add-keyword:keywords' or \
                 'uninstall:reason'",
            )),
        }
    }

    /// Wire form, without the trailing newline
    pub fn to_line(&self) -> String {
        match self {
            Command::Status => "status".to_string(),
            Command::Reload => "reload".to_string(),
            Command::Lock => "lock".to_string(),
            Command::Unblock { domains, reason } => {
                format!("unblock:{}:{}", domains.join(","), reason)
            }
            Command::Block { domains } => format!("block:{}", domains.join(",")),
            Command::Panic { minutes } => format!("panic:{}", minutes),
            Command::AddKeyword { keywords } => format!("add-keyword:{}", keywords.join(",")),
            Command::Uninstall { reason } => format!("uninstall:{}", reason),
        }
    }

    pub fn is_mutating(&self) -> bool {
        !matches!(self, Command::Status)
    }

    /// Replies to these end with `END`
    pub fn expects_frame(&self) -> bool {
        matches!(self, Command::Status | Command::Uninstall { .. })
    }

    /// Immediate acknowledgment text for mutating commands
    pub fn ack(&self) -> String {
        match self {
            Command::Status => "Status".to_string(),
            Command::Reload => "Reload request received".to_string(),
            Command::Lock => "Sudo lock request received".to_string(),
            Command::Unblock { .. } => "Unblock request received".to_string(),
            Command::Block { .. } => "Block request received".to_string(),
            Command::Panic { minutes } => format!("Entering panic mode for {} minutes", minutes),
            Command::AddKeyword { .. } => "Add keyword request received".to_string(),
            Command::Uninstall { .. } => "Uninstall request received".to_string(),
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Command::Status => "status",
            Command::Reload => "reload",
            Command::Lock => "lock",
            Command::Unblock { .. } => "unblock",
            Command::Block { .. } => "block",
            Command::Panic { .. } => "panic",
            Command::AddKeyword { .. } => "add-keyword",
            Command::Uninstall { .. } => "uninstall",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

pub fn ok_line(msg: &str) -> String {
    format!("{}{}\n", OK_PREFIX, msg)
}

pub fn error_line(msg: &str) -> String {
    format!("{}{}\n", ERROR_PREFIX, msg)
}

pub fn completed_line(msg: &str) -> String {
    format!("{}{}\n", COMPLETED_PREFIX, msg)
}

pub fn end_line() -> String {
    format!("{}\n", END_MARKER)
}
