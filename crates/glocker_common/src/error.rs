//! Error types for glocker.

use std::fmt;
use thiserror::Error;

/// A managed OS resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Hosts,
    Firewall,
    Sudoers,
    /// The installed daemon binary
    Binary,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Hosts => "hosts",
            Resource::Firewall => "firewall",
            Resource::Sudoers => "sudoers",
            Resource::Binary => "binary",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum GlockerError {
    #[error("Invalid configuration: {0}")]
    ConfigValidation(String),

    #[error("Failed to apply {resource}: {message}")]
    ResourceMutation { resource: Resource, message: String },

    #[error("External call failed: {0}")]
    TransientExternal(String),

    #[error("Insufficient privilege: {0}")]
    Privilege(String),

    #[error("Domain {0} is absolute and cannot be temporarily unblocked")]
    AbsoluteDomain(String),

    #[error("Invalid reason '{reason}'. Valid reasons: {valid}")]
    InvalidReason { reason: String, valid: String },

    #[error("{0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GlockerError {
    pub fn mutation(resource: Resource, message: impl Into<String>) -> Self {
        GlockerError::ResourceMutation {
            resource,
            message: message.into(),
        }
    }

    /// Fatal errors stop the daemon before it mutates anything.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            GlockerError::ConfigValidation(_) | GlockerError::Privilege(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GlockerError>;
