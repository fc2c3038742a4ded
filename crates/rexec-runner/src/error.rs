use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RexecError>;

#[derive(Debug, Error)]
pub enum RexecError {
    #[error("malformed node file {}:{line}: {reason}", .path.display())]
    MalformedNodeFile {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("unknown node type '{node_type}' for node '{id}'")]
    UnknownNodeType { id: String, node_type: String },

    #[error("missing experiment config for '{experiment}': {key}")]
    MissingExperimentConfig { experiment: String, key: String },

    #[error("invalid experiment argument override '{raw}': {reason}")]
    InvalidArgOverride { raw: String, reason: String },

    #[error("invalid invocation: {0}")]
    InvalidInvocation(String),

    #[error("command failed on host {host} (exit code: {})", exit_code_label(.exit_code))]
    RemoteCommandFailed { host: String, exit_code: Option<i32> },

    #[error("sync failed for host {host}")]
    SyncFailed { host: String },

    #[error("failed to read config {}: {source}", .path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RexecError {
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            RexecError::RemoteCommandFailed { .. } | RexecError::SyncFailed { .. }
        )
    }
}

fn exit_code_label(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}
