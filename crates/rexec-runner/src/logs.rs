use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandClass {
    Sync,
    Data,
    Cmd,
    Leader,
    Experiment(String),
}

impl fmt::Display for CommandClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandClass::Sync => f.write_str("sync"),
            CommandClass::Data => f.write_str("data"),
            CommandClass::Cmd => f.write_str("cmd"),
            CommandClass::Leader => f.write_str("leader"),
            CommandClass::Experiment(name) => f.write_str(name),
        }
    }
}

/// `<root>/<class>/<testbed>/<host_id>.<hostname>.log`
#[derive(Debug, Clone)]
pub struct LogLayout {
    root: PathBuf,
    testbed: String,
}

impl LogLayout {
    pub fn new(root: impl Into<PathBuf>, testbed: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            testbed: testbed.into(),
        }
    }

    pub fn testbed(&self) -> &str {
        &self.testbed
    }

    pub fn log_path(&self, class: &CommandClass, host_id: &str, hostname: &str) -> PathBuf {
        self.root
            .join(class.to_string())
            .join(&self.testbed)
            .join(format!("{}.{}.log", host_id, hostname))
    }
}

pub fn ensure_log_dir(log_path: &Path) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        ensure_dir(parent)?;
    }
    Ok(())
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    match fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(e) => Err(e.into()),
    }
}
