use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};

use tracing::debug;

use crate::config::Config;
use crate::error::Result;
use crate::logs::{ensure_dir, ensure_log_dir, CommandClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Local,
    Remote,
}

#[derive(Debug, Clone)]
pub struct ExecutionUnit {
    pub host_id: String,
    pub hostname: String,
    pub class: CommandClass,
    pub target: Target,
    pub command: String,
    pub log_path: PathBuf,
    pub local_dirs: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure { exit_code: Option<i32> },
}

impl From<ExitStatus> for Outcome {
    fn from(status: ExitStatus) -> Self {
        if status.success() {
            Outcome::Success
        } else {
            Outcome::Failure {
                exit_code: status.code(),
            }
        }
    }
}

pub trait Execute: Sync {
    fn execute(&self, unit: &ExecutionUnit) -> Result<Outcome>;
}

#[derive(Debug, Clone)]
pub struct ShellExecutor {
    header: String,
    ssh: String,
    remote_user: String,
    login_shell: String,
}

impl ShellExecutor {
    pub fn new(config: &Config) -> Self {
        Self {
            header: config.render(),
            ssh: config.common.ssh.clone(),
            remote_user: config.common.remote_user.clone(),
            login_shell: config.common.login_shell.clone(),
        }
    }

    pub fn shell_command(&self, unit: &ExecutionUnit) -> String {
        match unit.target {
            Target::Local => unit.command.clone(),
            Target::Remote => remote_shell_command(
                &self.ssh,
                &self.remote_user,
                &unit.hostname,
                &self.login_shell,
                &unit.command,
            ),
        }
    }
}

impl Execute for ShellExecutor {
    fn execute(&self, unit: &ExecutionUnit) -> Result<Outcome> {
        for dir in &unit.local_dirs {
            ensure_dir(dir)?;
        }
        ensure_log_dir(&unit.log_path)?;
        let mut log = File::create(&unit.log_path)?;
        write!(log, "{}\n{}\n\n", self.header, unit.command)?;
        log.flush()?;

        let shell = self.shell_command(unit);
        debug!(host = %unit.host_id, "{}", shell);
        let status = Command::new("sh")
            .arg("-c")
            .arg(&shell)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .status()?;
        Ok(status.into())
    }
}

/// `<ssh> <user>@<host> '<login_shell> -c "<command>"'`
///
/// The command is inserted verbatim. Double quotes inside it close the inner
/// string early and single quotes close the outer one, so commands relying on
/// either will not survive the remote shell.
pub fn remote_shell_command(
    ssh: &str,
    remote_user: &str,
    hostname: &str,
    login_shell: &str,
    command: &str,
) -> String {
    format!(
        "{} {}@{} '{} -c \"{}\"'",
        ssh, remote_user, hostname, login_shell, command
    )
}
