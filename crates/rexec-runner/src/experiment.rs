use std::path::Path;
use std::time::Duration;

use serde_yaml::Mapping;
use tracing::warn;

use crate::config::{scalar_to_string, Config, DEFAULT_LEADER_DELAY_MS};
use crate::dispatch::StartupBarrier;
use crate::error::{Result, RexecError};
use crate::nodes::Host;

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub experiment: String,
    pub binary: String,
    pub args: Vec<(String, String)>,
    pub leader: Option<String>,
    pub leader_cmd: Option<String>,
    pub leader_args: Vec<(String, String)>,
    pub outfile: Option<String>,
    pub sudo: bool,
    pub barrier: StartupBarrier,
}

impl RunConfig {
    pub fn resolve(
        config: &Config,
        experiment: &str,
        bin_override: Option<&str>,
        outfile: Option<&str>,
        sudo: bool,
    ) -> Result<RunConfig> {
        let exp = config.experiment(experiment)?;
        let missing = |key: &str| RexecError::MissingExperimentConfig {
            experiment: experiment.to_string(),
            key: format!("experiments.{}.{}", experiment, key),
        };
        let bin_dir = exp.bin_dir.as_deref().ok_or_else(|| missing("bin_dir"))?;
        let bin = match bin_override {
            Some(name) => name,
            None => exp.bin.as_deref().ok_or_else(|| missing("bin"))?,
        };
        let binary = Path::new(bin_dir).join(bin).to_string_lossy().to_string();

        let args = match &exp.args {
            Some(args) => render_args(experiment, args)?,
            None => {
                warn!("no default arguments configured for experiment {}", experiment);
                Vec::new()
            }
        };

        let (leader, leader_cmd) = match (&exp.leader, &exp.leader_cmd) {
            (Some(leader), Some(cmd)) => (Some(leader.clone()), Some(cmd.clone())),
            _ => (None, None),
        };

        Ok(RunConfig {
            experiment: experiment.to_string(),
            binary,
            args,
            leader,
            leader_cmd,
            leader_args: render_args(experiment, &exp.leader_args)?,
            outfile: outfile.map(str::to_string),
            sudo,
            barrier: StartupBarrier {
                delay: Duration::from_millis(
                    exp.leader_delay_ms.unwrap_or(DEFAULT_LEADER_DELAY_MS),
                ),
                port: exp.leader_port,
            },
        })
    }

    pub fn is_leader(&self, host_id: &str) -> bool {
        self.leader.as_deref() == Some(host_id)
    }
}

fn render_args(experiment: &str, args: &Mapping) -> Result<Vec<(String, String)>> {
    let mut out = Vec::with_capacity(args.len());
    for (key, value) in args {
        let key = scalar_to_string(key).ok_or_else(|| {
            RexecError::InvalidInvocation(format!(
                "experiment '{}' has a non-scalar argument name",
                experiment
            ))
        })?;
        let value = scalar_to_string(value).ok_or_else(|| {
            RexecError::InvalidInvocation(format!(
                "argument '{}' of experiment '{}' must be a scalar",
                key, experiment
            ))
        })?;
        out.push((key, value));
    }
    Ok(out)
}

pub fn build_command(
    run: &RunConfig,
    active: &[Host],
    host_id: &str,
    host_index: usize,
    is_leader: bool,
) -> String {
    let mut args: Vec<String> = run
        .args
        .iter()
        .map(|(k, v)| format!("--{}={}", k, v))
        .collect();
    args.push(format!("--hostname={}", host_id));
    args.push(format!("--host_id={}", host_index));
    let remotes: Vec<&str> = active
        .iter()
        .filter(|h| h.id != host_id)
        .map(|h| h.id.as_str())
        .collect();
    args.push(format!("--remotes={}", remotes.join(",")));
    if is_leader {
        args.extend(run.leader_args.iter().map(|(k, v)| format!("--{}={}", k, v)));
    }

    let mut cmd = String::new();
    if run.sudo {
        cmd.push_str("sudo ");
    }
    cmd.push_str(&run.binary);
    cmd.push(' ');
    cmd.push_str(&args.join(" "));
    if let Some(outfile) = &run.outfile {
        cmd.push_str(" &>");
        cmd.push_str(outfile);
    }
    cmd
}
