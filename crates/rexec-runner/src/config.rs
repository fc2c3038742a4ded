use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::{Result, RexecError};

pub const DEFAULT_LEADER_DELAY_MS: u64 = 2000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub common: CommonConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get_data: Option<GetDataConfig>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub domains: BTreeMap<String, String>,
    #[serde(default)]
    pub experiments: BTreeMap<String, ExperimentConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonConfig {
    #[serde(default = "default_ssh")]
    pub ssh: String,
    pub remote_user: String,
    #[serde(default = "default_login_shell")]
    pub login_shell: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub src: PathBuf,
    pub dest: String,
    pub include_file: PathBuf,
    pub exclude_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetDataConfig {
    pub dest: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Mapping>,
    #[serde(default, skip_serializing_if = "Mapping::is_empty")]
    pub leader_args: Mapping,
}

fn default_ssh() -> String {
    "ssh".to_string()
}

fn default_login_shell() -> String {
    "bash -l".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let raw = fs::read_to_string(path)?;
        Config::parse(path, &raw)
    }

    pub fn parse(path: &Path, raw: &str) -> Result<Config> {
        serde_yaml::from_str(raw).map_err(|source| RexecError::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn experiment(&self, name: &str) -> Result<&ExperimentConfig> {
        self.experiments
            .get(name)
            .ok_or_else(|| RexecError::MissingExperimentConfig {
                experiment: name.to_string(),
                key: format!("experiments.{}", name),
            })
    }

    pub fn with_arg_overrides(&self, experiment: &str, overrides: &[String]) -> Result<Config> {
        let mut resolved = self.clone();
        let exp = resolved
            .experiments
            .get_mut(experiment)
            .ok_or_else(|| RexecError::MissingExperimentConfig {
                experiment: experiment.to_string(),
                key: format!("experiments.{}", experiment),
            })?;
        if overrides.is_empty() {
            return Ok(resolved);
        }
        let args = exp.args.get_or_insert_with(Mapping::new);
        for raw in overrides {
            let (key, val) = parse_override(raw)?;
            let key = Value::String(key.to_string());
            let value = match args.get(&key) {
                Some(Value::Bool(_)) => {
                    Value::Bool(parse_bool(val).ok_or_else(|| RexecError::InvalidArgOverride {
                        raw: raw.clone(),
                        reason: "expected a boolean".to_string(),
                    })?)
                }
                _ => Value::String(val.to_string()),
            };
            args.insert(key, value);
        }
        Ok(resolved)
    }

    pub fn render(&self) -> String {
        match serde_yaml::to_string(self) {
            Ok(body) => format!("Configuration:\n{}", body),
            Err(_) => format!("Configuration:\n{:#?}\n", self),
        }
    }
}

fn parse_override(raw: &str) -> Result<(&str, &str)> {
    let (key, val) = raw
        .split_once('=')
        .ok_or_else(|| RexecError::InvalidArgOverride {
            raw: raw.to_string(),
            reason: "expected key=value".to_string(),
        })?;
    if key.trim().is_empty() {
        return Err(RexecError::InvalidArgOverride {
            raw: raw.to_string(),
            reason: "key cannot be empty".to_string(),
        });
    }
    Ok((key.trim(), val))
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "yes" | "true" | "on" => Some(true),
        "0" | "no" | "false" | "off" => Some(false),
        _ => None,
    }
}

pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
common:
  ssh: ssh -i ~/.ssh/cloudlab
  remote_user: alice
  log_dir: /tmp/rexec-logs
sync:
  src: /home/alice/rome
  dest: /users/alice/rome
  include_file: scripts/include.txt
  exclude_file: scripts/exclude.txt
experiments:
  bench:
    bin_dir: /users/alice/rome/bazel-bin/bench
    bin: bench
    leader: n1
    leader_cmd: ./reset_barrier.sh
    args:
      runtime: 10
      use_erpc: false
      mode: rw
    leader_args:
      coordinator: true
"#;

    fn sample() -> Config {
        Config::parse(Path::new("rexec.yaml"), SAMPLE).expect("sample config")
    }

    fn arg_keys(config: &Config) -> Vec<String> {
        config.experiments["bench"]
            .args
            .as_ref()
            .expect("args")
            .keys()
            .filter_map(|k| k.as_str().map(str::to_string))
            .collect()
    }

    #[test]
    fn parse_applies_defaults() {
        let config = sample();
        assert_eq!(config.common.login_shell, "bash -l");
        assert_eq!(config.common.remote_user, "alice");
        assert!(config.get_data.is_none());
        assert_eq!(arg_keys(&config), vec!["runtime", "use_erpc", "mode"]);
    }

    #[test]
    fn malformed_yaml_is_config_error() {
        let err = Config::parse(Path::new("bad.yaml"), "common: [").expect_err("must fail");
        assert!(matches!(err, RexecError::Config { .. }), "{}", err);
    }

    #[test]
    fn overrides_keep_position_and_append_new_keys() {
        let config = sample()
            .with_arg_overrides(
                "bench",
                &["runtime=30".to_string(), "threads=4".to_string()],
            )
            .expect("overrides");
        assert_eq!(
            arg_keys(&config),
            vec!["runtime", "use_erpc", "mode", "threads"]
        );
        let args = config.experiments["bench"].args.as_ref().expect("args");
        assert_eq!(
            args.get(&Value::String("runtime".to_string())),
            Some(&Value::String("30".to_string()))
        );
    }

    #[test]
    fn boolean_override_is_normalized() {
        let config = sample()
            .with_arg_overrides("bench", &["use_erpc=Yes".to_string()])
            .expect("overrides");
        let args = config.experiments["bench"].args.as_ref().expect("args");
        assert_eq!(
            args.get(&Value::String("use_erpc".to_string())),
            Some(&Value::Bool(true))
        );

        let err = sample()
            .with_arg_overrides("bench", &["use_erpc=maybe".to_string()])
            .expect_err("not a boolean");
        assert!(matches!(err, RexecError::InvalidArgOverride { .. }), "{}", err);
    }

    #[test]
    fn override_without_equals_is_rejected() {
        let err = sample()
            .with_arg_overrides("bench", &["runtime".to_string()])
            .expect_err("must fail");
        assert!(err.to_string().contains("expected key=value"), "{}", err);
    }

    #[test]
    fn unknown_experiment_is_missing_config() {
        let err = sample()
            .with_arg_overrides("nope", &[])
            .expect_err("must fail");
        match err {
            RexecError::MissingExperimentConfig { experiment, key } => {
                assert_eq!(experiment, "nope");
                assert_eq!(key, "experiments.nope");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn render_contains_every_section() {
        let rendered = sample().render();
        assert!(rendered.starts_with("Configuration:\n"));
        assert!(rendered.contains("remote_user: alice"), "{}", rendered);
        assert!(rendered.contains("leader_cmd: ./reset_barrier.sh"), "{}", rendered);
    }
}
