pub mod config;
pub mod dispatch;
pub mod error;
pub mod exec;
pub mod experiment;
pub mod logs;
pub mod nodes;
pub mod sync;

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::Local;
use tracing::{debug, info, warn};

pub use config::Config;
pub use dispatch::{Dispatcher, Phase, PhaseReport, UnitReport, UnitState};
pub use error::{Result, RexecError};
pub use exec::{Execute, ExecutionUnit, Outcome, ShellExecutor, Target};
pub use experiment::{build_command, RunConfig};
pub use logs::{CommandClass, LogLayout};
pub use nodes::{DomainTable, Host, HostSet, NodeRecord};

use dispatch::LeaderStep;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub nodefile: PathBuf,
    pub num_nodes: Option<usize>,
    pub skip: BTreeSet<String>,
    pub offline: BTreeSet<String>,
    pub sync: bool,
    pub cmd: Option<String>,
    pub outfile: Option<String>,
    pub get_data: Option<String>,
    pub sudo: bool,
    pub exp: Option<String>,
    pub exp_bin: Option<String>,
    pub exp_args: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RunPlan {
    pub config: Config,
    pub testbed: String,
    pub hosts: HostSet,
    pub phases: Vec<Phase>,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub testbed: String,
    pub phases: Vec<PhaseReport>,
}

impl RunReport {
    pub fn failed(&self) -> usize {
        self.phases.iter().map(PhaseReport::failed).sum()
    }
}

pub fn plan_run(config: &Config, opts: &RunOptions) -> Result<RunPlan> {
    let nodes = nodes::parse_node_file(&opts.nodefile)?;
    let table = DomainTable::default().with_entries(&config.domains);
    let hosts = nodes::resolve(&nodes, &opts.offline, &table)?;
    let testbed = nodes::testbed_label(&opts.nodefile);

    // Data retrieval only uses the experiment name as a path component.
    let runs_experiment = opts.get_data.is_none();
    let resolved = match &opts.exp {
        Some(exp) if runs_experiment || !opts.exp_args.is_empty() => {
            config.with_arg_overrides(exp, &opts.exp_args)?
        }
        Some(_) => config.clone(),
        None if !opts.exp_args.is_empty() => {
            return Err(RexecError::InvalidInvocation(
                "--exp-args requires --exp".to_string(),
            ))
        }
        None => config.clone(),
    };
    debug!("testbed={}", testbed);
    debug!("hosts={:?}", hosts.hosts());

    let layout = LogLayout::new(&resolved.common.log_dir, &testbed);
    let active = hosts.active(opts.num_nodes);
    let mut phases = Vec::new();

    if opts.sync {
        phases.push(plan_sync(&resolved, &layout, hosts.hosts())?);
    }
    if let Some(remote_dir) = &opts.get_data {
        let exp = opts.exp.as_deref().ok_or_else(|| {
            RexecError::InvalidInvocation(
                "provide the experiment name of the retrieved data with --exp".to_string(),
            )
        })?;
        phases.push(plan_get_data(&resolved, &layout, active, exp, remote_dir)?);
    }
    if let Some(cmd) = &opts.cmd {
        phases.push(plan_cmd(&layout, active, cmd));
    }
    if let (Some(exp), None) = (&opts.exp, &opts.get_data) {
        let run = RunConfig::resolve(
            &resolved,
            exp,
            opts.exp_bin.as_deref(),
            opts.outfile.as_deref(),
            opts.sudo,
        )?;
        phases.push(plan_experiment(&run, &layout, active, &opts.skip));
    }

    Ok(RunPlan {
        config: resolved,
        testbed,
        hosts,
        phases,
    })
}

fn plan_sync(config: &Config, layout: &LogLayout, hosts: &[Host]) -> Result<Phase> {
    let sync = config.sync.as_ref().ok_or_else(|| {
        RexecError::InvalidInvocation("--sync requires a `sync` section in the config".to_string())
    })?;
    let units = hosts
        .iter()
        .map(|h| ExecutionUnit {
            host_id: h.id.clone(),
            hostname: h.hostname.clone(),
            class: CommandClass::Sync,
            target: Target::Local,
            command: sync::build_sync_command(
                sync,
                &config.common.ssh,
                &config.common.remote_user,
                &h.hostname,
            ),
            log_path: layout.log_path(&CommandClass::Sync, &h.id, &h.hostname),
            local_dirs: Vec::new(),
        })
        .collect();
    Ok(Phase::new(CommandClass::Sync, units))
}

fn plan_get_data(
    config: &Config,
    layout: &LogLayout,
    active: &[Host],
    exp: &str,
    remote_dir: &str,
) -> Result<Phase> {
    let get_data = config.get_data.as_ref().ok_or_else(|| {
        RexecError::InvalidInvocation(
            "--get-data requires a `get_data` section in the config".to_string(),
        )
    })?;
    let stamp = Local::now().format("%Y%m%d%H%M%S").to_string();
    let units = active
        .iter()
        .map(|h| {
            let dest = get_data
                .dest
                .join(&stamp)
                .join(exp)
                .join(layout.testbed())
                .join(format!("{}.{}.data", h.id, h.hostname));
            debug!("downloading to {}", dest.display());
            ExecutionUnit {
                host_id: h.id.clone(),
                hostname: h.hostname.clone(),
                class: CommandClass::Data,
                target: Target::Local,
                command: sync::build_fetch_command(
                    &config.common.ssh,
                    &config.common.remote_user,
                    &h.hostname,
                    remote_dir,
                    &dest,
                ),
                log_path: layout.log_path(&CommandClass::Data, &h.id, &h.hostname),
                local_dirs: vec![dest],
            }
        })
        .collect();
    Ok(Phase::new(CommandClass::Data, units))
}

fn plan_cmd(layout: &LogLayout, active: &[Host], cmd: &str) -> Phase {
    let units = active
        .iter()
        .map(|h| ExecutionUnit {
            host_id: h.id.clone(),
            hostname: h.hostname.clone(),
            class: CommandClass::Cmd,
            target: Target::Remote,
            command: cmd.to_string(),
            log_path: layout.log_path(&CommandClass::Cmd, &h.id, &h.hostname),
            local_dirs: Vec::new(),
        })
        .collect();
    Phase::new(CommandClass::Cmd, units)
}

fn plan_experiment(
    run: &RunConfig,
    layout: &LogLayout,
    active: &[Host],
    skip: &BTreeSet<String>,
) -> Phase {
    let class = CommandClass::Experiment(run.experiment.clone());
    let mut phase = Phase::new(class.clone(), Vec::new());
    for (idx, h) in active.iter().enumerate() {
        let is_leader = run.is_leader(&h.id);
        // Skipping a leader drops its experiment unit, not its leader command.
        if is_leader {
            if let Some(leader_cmd) = &run.leader_cmd {
                phase.leader = Some(LeaderStep {
                    unit: ExecutionUnit {
                        host_id: h.id.clone(),
                        hostname: h.hostname.clone(),
                        class: CommandClass::Leader,
                        target: Target::Remote,
                        command: leader_cmd.clone(),
                        log_path: layout.log_path(&CommandClass::Leader, &h.id, &h.hostname),
                        local_dirs: Vec::new(),
                    },
                    barrier: run.barrier.clone(),
                });
            }
        }
        if skip.contains(&h.id) {
            debug!("ignoring {}", h.id);
            phase.skipped.push(h.id.clone());
            continue;
        }
        phase.units.push(ExecutionUnit {
            host_id: h.id.clone(),
            hostname: h.hostname.clone(),
            class: class.clone(),
            target: Target::Remote,
            command: build_command(run, active, &h.id, idx, is_leader),
            log_path: layout.log_path(&class, &h.id, &h.hostname),
            local_dirs: Vec::new(),
        });
    }
    if let Some(leader) = &run.leader {
        if phase.leader.is_none() {
            warn!("leader {} is not among the active hosts", leader);
        }
    }
    phase
}

pub fn execute_plan<E: Execute>(plan: &RunPlan, dispatcher: &Dispatcher<E>) -> RunReport {
    let mut phases = Vec::with_capacity(plan.phases.len());
    for phase in &plan.phases {
        info!("{}: dispatching to {} hosts", phase.class, phase.units.len());
        let report = dispatcher.dispatch_all(phase);
        info!(
            "{}: {} succeeded, {} failed",
            report.class,
            report.units.iter().filter(|u| u.succeeded()).count(),
            report.failed()
        );
        phases.push(report);
    }
    RunReport {
        testbed: plan.testbed.clone(),
        phases,
    }
}

pub fn run(config: &Config, opts: &RunOptions) -> Result<RunReport> {
    let plan = plan_run(config, opts)?;
    let dispatcher = Dispatcher::new(ShellExecutor::new(&plan.config));
    Ok(execute_plan(&plan, &dispatcher))
}
