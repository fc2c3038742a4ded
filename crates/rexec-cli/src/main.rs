use anyhow::Result;
use clap::Parser;
use rexec_runner::{Config, PhaseReport, RunOptions, RunReport, UnitReport, UnitState};
use serde_json::{json, Value};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "rexec",
    version = "0.1.0",
    about = "Run commands and experiments across a fleet of testbed nodes"
)]
struct Cli {
    #[arg(short = 'c', long, default_value = "rexec.yaml")]
    configfile: PathBuf,
    #[arg(short = 'n', long)]
    nodefile: PathBuf,
    #[arg(short = 'N', long)]
    num_nodes: Option<usize>,
    #[arg(long, value_delimiter = ',')]
    skip: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    offline: Vec<String>,
    #[arg(short = 's', long)]
    sync: bool,
    #[arg(long)]
    cmd: Option<String>,
    #[arg(long)]
    outfile: Option<String>,
    #[arg(short = 'D', long)]
    get_data: Option<String>,
    #[arg(short = 'S', long)]
    sudo: bool,
    #[arg(long)]
    debug: bool,
    #[arg(long)]
    exp: Option<String>,
    #[arg(long)]
    exp_bin: Option<String>,
    #[arg(long, value_delimiter = ',')]
    exp_args: Vec<String>,
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    let json_mode = cli.json;
    match run_command(cli) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("run_failed", err.to_string()));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .init();
}

fn run_command(cli: Cli) -> Result<Option<Value>> {
    let config = Config::load(&cli.configfile)?;
    tracing::debug!("configfile={}", cli.configfile.display());
    tracing::debug!("nodefile={}", cli.nodefile.display());
    let opts = RunOptions {
        nodefile: cli.nodefile,
        num_nodes: cli.num_nodes,
        skip: cli.skip.into_iter().collect(),
        offline: cli.offline.into_iter().collect(),
        sync: cli.sync,
        cmd: cli.cmd,
        outfile: cli.outfile,
        get_data: cli.get_data,
        sudo: cli.sudo,
        exp: cli.exp,
        exp_bin: cli.exp_bin,
        exp_args: cli.exp_args,
    };
    let report = rexec_runner::run(&config, &opts)?;
    if cli.json {
        return Ok(Some(json!({
            "ok": true,
            "command": "run",
            "report": run_report_to_json(&report),
        })));
    }
    print_report(&report);
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

fn run_report_to_json(report: &RunReport) -> Value {
    json!({
        "testbed": report.testbed,
        "failed": report.failed(),
        "phases": report.phases.iter().map(phase_report_to_json).collect::<Vec<_>>(),
    })
}

fn phase_report_to_json(phase: &PhaseReport) -> Value {
    json!({
        "class": phase.class.to_string(),
        "leader": phase.leader.as_ref().map(unit_report_to_json),
        "units": phase.units.iter().map(unit_report_to_json).collect::<Vec<_>>(),
        "skipped": phase.skipped,
    })
}

fn unit_report_to_json(unit: &UnitReport) -> Value {
    let exit_code = match unit.state {
        UnitState::Failed { exit_code } => exit_code,
        _ => None,
    };
    json!({
        "host_id": unit.host_id,
        "hostname": unit.hostname,
        "log": unit.log_path.display().to_string(),
        "status": state_label(&unit.state),
        "exit_code": exit_code,
        "launched_at": unit.launched_at.to_rfc3339(),
        "finished_at": unit.finished_at.to_rfc3339(),
    })
}

fn state_label(state: &UnitState) -> &'static str {
    match state {
        UnitState::Pending => "pending",
        UnitState::Running => "running",
        UnitState::Succeeded => "succeeded",
        UnitState::Failed { .. } => "failed",
    }
}

fn print_report(report: &RunReport) {
    println!("testbed: {}", report.testbed);
    for phase in &report.phases {
        let ok = phase.units.iter().filter(|u| u.succeeded()).count();
        println!(
            "{}: {} ok, {} failed, {} skipped",
            phase.class,
            ok,
            phase.failed(),
            phase.skipped.len()
        );
        if let Some(leader) = &phase.leader {
            println!("  leader {}: {}", leader.host_id, state_label(&leader.state));
        }
        for unit in phase.units.iter().filter(|u| !u.succeeded()) {
            println!("  {} failed: {}", unit.host_id, unit.log_path.display());
        }
    }
}
