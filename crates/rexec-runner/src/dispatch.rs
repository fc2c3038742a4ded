use std::net::TcpStream;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::error::RexecError;
use crate::exec::{Execute, ExecutionUnit, Outcome};
use crate::logs::CommandClass;

const PORT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Delay, optionally preceded by a wait for the leader's port. Neither wait has a deadline.
#[derive(Debug, Clone)]
pub struct StartupBarrier {
    pub delay: Duration,
    pub port: Option<u16>,
}

impl StartupBarrier {
    pub fn delay(delay: Duration) -> Self {
        Self { delay, port: None }
    }

    pub fn wait(&self, hostname: &str) {
        if let Some(port) = self.port {
            info!("waiting for leader {}:{} to accept connections", hostname, port);
            while TcpStream::connect((hostname, port)).is_err() {
                thread::sleep(PORT_POLL_INTERVAL);
            }
        }
        if !self.delay.is_zero() {
            debug!("leader grace delay {:?}", self.delay);
            thread::sleep(self.delay);
        }
    }
}

#[derive(Debug, Clone)]
pub struct LeaderStep {
    pub unit: ExecutionUnit,
    pub barrier: StartupBarrier,
}

#[derive(Debug, Clone)]
pub struct Phase {
    pub class: CommandClass,
    pub leader: Option<LeaderStep>,
    pub units: Vec<ExecutionUnit>,
    pub skipped: Vec<String>,
}

impl Phase {
    pub fn new(class: CommandClass, units: Vec<ExecutionUnit>) -> Self {
        Self {
            class,
            leader: None,
            units,
            skipped: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Pending,
    Running,
    Succeeded,
    Failed { exit_code: Option<i32> },
}

impl UnitState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitState::Succeeded | UnitState::Failed { .. })
    }
}

impl From<Outcome> for UnitState {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => UnitState::Succeeded,
            Outcome::Failure { exit_code } => UnitState::Failed { exit_code },
        }
    }
}

#[derive(Debug, Clone)]
pub struct UnitReport {
    pub host_id: String,
    pub hostname: String,
    pub class: CommandClass,
    pub log_path: PathBuf,
    pub state: UnitState,
    pub launched_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl UnitReport {
    pub fn succeeded(&self) -> bool {
        self.state == UnitState::Succeeded
    }

    pub fn error(&self) -> Option<RexecError> {
        match self.state {
            UnitState::Failed { exit_code } => Some(match self.class {
                CommandClass::Sync => RexecError::SyncFailed {
                    host: self.host_id.clone(),
                },
                _ => RexecError::RemoteCommandFailed {
                    host: self.host_id.clone(),
                    exit_code,
                },
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub class: CommandClass,
    pub leader: Option<UnitReport>,
    pub units: Vec<UnitReport>,
    pub skipped: Vec<String>,
}

impl PhaseReport {
    pub fn failed(&self) -> usize {
        self.units.iter().filter(|u| !u.succeeded()).count()
            + self.leader.iter().filter(|u| !u.succeeded()).count()
    }
}

pub struct Dispatcher<E> {
    executor: E,
}

impl<E: Execute> Dispatcher<E> {
    pub fn new(executor: E) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn dispatch_all(&self, phase: &Phase) -> PhaseReport {
        let leader = phase.leader.as_ref().map(|step| {
            info!("running leader command on {}", step.unit.host_id);
            self.run_unit(&step.unit)
        });
        let leader_id = phase.leader.as_ref().map(|step| step.unit.host_id.as_str());

        let units: Vec<Option<UnitReport>> = thread::scope(|s| {
            let mut handles = Vec::with_capacity(phase.units.len());
            let (first, rest): (Vec<_>, Vec<_>) = phase
                .units
                .iter()
                .enumerate()
                .partition(|(_, u)| Some(u.host_id.as_str()) == leader_id);
            for (idx, unit) in first {
                handles.push((idx, unit, s.spawn(move || self.run_unit(unit))));
            }
            if let Some(step) = &phase.leader {
                step.barrier.wait(&step.unit.hostname);
            }
            for (idx, unit) in rest {
                handles.push((idx, unit, s.spawn(move || self.run_unit(unit))));
            }

            let mut out: Vec<Option<UnitReport>> = vec![None; phase.units.len()];
            for (idx, unit, handle) in handles {
                debug!("joining host: {}", unit.host_id);
                let report = handle.join().unwrap_or_else(|_| {
                    error!("execution thread for {} panicked", unit.host_id);
                    let now = Utc::now();
                    report_for(unit, UnitState::Failed { exit_code: None }, now, now)
                });
                out[idx] = Some(report);
            }
            out
        });

        PhaseReport {
            class: phase.class.clone(),
            leader,
            units: units.into_iter().flatten().collect(),
            skipped: phase.skipped.clone(),
        }
    }

    fn run_unit(&self, unit: &ExecutionUnit) -> UnitReport {
        debug!(host = %unit.host_id, class = %unit.class, "launching: {}", unit.command);
        let launched_at = Utc::now();
        let state = match self.executor.execute(unit) {
            Ok(outcome) => outcome.into(),
            Err(err) => {
                error!(host = %unit.host_id, "failed to execute: {}", err);
                UnitState::Failed { exit_code: None }
            }
        };
        let report = report_for(unit, state, launched_at, Utc::now());
        if let Some(err) = report.error() {
            error!("{}; check logs: {}", err, report.log_path.display());
        }
        report
    }
}

fn report_for(
    unit: &ExecutionUnit,
    state: UnitState,
    launched_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
) -> UnitReport {
    UnitReport {
        host_id: unit.host_id.clone(),
        hostname: unit.hostname.clone(),
        class: unit.class.clone(),
        log_path: unit.log_path.clone(),
        state,
        launched_at,
        finished_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::exec::Target;
    use std::collections::BTreeMap;
    use std::net::TcpListener;
    use std::sync::{Barrier, Mutex};
    use std::time::Instant;

    #[derive(Default)]
    struct Recording {
        started: Mutex<BTreeMap<String, Instant>>,
        finished: Mutex<BTreeMap<String, Instant>>,
    }

    impl Execute for Recording {
        fn execute(&self, unit: &ExecutionUnit) -> Result<Outcome> {
            let key = format!("{}:{}", unit.class, unit.host_id);
            self.started
                .lock()
                .expect("lock")
                .insert(key.clone(), Instant::now());
            thread::sleep(Duration::from_millis(20));
            let outcome = if unit.command.starts_with("fail") {
                Outcome::Failure { exit_code: Some(1) }
            } else {
                Outcome::Success
            };
            self.finished.lock().expect("lock").insert(key, Instant::now());
            Ok(outcome)
        }
    }

    fn unit(class: CommandClass, host_id: &str, command: &str) -> ExecutionUnit {
        ExecutionUnit {
            host_id: host_id.to_string(),
            hostname: format!("{}.example.net", host_id),
            class: class.clone(),
            target: Target::Remote,
            command: command.to_string(),
            log_path: PathBuf::from(format!("/tmp/{}/{}.log", class, host_id)),
            local_dirs: Vec::new(),
        }
    }

    fn exp() -> CommandClass {
        CommandClass::Experiment("bench".to_string())
    }

    #[test]
    fn leader_command_completes_before_followers_launch() {
        let delay = Duration::from_millis(50);
        let mut phase = Phase::new(
            exp(),
            vec![
                unit(exp(), "f1", "run"),
                unit(exp(), "l", "run"),
                unit(exp(), "f2", "run"),
            ],
        );
        phase.leader = Some(LeaderStep {
            unit: unit(CommandClass::Leader, "l", "reset"),
            barrier: StartupBarrier::delay(delay),
        });

        let dispatcher = Dispatcher::new(Recording::default());
        let report = dispatcher.dispatch_all(&phase);
        assert!(report.leader.as_ref().expect("leader report").succeeded());
        assert_eq!(report.failed(), 0);

        let started = dispatcher.executor().started.lock().expect("lock").clone();
        let finished = dispatcher.executor().finished.lock().expect("lock").clone();
        let leader_done = finished["leader:l"];
        assert!(started["bench:l"] >= leader_done);
        for follower in ["bench:f1", "bench:f2"] {
            assert!(started[follower] > leader_done, "{} launched too early", follower);
            assert!(
                started[follower].duration_since(leader_done) >= delay,
                "{} launched before the grace delay",
                follower
            );
        }
        let launched_after = report
            .units
            .iter()
            .filter(|u| u.host_id != "l")
            .all(|u| u.launched_at > report.leader.as_ref().expect("leader").finished_at);
        assert!(launched_after);
    }

    #[test]
    fn reports_keep_unit_order_and_all_units_join() {
        let phase = Phase::new(
            CommandClass::Cmd,
            vec![
                unit(CommandClass::Cmd, "a", "run"),
                unit(CommandClass::Cmd, "b", "run"),
                unit(CommandClass::Cmd, "c", "run"),
            ],
        );
        let dispatcher = Dispatcher::new(Recording::default());
        let report = dispatcher.dispatch_all(&phase);
        let ids: Vec<&str> = report.units.iter().map(|u| u.host_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(report.units.iter().all(|u| u.state.is_terminal()));
        assert_eq!(dispatcher.executor().finished.lock().expect("lock").len(), 3);
    }

    #[test]
    fn failure_on_one_host_does_not_stop_the_others() {
        let phase = Phase::new(
            CommandClass::Sync,
            vec![
                unit(CommandClass::Sync, "a", "run"),
                unit(CommandClass::Sync, "b", "fail now"),
                unit(CommandClass::Sync, "c", "run"),
            ],
        );
        let report = Dispatcher::new(Recording::default()).dispatch_all(&phase);
        assert_eq!(report.failed(), 1);
        let b = &report.units[1];
        assert_eq!(b.state, UnitState::Failed { exit_code: Some(1) });
        assert!(matches!(b.error(), Some(RexecError::SyncFailed { ref host }) if host == "b"));
        assert!(report.units[0].succeeded());
        assert!(report.units[2].succeeded());
    }

    #[test]
    fn followers_wait_for_leader_port_then_delay() {
        let delay = Duration::from_millis(30);
        let port = {
            let probe = TcpListener::bind("127.0.0.1:0").expect("bind");
            probe.local_addr().expect("addr").port()
        };
        let listener = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            let at = Instant::now();
            let l = TcpListener::bind(("127.0.0.1", port)).expect("bind leader port");
            (l, at)
        });

        let mut leader = unit(CommandClass::Leader, "l", "reset");
        leader.hostname = "127.0.0.1".to_string();
        let mut phase = Phase::new(
            exp(),
            vec![unit(exp(), "f1", "run"), unit(exp(), "f2", "run")],
        );
        phase.leader = Some(LeaderStep {
            unit: leader,
            barrier: StartupBarrier {
                delay,
                port: Some(port),
            },
        });

        let dispatcher = Dispatcher::new(Recording::default());
        let report = dispatcher.dispatch_all(&phase);
        let (_listener, bound_at) = listener.join().expect("listener thread");
        assert_eq!(report.failed(), 0);

        let started = dispatcher.executor().started.lock().expect("lock").clone();
        for follower in ["bench:f1", "bench:f2"] {
            assert!(
                started[follower].duration_since(bound_at) >= delay,
                "{} launched before the port opened plus the delay",
                follower
            );
        }
    }

    struct Rendezvous(Barrier);

    impl Execute for Rendezvous {
        fn execute(&self, _unit: &ExecutionUnit) -> Result<Outcome> {
            self.0.wait();
            Ok(Outcome::Success)
        }
    }

    #[test]
    fn units_run_concurrently() {
        let phase = Phase::new(
            CommandClass::Cmd,
            (0..4)
                .map(|i| unit(CommandClass::Cmd, &format!("n{}", i), "run"))
                .collect(),
        );
        let report = Dispatcher::new(Rendezvous(Barrier::new(4))).dispatch_all(&phase);
        assert_eq!(report.units.len(), 4);
        assert_eq!(report.failed(), 0);
    }

    #[test]
    fn executor_errors_become_failed_units() {
        struct Broken;
        impl Execute for Broken {
            fn execute(&self, _unit: &ExecutionUnit) -> Result<Outcome> {
                Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "log dir").into())
            }
        }
        let phase = Phase::new(CommandClass::Cmd, vec![unit(CommandClass::Cmd, "a", "run")]);
        let report = Dispatcher::new(Broken).dispatch_all(&phase);
        assert_eq!(report.units[0].state, UnitState::Failed { exit_code: None });
        assert!(matches!(
            report.units[0].error(),
            Some(RexecError::RemoteCommandFailed { exit_code: None, .. })
        ));
    }
}
