//! Fault schedules, the registry that names them, and the scheduler that
//! plays one against the cluster until told to stop.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::FaultInjector;
use crate::error::ConfigError;
use crate::generator::{BoxGenerator, Chain, Generator, Once, Pause, Repeat, Step};
use crate::history::{Action, FaultAction, Operation, Process, RunClock, StreamLog};
use crate::stop::StopSignal;

pub const DEFAULT_NEMESIS_GEN: &str = "kill-task-managers";

/// Knobs a fault schedule is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultParams {
    pub healthy_threshold: u32,
    pub grace_period: Duration,
    pub poll_interval: Duration,
}

impl FaultParams {
    /// Time needed to observe a full healthy streak; used as the pause
    /// between disruptions so recovery gets a chance to be seen.
    pub fn observation_pause(&self) -> Duration {
        self.poll_interval.saturating_mul(self.healthy_threshold)
    }
}

pub type FaultSchedule = BoxGenerator<FaultAction>;
pub type FaultScheduleFactory = fn(&FaultParams) -> FaultSchedule;

/// Named fault strategies. Lookups fail fast with the list of valid names.
pub struct FaultRegistry {
    factories: BTreeMap<&'static str, FaultScheduleFactory>,
}

impl FaultRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("kill-task-managers", |p| {
            periodic(p.observation_pause(), FaultAction::KillTaskManagers)
        });
        registry.register("kill-single-task-manager", |p| {
            periodic(p.observation_pause(), FaultAction::KillSingleTaskManager)
        });
        registry.register("kill-random-task-managers", |p| {
            periodic(p.observation_pause(), FaultAction::KillRandomTaskManagers)
        });
        registry.register("kill-job-managers", |p| {
            periodic(p.observation_pause(), FaultAction::KillJobManagers)
        });
        registry.register("network-partition", network_partition);
        registry.register("fail-name-node-during-recovery", fail_name_node_during_recovery);
        registry.register("utopia", utopia);
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: FaultScheduleFactory) {
        self.factories.insert(name, factory);
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().map(|name| name.to_string()).collect()
    }

    pub fn resolve(&self, name: &str) -> Result<FaultScheduleFactory, ConfigError> {
        self.factories
            .get(name)
            .copied()
            .ok_or_else(|| ConfigError::UnknownFaultGenerator {
                name: name.to_string(),
                valid: self.names(),
            })
    }
}

fn pause(duration: Duration) -> FaultSchedule {
    Box::new(Pause::<FaultAction>::new(duration))
}

fn inject(fault: FaultAction) -> FaultSchedule {
    Box::new(Once::new(fault))
}

/// `pause, fault, pause, fault, ...` forever.
fn periodic(every: Duration, fault: FaultAction) -> FaultSchedule {
    Box::new(Repeat::forever(Chain::new(vec![pause(every), inject(fault)])))
}

fn network_partition(params: &FaultParams) -> FaultSchedule {
    let every = params.observation_pause();
    Box::new(Repeat::forever(Chain::new(vec![
        pause(every),
        inject(FaultAction::StartPartition),
        pause(every),
        inject(FaultAction::StopPartition),
    ])))
}

fn utopia(_: &FaultParams) -> FaultSchedule {
    Box::new(Chain::<FaultAction>::new(Vec::new()))
}

/// Kill the job managers, then take HDFS away while the job is restoring
/// from its checkpoint, and bring it back halfway through the grace period.
fn fail_name_node_during_recovery(params: &FaultParams) -> FaultSchedule {
    Box::new(Chain::new(vec![
        pause(params.observation_pause()),
        inject(FaultAction::KillJobManagers),
        pause(params.poll_interval),
        inject(FaultAction::StopNameNode),
        pause(params.grace_period / 2),
        inject(FaultAction::StartNameNode),
    ]))
}

/// Plays a fault schedule until it runs dry or the stop signal is set.
///
/// Disruptions that persist until reverted (a partition, a stopped name node)
/// are remembered until their undo runs. Stopping never skips an undo: the
/// scheduler applies every outstanding one before it returns.
pub struct FaultScheduler {
    schedule: FaultSchedule,
    stop: StopSignal,
    outstanding: Vec<FaultAction>,
    injected: usize,
}

impl FaultScheduler {
    pub fn new(schedule: FaultSchedule, stop: StopSignal) -> Self {
        Self {
            schedule,
            stop,
            outstanding: Vec::new(),
            injected: 0,
        }
    }

    /// Undo actions for disruptions that have been applied but not reverted.
    pub fn outstanding(&self) -> &[FaultAction] {
        &self.outstanding
    }

    /// Each completed fault is appended to `log` and sent on `completions`
    /// so the client side can track recovery deadlines. Dropping the sender
    /// on return tells the client side the nemesis is done.
    pub async fn run<F: FaultInjector + ?Sized>(
        &mut self,
        injector: &F,
        clock: RunClock,
        log: &mut StreamLog,
        completions: mpsc::UnboundedSender<Operation>,
    ) {
        loop {
            if self.stop.is_set() {
                break;
            }
            match self.schedule.next(clock.elapsed()) {
                Some(Step::Sleep(delay)) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.stop.wait() => break,
                    }
                }
                Some(Step::Invoke(fault)) => {
                    // Re-check: the flag may have flipped while we were busy.
                    if self.stop.is_set() {
                        break;
                    }
                    let completion = self.apply(fault, injector, clock, log).await;
                    let _ = completions.send(completion);
                }
                None => {
                    debug!("fault schedule exhausted");
                    break;
                }
            }
        }
        self.schedule.close();
        for completion in self.heal(injector, clock, log).await {
            let _ = completions.send(completion);
        }
        info!(
            injected = self.injected,
            stopped = self.stop.is_set(),
            "nemesis finished"
        );
    }

    /// Revert every outstanding disruption, most recent first, and return
    /// the completions. Used on the way out of [`run`](Self::run), and by the
    /// orchestrator when a timeout dropped the run mid-schedule.
    pub async fn heal<F: FaultInjector + ?Sized>(
        &mut self,
        injector: &F,
        clock: RunClock,
        log: &mut StreamLog,
    ) -> Vec<Operation> {
        let mut completions = Vec::new();
        while let Some(undo) = self.outstanding.last().copied() {
            info!(fault = %undo, "reverting outstanding disruption");
            completions.push(self.apply(undo, injector, clock, log).await);
        }
        completions
    }

    async fn apply<F: FaultInjector + ?Sized>(
        &mut self,
        fault: FaultAction,
        injector: &F,
        clock: RunClock,
        log: &mut StreamLog,
    ) -> Operation {
        let action = Action::Fault(fault);
        info!(%fault, "injecting fault");
        log.push(Operation::invoke(Process::Nemesis, action, clock.elapsed()));
        let completion = match injector.inject(fault).await {
            Ok(()) => Operation::ok(Process::Nemesis, action, clock.elapsed(), None),
            Err(e) => {
                warn!(%fault, error = %e, "fault injection failed");
                Operation::fail(Process::Nemesis, action, clock.elapsed(), e.to_string())
            }
        };
        log.push(completion.clone());
        self.injected += 1;

        // A failed disruption may still have partly applied, so its undo is
        // owed either way. An undo is attempted once.
        self.outstanding.retain(|pending| *pending != fault);
        if let Some(undo) = fault.undo() {
            if !self.outstanding.contains(&undo) {
                self.outstanding.push(undo);
            }
        }
        completion
    }
}
