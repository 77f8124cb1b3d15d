//! Runs the client stream and the nemesis side by side and checks the result.
//!
//! The client stream issues one operation at a time and tracks recovery
//! online: it sets the [`StopSignal`] once the job has recovered from the most
//! recent fault, a recovery deadline was missed, or the fault-phase time
//! limit is up. The nemesis stops at the signal; the client keeps polling
//! until the last fault has been recovered from (or its deadline has passed)
//! and the nemesis has finished. A hard timeout bounds the whole run.

use std::collections::VecDeque;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, info, warn};

use crate::checker::{CheckReport, RecoveryChecker, RecoveryModel, RecoveryParams};
use crate::client::{FaultInjector, JobControl};
use crate::config::RunConfig;
use crate::error::{ConfigError, Error};
use crate::generator::{BoxGenerator, Generator, Step};
use crate::history::{Action, HealthSample, History, Operation, Process, RunClock, StreamLog};
use crate::nemesis::{FaultRegistry, FaultSchedule, FaultScheduler};
use crate::stop::StopSignal;

/// Extra time past the fault phase and grace period before a run is killed.
pub const RUN_TIMEOUT_SLACK: Duration = Duration::from_secs(60);

/// Everything a run needs, resolved and validated up front.
pub struct RunPlan {
    pub client_gen: BoxGenerator<Action>,
    pub fault_schedule: FaultSchedule,
    pub recovery: RecoveryParams,
    /// How long faults are injected before the stop signal is set.
    pub time_limit: Duration,
    /// Hard budget for the whole run; exceeding it fails with a timeout.
    pub run_timeout: Duration,
}

impl RunPlan {
    pub fn from_config(config: &RunConfig, faults: &FaultRegistry) -> Result<Self, ConfigError> {
        let factory = faults.resolve(&config.nemesis_gen)?;
        Ok(Self {
            client_gen: config.client_gen.build(config.poll_interval, config.cancel_after),
            fault_schedule: factory(&config.fault_params()),
            recovery: config.recovery,
            time_limit: config.time_limit,
            run_timeout: config
                .time_limit
                .saturating_add(config.recovery.grace_period)
                .saturating_add(config.poll_interval.saturating_mul(2))
                .saturating_add(RUN_TIMEOUT_SLACK),
        })
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    pub history: History,
    pub report: CheckReport,
    pub timed_out: bool,
    pub elapsed: Duration,
}

pub struct TestOrchestrator {
    plan: RunPlan,
}

impl TestOrchestrator {
    pub fn new(plan: RunPlan) -> Self {
        Self { plan }
    }

    pub async fn run<J, F>(self, job: &J, injector: &F) -> Result<RunOutcome, Error>
    where
        J: JobControl + ?Sized,
        F: FaultInjector + ?Sized,
    {
        let RunPlan {
            client_gen,
            fault_schedule,
            recovery,
            time_limit,
            run_timeout,
        } = self.plan;

        let stop = StopSignal::new();
        let clock = RunClock::start();
        let mut client_log = StreamLog::new();
        let mut nemesis_log = StreamLog::new();
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();

        let client = ClientStream {
            gen: client_gen,
            stop: stop.clone(),
            model: RecoveryModel::new(recovery),
            time_limit,
            faults: fault_rx,
            received: VecDeque::new(),
            nemesis_done: false,
        };
        let mut nemesis = FaultScheduler::new(fault_schedule, stop.clone());

        info!(
            time_limit_secs = time_limit.as_secs(),
            timeout_secs = run_timeout.as_secs(),
            "starting run"
        );
        let streams = async {
            let (client_result, ()) = tokio::join!(
                client.run(job, clock, &mut client_log),
                nemesis.run(injector, clock, &mut nemesis_log, fault_tx),
            );
            client_result
        };

        let result = tokio::time::timeout(run_timeout, streams).await;
        let timed_out = match result {
            Ok(result) => {
                result?;
                false
            }
            Err(_) => {
                stop.set_if_unset();
                warn!(
                    timeout_secs = run_timeout.as_secs(),
                    "run exceeded its time budget, streams terminated"
                );
                // The nemesis was dropped mid-schedule; revert what it left behind.
                let heal = nemesis.heal(injector, clock, &mut nemesis_log);
                if tokio::time::timeout(RUN_TIMEOUT_SLACK, heal).await.is_err() {
                    warn!(
                        outstanding = ?nemesis.outstanding(),
                        "reverting outstanding disruptions timed out"
                    );
                }
                true
            }
        };

        let elapsed = clock.elapsed();
        let history = History::merge(client_log, nemesis_log);
        let report = RecoveryChecker::new(recovery).check(&history);
        let report = if timed_out { report.timed_out() } else { report };
        info!(
            verdict = %report.verdict,
            ops = history.len(),
            faults = report.faults,
            elapsed_secs = elapsed.as_secs(),
            "run finished"
        );

        Ok(RunOutcome {
            history,
            report,
            timed_out,
            elapsed,
        })
    }
}

/// The sequential client side of a run.
struct ClientStream {
    gen: BoxGenerator<Action>,
    stop: StopSignal,
    model: RecoveryModel,
    time_limit: Duration,
    faults: mpsc::UnboundedReceiver<Operation>,
    /// Completion times of faults taken off the channel but not yet
    /// folded into the model.
    received: VecDeque<Duration>,
    nemesis_done: bool,
}

impl ClientStream {
    async fn run<J: JobControl + ?Sized>(
        mut self,
        job: &J,
        clock: RunClock,
        log: &mut StreamLog,
    ) -> Result<(), Error> {
        loop {
            self.drain_faults();
            let now = clock.elapsed();
            if now >= self.time_limit && self.stop.set_if_unset() {
                info!("time limit reached, stopping nemesis");
            }
            if self.settled() {
                break;
            }
            match self.gen.next(now) {
                Some(Step::Sleep(delay)) => tokio::time::sleep(delay).await,
                Some(Step::Invoke(action)) => self.invoke(action, job, clock, log).await?,
                None => {
                    debug!("client generator exhausted");
                    break;
                }
            }
        }
        self.gen.close();
        Ok(())
    }

    /// Nothing left to observe: the nemesis is stopped and done, and the
    /// job is not still inside a recovery window.
    fn settled(&self) -> bool {
        self.stop.is_set() && self.nemesis_done && !self.model.is_awaiting()
    }

    fn drain_faults(&mut self) {
        self.receive_faults();
        self.observe_faults_before(None);
    }

    fn receive_faults(&mut self) {
        loop {
            match self.faults.try_recv() {
                Ok(op) => self.received.push_back(op.time),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.nemesis_done = true;
                    break;
                }
            }
        }
    }

    /// Fold received faults into the model, stopping at the first one that
    /// did not complete strictly before `cutoff`. The merged history puts
    /// client records first on equal timestamps, so a fault stamped at the
    /// same instant as a client record is observed after it here too.
    fn observe_faults_before(&mut self, cutoff: Option<Duration>) {
        while let Some(&time) = self.received.front() {
            if cutoff.is_some_and(|cutoff| time >= cutoff) {
                break;
            }
            self.received.pop_front();
            self.model.observe_fault(time);
        }
    }

    fn observe_poll(&mut self, sample: HealthSample) {
        self.receive_faults();
        self.observe_faults_before(Some(sample.time));
        debug!(
            running = sample.running,
            streak = self.model.streak(),
            t = sample.time.as_secs_f64(),
            "job status"
        );
        self.model.observe_sample(sample);
        self.observe_faults_before(None);
    }

    async fn invoke<J: JobControl + ?Sized>(
        &mut self,
        action: Action,
        job: &J,
        clock: RunClock,
        log: &mut StreamLog,
    ) -> Result<(), Error> {
        log.push(Operation::invoke(Process::Client, action, clock.elapsed()));
        match action {
            Action::PollRunning => {
                let completion = match job.job_running().await {
                    Ok(running) => {
                        let value = Some(json!(running));
                        Operation::ok(Process::Client, action, clock.elapsed(), value)
                    }
                    Err(e) => {
                        warn!(error = %e, "job status poll failed");
                        Operation::fail(Process::Client, action, clock.elapsed(), e.to_string())
                    }
                };
                match completion.health_sample() {
                    Some(sample) => self.observe_poll(sample),
                    None => self.drain_faults(),
                }
                log.push(completion);

                if self.model.recovered_from_latest_fault() && self.stop.set_if_unset() {
                    info!("job recovered from the latest fault, stopping nemesis");
                }
                if self.model.is_violated() && self.stop.set_if_unset() {
                    warn!("recovery deadline missed, stopping nemesis");
                }
            }
            Action::Cancel => match job.cancel_job().await {
                Ok(()) => {
                    let now = clock.elapsed();
                    info!("job cancelled");
                    self.receive_faults();
                    self.observe_faults_before(Some(now));
                    self.model.observe_cancel(now);
                    self.observe_faults_before(None);
                    log.push(Operation::ok(Process::Client, action, now, None));
                }
                Err(e) => {
                    let now = clock.elapsed();
                    log.push(Operation::fail(Process::Client, action, now, e.to_string()));
                    self.stop.set_if_unset();
                    return Err(Error::CancelFailed(e));
                }
            },
            Action::Fault(fault) => {
                warn!(%fault, "client generator produced a fault, ignoring");
                log.push(Operation::fail(
                    Process::Client,
                    action,
                    clock.elapsed(),
                    "faults are injected by the nemesis",
                ));
            }
        }
        Ok(())
    }
}
