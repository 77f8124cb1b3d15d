//! Recovery model: did the job get back to a healthy running state within the
//! grace period after every fault?
//!
//! [`RecoveryModel`] is the incremental state machine; the orchestrator feeds
//! it online to decide when to stop the nemesis, and [`RecoveryChecker`]
//! replays a finished [`History`] through it to produce the [`Verdict`].

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::history::{Action, HealthSample, HealthyStreak, History, OpKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecoveryParams {
    /// Consecutive healthy polls that count as recovered.
    pub healthy_threshold: u32,
    pub grace_period: Duration,
}

/// `[fault_end, deadline)`, the span in which the job has to recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Window {
    pub fault_end: Duration,
    pub deadline: Duration,
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:.1}s, {:.1}s)",
            self.fault_end.as_secs_f64(),
            self.deadline.as_secs_f64()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Idle,
    AwaitingRecovery {
        window: Window,
        /// Healthy polls since the fault, reset by any unhealthy one.
        healthy_since_fault: u32,
    },
    /// Recovered from the latest fault; behaves as `Idle` for the next event.
    Satisfied { window: Window, recovered_at: Duration },
    Violated { window: Window },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "outcome")]
pub enum RecoveryOutcome {
    Recovered { at: Duration },
    /// A newer fault took over before this one was recovered from.
    Superseded,
    /// The job was cancelled, so it is no longer expected to run.
    Cancelled,
    Violated,
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecoveryRecord {
    pub window: Window,
    #[serde(flatten)]
    pub outcome: RecoveryOutcome,
}

impl RecoveryRecord {
    pub fn recovery_time(&self) -> Option<Duration> {
        match self.outcome {
            RecoveryOutcome::Recovered { at } => Some(at.saturating_sub(self.window.fault_end)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryModel {
    params: RecoveryParams,
    state: RecoveryState,
    streak: HealthyStreak,
    cancelled: bool,
    records: Vec<RecoveryRecord>,
}

impl RecoveryModel {
    pub fn new(params: RecoveryParams) -> Self {
        Self {
            params,
            state: RecoveryState::Idle,
            streak: HealthyStreak::default(),
            cancelled: false,
            records: Vec::new(),
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    pub fn streak(&self) -> u32 {
        self.streak.count()
    }

    pub fn records(&self) -> &[RecoveryRecord] {
        &self.records
    }

    pub fn faults_seen(&self) -> usize {
        self.records.len()
    }

    pub fn is_violated(&self) -> bool {
        matches!(self.state, RecoveryState::Violated { .. })
    }

    /// Still waiting on the job to recover from the latest fault.
    pub fn is_awaiting(&self) -> bool {
        matches!(self.state, RecoveryState::AwaitingRecovery { .. })
    }

    /// Recovered from the most recent fault, with at least one fault seen.
    pub fn recovered_from_latest_fault(&self) -> bool {
        matches!(self.state, RecoveryState::Satisfied { .. })
    }

    /// A fault finished at `end`. The latest fault's deadline governs.
    pub fn observe_fault(&mut self, end: Duration) {
        if self.is_violated() {
            return;
        }
        if let RecoveryState::AwaitingRecovery { window, .. } = self.state {
            if end >= window.deadline {
                self.violate(window);
                return;
            }
            self.close_pending(RecoveryOutcome::Superseded);
        }

        let window = Window {
            fault_end: end,
            deadline: end.saturating_add(self.params.grace_period),
        };
        if self.cancelled {
            self.records.push(RecoveryRecord {
                window,
                outcome: RecoveryOutcome::Cancelled,
            });
            return;
        }
        self.records.push(RecoveryRecord {
            window,
            outcome: RecoveryOutcome::Pending,
        });
        self.state = RecoveryState::AwaitingRecovery {
            window,
            healthy_since_fault: 0,
        };
    }

    pub fn observe_sample(&mut self, sample: HealthSample) {
        self.streak.record(sample.running);
        let RecoveryState::AwaitingRecovery {
            window,
            healthy_since_fault,
        } = self.state
        else {
            return;
        };

        if sample.time >= window.deadline {
            self.violate(window);
            return;
        }
        let healthy_since_fault = if sample.running {
            healthy_since_fault + 1
        } else {
            0
        };
        if healthy_since_fault >= self.params.healthy_threshold {
            self.close_pending(RecoveryOutcome::Recovered { at: sample.time });
            self.state = RecoveryState::Satisfied {
                window,
                recovered_at: sample.time,
            };
        } else {
            self.state = RecoveryState::AwaitingRecovery {
                window,
                healthy_since_fault,
            };
        }
    }

    /// The job was cancelled at `time`; pending and later faults stop counting.
    pub fn observe_cancel(&mut self, time: Duration) {
        if let RecoveryState::AwaitingRecovery { window, .. } = self.state {
            if time >= window.deadline {
                self.violate(window);
                return;
            }
            self.close_pending(RecoveryOutcome::Cancelled);
            self.state = RecoveryState::Idle;
        }
        self.cancelled = true;
    }

    /// Close the model at the end of the history. A fault still awaiting
    /// recovery counts as a violation: the job was never seen to come back.
    pub fn finish(&mut self) {
        if let RecoveryState::AwaitingRecovery { window, .. } = self.state {
            self.violate(window);
        }
    }

    /// The window still awaiting recovery, or the one that was violated.
    pub fn open_window(&self) -> Option<Window> {
        match self.state {
            RecoveryState::AwaitingRecovery { window, .. } | RecoveryState::Violated { window } => {
                Some(window)
            }
            _ => None,
        }
    }

    fn violate(&mut self, window: Window) {
        self.close_pending(RecoveryOutcome::Violated);
        self.state = RecoveryState::Violated { window };
    }

    fn close_pending(&mut self, outcome: RecoveryOutcome) {
        if let Some(record) = self
            .records
            .iter_mut()
            .rev()
            .find(|r| r.outcome == RecoveryOutcome::Pending)
        {
            record.outcome = outcome;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailReason {
    /// The job did not reach the healthy threshold before the deadline.
    RecoveryViolated,
    /// The history ended while the job was still recovering.
    HistoryEndedBeforeRecovery,
    NoHealthSamples,
    Timeout,
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            FailReason::RecoveryViolated => "job did not recover within the grace period",
            FailReason::HistoryEndedBeforeRecovery => "history ended before the job recovered",
            FailReason::NoHealthSamples => "no completed job status polls",
            FailReason::Timeout => "timeout",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "result")]
pub enum Verdict {
    Pass,
    Fail {
        reason: FailReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        window: Option<Window>,
    },
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => f.write_str("PASS"),
            Verdict::Fail {
                reason,
                window: Some(window),
            } => write!(f, "FAIL: {reason} (window {window})"),
            Verdict::Fail { reason, window: None } => write!(f, "FAIL: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub verdict: Verdict,
    pub faults: usize,
    pub health_samples: usize,
    pub healthy_samples: usize,
    pub recoveries: Vec<RecoveryRecord>,
    pub longest_recovery: Option<Duration>,
    /// Every invocation in the history has a completion.
    pub complete: bool,
}

impl CheckReport {
    /// Replace the verdict with a timeout failure, keeping the open window.
    pub fn timed_out(mut self) -> Self {
        let window = self
            .recoveries
            .iter()
            .rev()
            .find(|r| matches!(r.outcome, RecoveryOutcome::Pending | RecoveryOutcome::Violated))
            .map(|r| r.window);
        self.verdict = Verdict::Fail {
            reason: FailReason::Timeout,
            window,
        };
        self
    }
}

/// Turns a finished history into a verdict.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryChecker {
    params: RecoveryParams,
}

impl RecoveryChecker {
    pub fn new(params: RecoveryParams) -> Self {
        Self { params }
    }

    pub fn check(&self, history: &History) -> CheckReport {
        let mut model = RecoveryModel::new(self.params);
        let mut health_samples = 0usize;
        let mut healthy_samples = 0usize;

        for op in history.ops() {
            if op.is_fault_completion() {
                model.observe_fault(op.time);
            } else if let Some(sample) = op.health_sample() {
                health_samples += 1;
                if sample.running {
                    healthy_samples += 1;
                }
                model.observe_sample(sample);
            } else if op.action == Action::Cancel && op.kind == OpKind::Ok {
                model.observe_cancel(op.time);
            }
        }

        let ended_early = match (model.open_window(), history.end_time()) {
            (Some(window), Some(end)) => model.is_awaiting() && end < window.deadline,
            _ => false,
        };
        model.finish();

        let verdict = match model.state() {
            RecoveryState::Violated { window } => Verdict::Fail {
                reason: if ended_early {
                    FailReason::HistoryEndedBeforeRecovery
                } else {
                    FailReason::RecoveryViolated
                },
                window: Some(window),
            },
            _ if health_samples == 0 => Verdict::Fail {
                reason: FailReason::NoHealthSamples,
                window: None,
            },
            _ => Verdict::Pass,
        };

        let recoveries = model.records().to_vec();
        let longest_recovery = recoveries.iter().filter_map(RecoveryRecord::recovery_time).max();
        CheckReport {
            verdict,
            faults: recoveries.len(),
            health_samples,
            healthy_samples,
            recoveries,
            longest_recovery,
            complete: history.is_complete(),
        }
    }
}
