//! Operation records and the health evidence derived from them.
//!
//! Each stream (client and nemesis) appends to its own [`StreamLog`]; after the
//! run the two logs are merged by timestamp into a read-only [`History`].

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

/// Which stream issued an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Process {
    Client,
    Nemesis,
}

/// `Ok` and `Fail` are the two ways an `Invoke` completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpKind {
    Invoke,
    Ok,
    Fail,
}

impl OpKind {
    pub fn is_complete(self) -> bool {
        !matches!(self, OpKind::Invoke)
    }
}

/// Concrete disruptions a nemesis can apply to the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultAction {
    KillTaskManagers,
    KillSingleTaskManager,
    KillRandomTaskManagers,
    KillJobManagers,
    StopNameNode,
    StartNameNode,
    StartPartition,
    StopPartition,
}

impl FaultAction {
    pub fn name(self) -> &'static str {
        match self {
            FaultAction::KillTaskManagers => "kill-task-managers",
            FaultAction::KillSingleTaskManager => "kill-single-task-manager",
            FaultAction::KillRandomTaskManagers => "kill-random-task-managers",
            FaultAction::KillJobManagers => "kill-job-managers",
            FaultAction::StopNameNode => "stop-name-node",
            FaultAction::StartNameNode => "start-name-node",
            FaultAction::StartPartition => "start-partition",
            FaultAction::StopPartition => "stop-partition",
        }
    }

    /// The action that undoes this one, for disruptions that persist until
    /// reverted. Kills need no undo; the cluster restarts what was killed.
    pub fn undo(self) -> Option<FaultAction> {
        match self {
            FaultAction::StartPartition => Some(FaultAction::StopPartition),
            FaultAction::StopNameNode => Some(FaultAction::StartNameNode),
            _ => None,
        }
    }
}

impl fmt::Display for FaultAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    PollRunning,
    Cancel,
    Fault(FaultAction),
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::PollRunning => f.write_str("poll-job-running"),
            Action::Cancel => f.write_str("cancel-job"),
            Action::Fault(fault) => fault.fmt(f),
        }
    }
}

/// One entry in a run history. Times are offsets from the start of the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Operation {
    pub process: Process,
    pub kind: OpKind,
    pub action: Action,
    pub time: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Operation {
    pub fn invoke(process: Process, action: Action, time: Duration) -> Self {
        Self {
            process,
            kind: OpKind::Invoke,
            action,
            time,
            value: None,
            error: None,
        }
    }

    pub fn ok(process: Process, action: Action, time: Duration, value: Option<Value>) -> Self {
        Self {
            kind: OpKind::Ok,
            value,
            ..Self::invoke(process, action, time)
        }
    }

    pub fn fail(
        process: Process,
        action: Action,
        time: Duration,
        error: impl Into<String>,
    ) -> Self {
        Self {
            kind: OpKind::Fail,
            error: Some(error.into()),
            ..Self::invoke(process, action, time)
        }
    }

    /// The health evidence carried by a completed poll, if this is one.
    ///
    /// A failed poll counts as "not running": an unreachable job API is
    /// exactly the kind of unhealthiness the run is looking for.
    pub fn health_sample(&self) -> Option<HealthSample> {
        if self.action != Action::PollRunning {
            return None;
        }
        let running = match self.kind {
            OpKind::Invoke => return None,
            OpKind::Ok => self.value.as_ref().and_then(Value::as_bool).unwrap_or(false),
            OpKind::Fail => false,
        };
        Some(HealthSample {
            time: self.time,
            running,
        })
    }

    pub fn is_fault_completion(&self) -> bool {
        matches!(self.action, Action::Fault(_)) && self.kind.is_complete()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthSample {
    pub time: Duration,
    pub running: bool,
}

/// Consecutive `running = true` samples up to the most recent one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthyStreak {
    count: u32,
}

impl HealthyStreak {
    /// Fold one sample into the streak and return the new length.
    pub fn record(&mut self, running: bool) -> u32 {
        self.count = if running { self.count + 1 } else { 0 };
        self.count
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// Monotonic clock shared by both streams so their records merge cleanly.
#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    started: Instant,
}

impl RunClock {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Append-only log owned by a single stream.
#[derive(Debug, Default)]
pub struct StreamLog {
    ops: Vec<Operation>,
}

impl StreamLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: Operation) {
        self.ops.push(op);
    }

    pub fn last(&self) -> Option<&Operation> {
        self.ops.last()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<Operation> {
        self.ops
    }
}

/// The combined, time-ordered record of a run.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct History {
    ops: Vec<Operation>,
}

impl History {
    /// Merge per-stream logs by timestamp. Ties keep the client record first.
    pub fn merge(client: StreamLog, nemesis: StreamLog) -> Self {
        let mut ops = client.into_ops();
        ops.extend(nemesis.into_ops());
        ops.sort_by_key(|op| op.time);
        Self { ops }
    }

    pub fn from_ops(mut ops: Vec<Operation>) -> Self {
        ops.sort_by_key(|op| op.time);
        Self { ops }
    }

    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn health_samples(&self) -> impl Iterator<Item = HealthSample> + '_ {
        self.ops.iter().filter_map(Operation::health_sample)
    }

    pub fn fault_completions(&self) -> impl Iterator<Item = &Operation> + '_ {
        self.ops.iter().filter(|op| op.is_fault_completion())
    }

    /// True when every invocation has a completion. Streams keep at most one
    /// operation outstanding, so counting per process is enough.
    pub fn is_complete(&self) -> bool {
        [Process::Client, Process::Nemesis].iter().all(|process| {
            let mine = self.ops.iter().filter(|op| op.process == *process);
            let (invokes, completions) = mine.fold((0usize, 0usize), |(i, c), op| {
                if op.kind.is_complete() {
                    (i, c + 1)
                } else {
                    (i + 1, c)
                }
            });
            invokes == completions
        })
    }

    pub fn end_time(&self) -> Option<Duration> {
        self.ops.last().map(|op| op.time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn streak_resets_on_unhealthy_sample() {
        let mut streak = HealthyStreak::default();
        assert_eq!(streak.record(true), 1);
        assert_eq!(streak.record(true), 2);
        assert_eq!(streak.record(false), 0);
        assert_eq!(streak.record(true), 1);
        assert_eq!(streak.count(), 1);
    }

    #[test]
    fn failed_poll_counts_as_not_running() {
        let op = Operation::fail(
            Process::Client,
            Action::PollRunning,
            secs(3),
            "connection refused",
        );
        assert_eq!(
            op.health_sample(),
            Some(HealthSample {
                time: secs(3),
                running: false
            })
        );

        let invoke = Operation::invoke(Process::Client, Action::PollRunning, secs(3));
        assert_eq!(invoke.health_sample(), None);
    }

    #[test]
    fn merge_orders_streams_by_time() {
        let mut client = StreamLog::new();
        client.push(Operation::invoke(Process::Client, Action::PollRunning, secs(0)));
        client.push(Operation::ok(
            Process::Client,
            Action::PollRunning,
            secs(2),
            Some(json!(true)),
        ));
        let mut nemesis = StreamLog::new();
        let kill = Action::Fault(FaultAction::KillTaskManagers);
        nemesis.push(Operation::invoke(Process::Nemesis, kill, secs(1)));
        nemesis.push(Operation::ok(Process::Nemesis, kill, secs(2), None));

        let history = History::merge(client, nemesis);
        let times: Vec<u64> = history.ops().iter().map(|op| op.time.as_secs()).collect();
        assert_eq!(times, vec![0, 1, 2, 2]);
        assert_eq!(history.ops()[2].process, Process::Client);
        assert_eq!(history.fault_completions().count(), 1);
        assert!(history.is_complete());
    }

    #[test]
    fn dangling_invoke_marks_history_incomplete() {
        let history = History::from_ops(vec![
            Operation::invoke(Process::Client, Action::PollRunning, secs(0)),
            Operation::ok(Process::Client, Action::PollRunning, secs(1), Some(json!(true))),
            Operation::invoke(Process::Client, Action::PollRunning, secs(6)),
        ]);
        assert!(!history.is_complete());
        assert_eq!(history.end_time(), Some(secs(6)));
    }

    #[test]
    fn persistent_disruptions_have_an_undo() {
        assert_eq!(FaultAction::StartPartition.undo(), Some(FaultAction::StopPartition));
        assert_eq!(FaultAction::StopNameNode.undo(), Some(FaultAction::StartNameNode));
        assert_eq!(FaultAction::KillJobManagers.undo(), None);
        assert_eq!(FaultAction::StopPartition.undo(), None);
    }

    #[test]
    fn actions_serialize_by_name() {
        let op = Operation::ok(
            Process::Nemesis,
            Action::Fault(FaultAction::KillJobManagers),
            secs(4),
            None,
        );
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["action"], json!({"fault": "kill-job-managers"}));
        assert_eq!(value["kind"], json!("ok"));
        assert!(value.get("error").is_none());
    }
}
