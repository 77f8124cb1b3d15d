//! Restartable operation sequences and the combinators that compose them.
//!
//! A [`Generator`] is pulled by a single executor: each call to
//! [`Generator::next`] yields either an action to invoke or a pause to sleep
//! through, given the current run time. `None` means the sequence is spent.

use std::time::Duration;

use serde::Serialize;

use crate::error::ConfigError;
use crate::history::Action;

/// Default pause between job status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default amount of polling before a cancelling sequence cancels the job.
pub const DEFAULT_CANCEL_AFTER: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step<A> {
    Invoke(A),
    Sleep(Duration),
}

pub trait Generator {
    type Action;

    /// Next step at run time `now`, or `None` once exhausted or closed.
    fn next(&mut self, now: Duration) -> Option<Step<Self::Action>>;

    /// Stop producing steps until the next [`restart`](Generator::restart).
    fn close(&mut self);

    /// Rewind to the beginning of the sequence.
    fn restart(&mut self);
}

pub type BoxGenerator<A> = Box<dyn Generator<Action = A> + Send>;

impl<A> Generator for BoxGenerator<A> {
    type Action = A;

    fn next(&mut self, now: Duration) -> Option<Step<A>> {
        (**self).next(now)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn restart(&mut self) {
        (**self).restart()
    }
}

/// Polls whether the job is running, forever, with a fixed delay after each poll.
#[derive(Debug, Clone)]
pub struct HealthPoller {
    interval: Duration,
    sleep_next: bool,
    closed: bool,
}

impl HealthPoller {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            sleep_next: false,
            closed: false,
        }
    }
}

impl Default for HealthPoller {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl Generator for HealthPoller {
    type Action = Action;

    fn next(&mut self, _now: Duration) -> Option<Step<Action>> {
        if self.closed {
            return None;
        }
        let step = if self.sleep_next {
            Step::Sleep(self.interval)
        } else {
            Step::Invoke(Action::PollRunning)
        };
        self.sleep_next = !self.sleep_next;
        Some(step)
    }

    fn close(&mut self) {
        self.closed = true;
    }

    fn restart(&mut self) {
        self.sleep_next = false;
        self.closed = false;
    }
}

/// Emits one action, then nothing.
#[derive(Debug, Clone)]
pub struct Once<A> {
    action: A,
    emitted: bool,
}

impl<A> Once<A> {
    pub fn new(action: A) -> Self {
        Self {
            action,
            emitted: false,
        }
    }
}

impl<A: Clone> Generator for Once<A> {
    type Action = A;

    fn next(&mut self, _now: Duration) -> Option<Step<A>> {
        if self.emitted {
            return None;
        }
        self.emitted = true;
        Some(Step::Invoke(self.action.clone()))
    }

    fn close(&mut self) {
        self.emitted = true;
    }

    fn restart(&mut self) {
        self.emitted = false;
    }
}

/// A single pause.
#[derive(Debug, Clone)]
pub struct Pause<A> {
    duration: Duration,
    done: bool,
    _action: std::marker::PhantomData<fn() -> A>,
}

impl<A> Pause<A> {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            done: false,
            _action: std::marker::PhantomData,
        }
    }
}

impl<A> Generator for Pause<A> {
    type Action = A;

    fn next(&mut self, _now: Duration) -> Option<Step<A>> {
        if self.done {
            return None;
        }
        self.done = true;
        Some(Step::Sleep(self.duration))
    }

    fn close(&mut self) {
        self.done = true;
    }

    fn restart(&mut self) {
        self.done = false;
    }
}

/// Passes the inner generator through until `limit` has elapsed since the
/// first pull. A zero limit yields nothing.
#[derive(Debug, Clone)]
pub struct TimeLimit<G> {
    inner: G,
    limit: Duration,
    started_at: Option<Duration>,
    expired: bool,
}

impl<G: Generator> TimeLimit<G> {
    pub fn new(inner: G, limit: Duration) -> Self {
        Self {
            inner,
            limit,
            started_at: None,
            expired: false,
        }
    }
}

impl<G: Generator> Generator for TimeLimit<G> {
    type Action = G::Action;

    fn next(&mut self, now: Duration) -> Option<Step<G::Action>> {
        if self.expired {
            return None;
        }
        let started_at = *self.started_at.get_or_insert(now);
        if now.saturating_sub(started_at) >= self.limit {
            self.expired = true;
            self.inner.close();
            return None;
        }
        let step = self.inner.next(now);
        if step.is_none() {
            self.expired = true;
        }
        step
    }

    fn close(&mut self) {
        self.expired = true;
        self.inner.close();
    }

    fn restart(&mut self) {
        self.started_at = None;
        self.expired = false;
        self.inner.restart();
    }
}

/// Runs each generator to exhaustion in turn, restarting each as it is entered.
pub struct Chain<A> {
    parts: Vec<BoxGenerator<A>>,
    current: usize,
    entered: bool,
}

impl<A> Chain<A> {
    pub fn new(parts: Vec<BoxGenerator<A>>) -> Self {
        Self {
            parts,
            current: 0,
            entered: false,
        }
    }
}

impl<A> Generator for Chain<A> {
    type Action = A;

    fn next(&mut self, now: Duration) -> Option<Step<A>> {
        while let Some(part) = self.parts.get_mut(self.current) {
            if !self.entered {
                part.restart();
                self.entered = true;
            }
            if let Some(step) = part.next(now) {
                return Some(step);
            }
            self.current += 1;
            self.entered = false;
        }
        None
    }

    fn close(&mut self) {
        for part in &mut self.parts {
            part.close();
        }
        self.current = self.parts.len();
    }

    fn restart(&mut self) {
        self.current = 0;
        self.entered = false;
    }
}

/// Replays the inner generator, either forever or a fixed number of times.
#[derive(Debug, Clone)]
pub struct Repeat<G> {
    inner: G,
    times: Option<usize>,
    round: usize,
    closed: bool,
}

impl<G: Generator> Repeat<G> {
    pub fn forever(inner: G) -> Self {
        Self {
            inner,
            times: None,
            round: 0,
            closed: false,
        }
    }

    pub fn times(inner: G, times: usize) -> Self {
        Self {
            times: Some(times),
            ..Self::forever(inner)
        }
    }
}

impl<G: Generator> Generator for Repeat<G> {
    type Action = G::Action;

    fn next(&mut self, now: Duration) -> Option<Step<G::Action>> {
        if self.closed || self.times.is_some_and(|times| self.round >= times) {
            return None;
        }
        if let Some(step) = self.inner.next(now) {
            return Some(step);
        }
        self.round += 1;
        if self.times.is_some_and(|times| self.round >= times) {
            return None;
        }
        self.inner.restart();
        // An inner sequence that is empty right after a restart would spin.
        let step = self.inner.next(now);
        if step.is_none() {
            self.closed = true;
        }
        step
    }

    fn close(&mut self) {
        self.closed = true;
        self.inner.close();
    }

    fn restart(&mut self) {
        self.round = 0;
        self.closed = false;
        self.inner.restart();
    }
}

/// Polls for `cancel_after`, cancels the job exactly once, then polls forever.
pub fn cancelling_sequence<G>(inner: G, cancel_after: Duration) -> Chain<Action>
where
    G: Generator<Action = Action> + Clone + Send + 'static,
{
    Chain::new(vec![
        Box::new(TimeLimit::new(inner.clone(), cancel_after)),
        Box::new(Once::new(Action::Cancel)),
        Box::new(inner),
    ])
}

pub const DEFAULT_CLIENT_GEN: &str = "poll-job-running";

/// The client-side sequences a run can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientGen {
    PollJobRunning,
    CancelJob,
}

impl ClientGen {
    pub const ALL: [ClientGen; 2] = [ClientGen::PollJobRunning, ClientGen::CancelJob];

    pub fn name(self) -> &'static str {
        match self {
            ClientGen::PollJobRunning => "poll-job-running",
            ClientGen::CancelJob => "cancel-job",
        }
    }

    pub fn resolve(name: &str) -> Result<Self, ConfigError> {
        Self::ALL
            .into_iter()
            .find(|gen| gen.name() == name)
            .ok_or_else(|| ConfigError::UnknownClientGenerator {
                name: name.to_string(),
                valid: Self::ALL.iter().map(|gen| gen.name().to_string()).collect(),
            })
    }

    pub fn build(self, poll_interval: Duration, cancel_after: Duration) -> BoxGenerator<Action> {
        let poller = HealthPoller::new(poll_interval);
        match self {
            ClientGen::PollJobRunning => Box::new(poller),
            ClientGen::CancelJob => Box::new(cancelling_sequence(poller, cancel_after)),
        }
    }
}
