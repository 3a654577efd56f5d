use std::time::Duration;

use atelier_contracts::job::{Job, StatusReport};
use atelier_contracts::status::JobStatus;

use crate::error::{EngineError, GENERIC_JOB_ERROR};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 150;

/// Poll cadence and budget. The effective timeout is
/// `interval * max_attempts` (attempt-count based, not wall-clock based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    Active,
    Completed,
    Failed,
    TimedOut,
}

impl PollPhase {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

/// What one status fetch produced.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Report(StatusReport),
    /// Network/decode failure. Retryable within the attempt budget.
    TransportError(String),
}

/// The driver's instruction after one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Schedule the next tick after the interval.
    Continue,
    Completed,
    Failed(String),
    TimedOut,
}

/// Poll-loop state machine for one job. The transition table lives entirely
/// in [`PollLoop::note`]:
///
/// | outcome                       | effect                                        |
/// |-------------------------------|-----------------------------------------------|
/// | transport error, budget left  | attempt consumed, `Continue`                  |
/// | transport error, budget gone  | `TimedOut`                                    |
/// | report `COMPLETED`            | `Completed` (caller resolves artifacts)       |
/// | report `FAILED`               | `Failed(server error or generic message)`     |
/// | report non-terminal/unknown   | merge into job; attempt consumed; budget check|
///
/// Status casing is normalized before matching. Every issued request consumes
/// one attempt, so a never-terminal backend sees exactly `max_attempts`
/// requests before the timeout transition.
#[derive(Debug, Clone)]
pub struct PollLoop {
    config: PollConfig,
    attempts: u32,
    phase: PollPhase,
}

impl PollLoop {
    pub fn new(config: PollConfig) -> Self {
        Self {
            config,
            attempts: 0,
            phase: PollPhase::Active,
        }
    }

    pub fn phase(&self) -> PollPhase {
        self.phase
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    pub fn note(&mut self, outcome: FetchOutcome, job: &mut Job) -> Transition {
        if self.phase.is_terminal() {
            return self.replay_terminal(job);
        }
        match outcome {
            FetchOutcome::TransportError(message) => {
                tracing::warn!(job_id = %job.id, %message, "transient status fetch failure");
                self.consume_attempt()
            }
            FetchOutcome::Report(report) => match report.normalized_status() {
                Some(JobStatus::Completed) => {
                    job.apply_report(&report);
                    self.phase = PollPhase::Completed;
                    Transition::Completed
                }
                Some(JobStatus::Failed) => {
                    job.apply_report(&report);
                    self.phase = PollPhase::Failed;
                    Transition::Failed(report.error_message(GENERIC_JOB_ERROR))
                }
                _ => {
                    job.apply_report(&report);
                    tracing::debug!(
                        job_id = %job.id,
                        attempt = self.attempts + 1,
                        status = %report.status,
                        progress = ?report.progress,
                        "poll tick"
                    );
                    self.consume_attempt()
                }
            },
        }
    }

    fn consume_attempt(&mut self) -> Transition {
        self.attempts += 1;
        if self.attempts >= self.config.max_attempts {
            self.phase = PollPhase::TimedOut;
            Transition::TimedOut
        } else {
            Transition::Continue
        }
    }

    fn replay_terminal(&self, job: &Job) -> Transition {
        match self.phase {
            PollPhase::Completed => Transition::Completed,
            PollPhase::Failed => Transition::Failed(
                job.message
                    .clone()
                    .unwrap_or_else(|| GENERIC_JOB_ERROR.to_string()),
            ),
            PollPhase::TimedOut => Transition::TimedOut,
            PollPhase::Active => Transition::Continue,
        }
    }
}

/// Sleep seam so tests can drive the loop without real time. Production uses
/// [`ThreadSleeper`].
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Drives the loop to a terminal transition against a status-fetch closure.
/// The first request is issued immediately; subsequent requests are spaced by
/// the interval. `on_tick` fires after every applied tick.
pub fn run_poll<F, S, T>(
    poll: &mut PollLoop,
    job: &mut Job,
    mut fetch: F,
    sleeper: &S,
    mut on_tick: T,
) -> Transition
where
    F: FnMut(&str) -> Result<StatusReport, EngineError>,
    S: Sleeper,
    T: FnMut(&Job, u32),
{
    loop {
        let outcome = match fetch(&job.id) {
            Ok(report) => FetchOutcome::Report(report),
            Err(err) => FetchOutcome::TransportError(err.to_string()),
        };
        let transition = poll.note(outcome, job);
        on_tick(job, poll.attempts());
        match transition {
            Transition::Continue => sleeper.sleep(poll.interval()),
            terminal => return terminal,
        }
    }
}
