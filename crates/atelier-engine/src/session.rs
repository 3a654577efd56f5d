use serde_json::{json, Value};

use atelier_contracts::artifacts::{display_urls, ArtifactCache, ArtifactRecord};
use atelier_contracts::events::{EventPayload, EventWriter};
use atelier_contracts::job::Job;
use atelier_contracts::telemetry::{ElapsedClock, FinalDuration};
use atelier_contracts::variants::VariantSpec;

use crate::backend::JobBackend;
use crate::error::EngineError;
use crate::poll::{FetchOutcome, PollConfig, PollLoop, Sleeper, Transition};
use crate::resolve::{resolve, resolve_results, ResolvedResults, ResultSource};
use crate::submit::{submit, SubmitRequest};

/// Captured at tick-schedule time and checked at tick-resolve time. A late
/// response from a superseded job carries a stale token and is discarded
/// before any state is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    generation: u64,
    job_id: String,
}

impl SessionToken {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

/// Owns everything one active generation needs: the job record, poll loop,
/// elapsed clock, final-duration snapshot, artifact cache, resolved results,
/// and last error. Constructed once per page/CLI invocation and torn down
/// explicitly via `reset`/`cancel` rather than leaking state between
/// submissions.
pub struct GenerationSession<B: JobBackend> {
    backend: B,
    config: PollConfig,
    events: Option<EventWriter>,
    generation: u64,
    variant_name: Option<String>,
    job: Option<Job>,
    poll: Option<PollLoop>,
    clock: Option<ElapsedClock>,
    final_duration: Option<FinalDuration>,
    last_error: Option<EngineError>,
    cache: ArtifactCache,
    results: Option<ResolvedResults>,
}

impl<B: JobBackend> GenerationSession<B> {
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, PollConfig::default())
    }

    pub fn with_config(backend: B, config: PollConfig) -> Self {
        Self {
            backend,
            config,
            events: None,
            generation: 0,
            variant_name: None,
            job: None,
            poll: None,
            clock: None,
            final_duration: None,
            last_error: None,
            cache: ArtifactCache::new(),
            results: None,
        }
    }

    pub fn set_event_writer(&mut self, events: EventWriter) {
        self.events = Some(events);
    }

    pub fn job(&self) -> Option<&Job> {
        self.job.as_ref()
    }

    pub fn variant_name(&self) -> Option<&str> {
        self.variant_name.as_deref()
    }

    pub fn results(&self) -> Option<&ResolvedResults> {
        self.results.as_ref()
    }

    pub fn last_error(&self) -> Option<&EngineError> {
        self.last_error.as_ref()
    }

    pub fn final_duration(&self) -> Option<&FinalDuration> {
        self.final_duration.as_ref()
    }

    /// Live `mm:ss` ticker value, if a generation is being timed.
    pub fn clock_display(&self) -> Option<String> {
        self.clock.as_ref().map(ElapsedClock::clock_display)
    }

    pub fn cached_artifacts(&self, job_id: &str) -> Option<&[ArtifactRecord]> {
        self.cache.get(job_id)
    }

    /// Submits a new generation. Supersedes any previous job: the generation
    /// counter is bumped so outstanding ticks for the old job become stale.
    /// Validation and submission failures leave the session in its clean
    /// pre-submission state (no job, no clock, no poll loop).
    pub fn submit(
        &mut self,
        variant: &VariantSpec,
        request: &SubmitRequest,
    ) -> Result<SessionToken, EngineError> {
        let job = match submit(&self.backend, variant, request) {
            Ok(job) => job,
            Err(err) => {
                self.last_error = Some(err.clone());
                return Err(err);
            }
        };
        self.generation += 1;
        self.variant_name = Some(variant.name.clone());
        self.clock = Some(ElapsedClock::from_created_at(job.created_at));
        self.poll = Some(PollLoop::new(self.config));
        self.final_duration = None;
        self.last_error = None;
        self.results = None;
        if let Some(events) = &self.events {
            // the trail and summary.json must agree on the correlation ids
            if let Err(err) = events.bind_job(&job.id, &job.request_ref) {
                tracing::warn!(error = %err, "event writer bind failed");
            }
        }
        self.emit("job_submitted", json!({ "variant": variant.name }));
        self.job = Some(job);
        Ok(self.token().expect("job just stored"))
    }

    pub fn token(&self) -> Option<SessionToken> {
        self.job.as_ref().map(|job| SessionToken {
            generation: self.generation,
            job_id: job.id.clone(),
        })
    }

    pub fn is_current(&self, token: &SessionToken) -> bool {
        token.generation == self.generation
            && self
                .job
                .as_ref()
                .map(|job| job.id == token.job_id)
                .unwrap_or(false)
    }

    /// Applies one fetched status outcome under the staleness guard. Returns
    /// `None` when the token no longer matches the tracked job; the outcome
    /// is dropped without touching any state.
    pub fn apply_status(
        &mut self,
        token: &SessionToken,
        outcome: FetchOutcome,
    ) -> Option<Transition> {
        if !self.is_current(token) {
            tracing::debug!(job_id = %token.job_id, "dropping stale status response");
            return None;
        }
        let (job, poll) = match (self.job.as_mut(), self.poll.as_mut()) {
            (Some(job), Some(poll)) => (job, poll),
            _ => return None,
        };
        let transition = poll.note(outcome, job);
        match &transition {
            Transition::Continue => {
                if let Some(job) = self.job.as_ref() {
                    self.emit(
                        "status_tick",
                        json!({
                            "status": job.status.to_string(),
                            "progress": job.progress,
                            "attempts": self.poll.as_ref().map(PollLoop::attempts),
                        }),
                    );
                }
            }
            Transition::Completed => {
                // a replayed terminal transition must not re-snapshot the
                // duration or duplicate the completion event
                if self.final_duration.is_none() {
                    self.final_duration = self.clock.as_ref().map(ElapsedClock::finalize);
                    let duration = self
                        .final_duration
                        .as_ref()
                        .map(|d| d.display.clone())
                        .unwrap_or_default();
                    self.emit("job_completed", json!({ "duration": duration }));
                }
            }
            Transition::Failed(message) => {
                // the operation did not meaningfully complete; drop the
                // duration display entirely
                self.clock = None;
                self.final_duration = None;
                if self.last_error.is_none() {
                    self.emit("job_failed", json!({ "error": message }));
                }
                self.last_error = Some(EngineError::JobFailed(message.clone()));
            }
            Transition::TimedOut => {
                if self.last_error.is_none() {
                    self.emit("job_timed_out", json!({}));
                }
                self.last_error = Some(EngineError::ProcessingTimeout);
            }
        }
        Some(transition)
    }

    /// Runs the fallback chain for the completed job and stores the outcome.
    pub fn resolve_completed<S: Sleeper>(&mut self, sleeper: &S) -> ResolvedResults {
        let job = match self.job.as_ref() {
            Some(job) => job.clone(),
            None => return ResolvedResults::pending(),
        };
        let results = resolve_results(&self.backend, &job, &mut self.cache, sleeper);
        self.emit(
            "artifacts_resolved",
            json!({
                "count": results.urls.len(),
                "pending": results.is_pending(),
            }),
        );
        self.results = Some(results.clone());
        results
    }

    /// Drives the current job from its first status check to a terminal
    /// state, then resolves results. `on_tick` fires after every applied
    /// tick with the job snapshot, attempt count, and live clock display.
    pub fn run_to_completion<S, T>(
        &mut self,
        sleeper: &S,
        mut on_tick: T,
    ) -> Result<ResolvedResults, EngineError>
    where
        S: Sleeper,
        T: FnMut(&Job, u32, Option<String>),
    {
        let token = self
            .token()
            .ok_or_else(|| EngineError::validation("no job submitted"))?;
        loop {
            let outcome = match self.backend.job_status(&token.job_id) {
                Ok(report) => FetchOutcome::Report(report),
                Err(err) => FetchOutcome::TransportError(err.to_string()),
            };
            let transition = match self.apply_status(&token, outcome) {
                Some(transition) => transition,
                None => return Err(EngineError::validation("job superseded")),
            };
            if let Some(job) = self.job.as_ref() {
                let attempts = self.poll.as_ref().map(PollLoop::attempts).unwrap_or(0);
                on_tick(job, attempts, self.clock_display());
            }
            match transition {
                Transition::Continue => {
                    let interval = self
                        .poll
                        .as_ref()
                        .map(PollLoop::interval)
                        .unwrap_or(self.config.interval);
                    sleeper.sleep(interval);
                }
                Transition::Completed => return Ok(self.resolve_completed(sleeper)),
                Transition::Failed(message) => return Err(EngineError::JobFailed(message)),
                Transition::TimedOut => return Err(EngineError::ProcessingTimeout),
            }
        }
    }

    /// Manual refresh for a completed job whose artifacts were not yet
    /// queryable. Re-invokes the resolver once; a non-empty answer replaces
    /// the stored results.
    pub fn refresh_artifacts(&mut self) -> Option<Vec<String>> {
        let job_id = self.job.as_ref()?.id.clone();
        let artifacts = resolve(&self.backend, &job_id, &mut self.cache)?;
        let urls = display_urls(&artifacts);
        if urls.is_empty() {
            return None;
        }
        self.results = Some(ResolvedResults {
            urls: urls.clone(),
            source: ResultSource::Artifacts,
        });
        Some(urls)
    }

    /// Stops future ticks and invalidates any in-flight response for the
    /// current job. The job record itself stays visible.
    pub fn cancel(&mut self) {
        self.generation += 1;
        self.poll = None;
    }

    /// Clears every piece of per-job state so the next submission behaves
    /// identically to the very first one. Safe to call repeatedly and in any
    /// terminal state.
    pub fn reset(&mut self) {
        self.generation += 1;
        if let Some(job) = self.job.take() {
            self.cache.remove(&job.id);
            self.emit("session_reset", json!({}));
        }
        self.variant_name = None;
        self.poll = None;
        self.clock = None;
        self.final_duration = None;
        self.last_error = None;
        self.results = None;
    }

    fn emit(&self, event_type: &str, payload: Value) {
        if let Some(events) = &self.events {
            let payload = payload
                .as_object()
                .cloned()
                .unwrap_or_else(EventPayload::new);
            if let Err(err) = events.emit(event_type, payload) {
                tracing::warn!(error = %err, "event emit failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::time::Duration;

    use serde_json::{json, Value};

    use atelier_contracts::artifacts::ArtifactRecord;
    use atelier_contracts::events::EventWriter;
    use atelier_contracts::job::StatusReport;
    use atelier_contracts::status::JobStatus;
    use atelier_contracts::variants::{EndpointRoute, VariantSpec};

    use super::{GenerationSession, SessionToken};
    use crate::backend::{ArtifactListing, JobBackend, SubmitReceipt};
    use crate::error::EngineError;
    use crate::poll::{FetchOutcome, PollConfig, Sleeper, Transition};
    use crate::resolve::ResultSource;
    use crate::submit::SubmitRequest;

    /// In-memory backend with scripted status/artifact answers per job id.
    #[derive(Default)]
    struct FakeBackend {
        next_job_ids: RefCell<Vec<String>>,
        statuses: RefCell<Vec<StatusReport>>,
        artifacts: RefCell<Vec<Result<ArtifactListing, EngineError>>>,
    }

    impl FakeBackend {
        fn with_job_ids(ids: &[&str]) -> Self {
            Self {
                next_job_ids: RefCell::new(ids.iter().map(|id| id.to_string()).collect()),
                ..Self::default()
            }
        }

        fn script_statuses(&self, reports: Vec<StatusReport>) {
            *self.statuses.borrow_mut() = reports;
        }

        fn script_artifacts(&self, listings: Vec<Result<ArtifactListing, EngineError>>) {
            *self.artifacts.borrow_mut() = listings;
        }
    }

    impl JobBackend for FakeBackend {
        fn submit(&self, _: &VariantSpec, _: &Value) -> Result<SubmitReceipt, EngineError> {
            let mut ids = self.next_job_ids.borrow_mut();
            if ids.is_empty() {
                return Err(EngineError::submission(None));
            }
            Ok(SubmitReceipt {
                job_id: ids.remove(0),
                status: None,
            })
        }

        fn job_status(&self, _: &str) -> Result<StatusReport, EngineError> {
            let mut statuses = self.statuses.borrow_mut();
            if statuses.is_empty() {
                return Err(EngineError::Transport("no scripted status".to_string()));
            }
            Ok(statuses.remove(0))
        }

        fn job_artifacts(&self, _: &str) -> Result<ArtifactListing, EngineError> {
            let mut listings = self.artifacts.borrow_mut();
            if listings.is_empty() {
                return Ok(ArtifactListing::default());
            }
            listings.remove(0)
        }

        fn fetch_bytes(&self, _: &str) -> Result<Vec<u8>, EngineError> {
            Ok(Vec::new())
        }
    }

    struct NoopSleeper;

    impl Sleeper for NoopSleeper {
        fn sleep(&self, _: Duration) {}
    }

    fn variant() -> VariantSpec {
        VariantSpec::new("flux-kontext", EndpointRoute::Generate, true, true)
    }

    fn request() -> SubmitRequest {
        SubmitRequest {
            prompt: Some("prompt".to_string()),
            source_image: Some("uploads/base.png".to_string()),
            folder: Some("vault/f1".to_string()),
            workflow: json!({}),
            ..SubmitRequest::default()
        }
    }

    fn report(status: &str) -> StatusReport {
        StatusReport {
            status: status.to_string(),
            ..StatusReport::default()
        }
    }

    fn proxied_artifact(id: &str, data_url: &str) -> ArtifactRecord {
        ArtifactRecord {
            id: id.to_string(),
            data_url: Some(data_url.to_string()),
            ..ArtifactRecord::default()
        }
    }

    #[test]
    fn full_lifecycle_to_completion() -> anyhow::Result<()> {
        let backend = FakeBackend::with_job_ids(&["job-1"]);
        backend.script_statuses(vec![
            report("pending"),
            StatusReport {
                status: "processing".to_string(),
                progress: Some(60),
                ..StatusReport::default()
            },
            report("Completed"),
        ]);
        backend.script_artifacts(vec![Ok(ArtifactListing {
            success: true,
            images: vec![proxied_artifact("a-1", "https://api/proxy/a.png")],
        })]);

        let mut session = GenerationSession::new(backend);
        session.submit(&variant(), &request())?;
        let results = session.run_to_completion(&NoopSleeper, |_, _, _| {})?;

        assert_eq!(results.source, ResultSource::Artifacts);
        assert_eq!(results.urls, vec!["https://api/proxy/a.png"]);
        assert_eq!(session.job().map(|job| job.status), Some(JobStatus::Completed));
        assert!(session.final_duration().is_some());
        assert!(session.cached_artifacts("job-1").is_some());
        Ok(())
    }

    #[test]
    fn failed_job_clears_duration_and_surfaces_server_message() -> anyhow::Result<()> {
        let backend = FakeBackend::with_job_ids(&["job-1"]);
        backend.script_statuses(vec![StatusReport {
            status: "FAILED".to_string(),
            error: Some("worker crashed".to_string()),
            ..StatusReport::default()
        }]);

        let mut session = GenerationSession::new(backend);
        session.submit(&variant(), &request())?;
        let err = session
            .run_to_completion(&NoopSleeper, |_, _, _| {})
            .unwrap_err();

        assert_eq!(err, EngineError::JobFailed("worker crashed".to_string()));
        assert!(session.final_duration().is_none());
        assert!(session.clock_display().is_none());
        Ok(())
    }

    #[test]
    fn timeout_is_distinct_from_failure() -> anyhow::Result<()> {
        let backend = FakeBackend::with_job_ids(&["job-1"]);
        backend.script_statuses(vec![report("processing"); 3]);

        let mut session = GenerationSession::with_config(
            backend,
            PollConfig {
                interval: Duration::from_millis(1),
                max_attempts: 3,
            },
        );
        session.submit(&variant(), &request())?;
        let err = session
            .run_to_completion(&NoopSleeper, |_, _, _| {})
            .unwrap_err();
        assert_eq!(err, EngineError::ProcessingTimeout);
        assert_eq!(
            session.last_error(),
            Some(&EngineError::ProcessingTimeout)
        );
        Ok(())
    }

    #[test]
    fn stale_response_from_superseded_job_is_dropped() -> anyhow::Result<()> {
        let backend = FakeBackend::with_job_ids(&["job-a", "job-b"]);
        let mut session = GenerationSession::new(backend);

        let token_a = session.submit(&variant(), &request())?;
        assert_eq!(token_a.job_id(), "job-a");

        // user starts a new generation while job-a has a response in flight
        let token_b = session.submit(&variant(), &request())?;
        assert_eq!(token_b.job_id(), "job-b");

        // job-a's late COMPLETED response arrives and must not apply
        let applied = session.apply_status(&token_a, FetchOutcome::Report(report("COMPLETED")));
        assert!(applied.is_none());
        assert_eq!(
            session.job().map(|job| job.status),
            Some(JobStatus::Processing)
        );
        assert!(session.final_duration().is_none());

        // job-b's own response still applies normally
        let applied = session.apply_status(&token_b, FetchOutcome::Report(report("COMPLETED")));
        assert_eq!(applied, Some(Transition::Completed));
        Ok(())
    }

    #[test]
    fn cancel_invalidates_outstanding_token() -> anyhow::Result<()> {
        let backend = FakeBackend::with_job_ids(&["job-1"]);
        let mut session = GenerationSession::new(backend);
        let token = session.submit(&variant(), &request())?;
        session.cancel();
        assert!(session
            .apply_status(&token, FetchOutcome::Report(report("COMPLETED")))
            .is_none());
        Ok(())
    }

    #[test]
    fn reset_after_terminal_state_is_a_clean_slate() -> anyhow::Result<()> {
        let backend = FakeBackend::with_job_ids(&["job-1", "job-2"]);
        backend.script_statuses(vec![report("Completed"), report("Completed")]);
        backend.script_artifacts(vec![
            Ok(ArtifactListing {
                success: true,
                images: vec![proxied_artifact("a-1", "https://api/proxy/a.png")],
            }),
            Ok(ArtifactListing {
                success: true,
                images: vec![proxied_artifact("a-2", "https://api/proxy/b.png")],
            }),
        ]);

        let mut session = GenerationSession::new(backend);
        session.submit(&variant(), &request())?;
        session.run_to_completion(&NoopSleeper, |_, _, _| {})?;
        assert!(session.cached_artifacts("job-1").is_some());

        session.reset();
        assert!(session.job().is_none());
        assert!(session.results().is_none());
        assert!(session.last_error().is_none());
        assert!(session.final_duration().is_none());
        assert!(session.clock_display().is_none());
        assert!(session.cached_artifacts("job-1").is_none());

        // reset is idempotent
        session.reset();

        // a fresh submission behaves like the very first one
        session.submit(&variant(), &request())?;
        let results = session.run_to_completion(&NoopSleeper, |_, _, _| {})?;
        assert_eq!(results.urls, vec!["https://api/proxy/b.png"]);
        Ok(())
    }

    #[test]
    fn submission_failure_leaves_pre_submission_state() {
        let backend = FakeBackend::with_job_ids(&[]);
        let mut session = GenerationSession::new(backend);
        let err = session.submit(&variant(), &request()).unwrap_err();
        assert_eq!(
            err,
            EngineError::Submission("Failed to start generation".to_string())
        );
        assert!(session.job().is_none());
        assert!(session.clock_display().is_none());
        assert_eq!(session.last_error(), Some(&err));
    }

    #[test]
    fn completed_without_artifacts_offers_manual_refresh() -> anyhow::Result<()> {
        let backend = FakeBackend::with_job_ids(&["job-1"]);
        backend.script_statuses(vec![report("Completed")]);
        // both chain fetches empty, then the manual refresh finds the artifact
        backend.script_artifacts(vec![
            Ok(ArtifactListing::default()),
            Ok(ArtifactListing::default()),
            Ok(ArtifactListing {
                success: true,
                images: vec![proxied_artifact("a-9", "https://api/proxy/late.png")],
            }),
        ]);

        let mut session = GenerationSession::new(backend);
        session.submit(&variant(), &request())?;
        let results = session.run_to_completion(&NoopSleeper, |_, _, _| {})?;
        assert!(results.is_pending());

        let refreshed = session.refresh_artifacts().unwrap();
        assert_eq!(refreshed, vec!["https://api/proxy/late.png"]);
        assert_eq!(
            session.results().map(|results| results.urls.clone()),
            Some(vec!["https://api/proxy/late.png".to_string()])
        );
        Ok(())
    }

    #[test]
    fn event_trail_carries_the_job_request_ref() -> anyhow::Result<()> {
        let backend = FakeBackend::with_job_ids(&["job-1"]);
        backend.script_statuses(vec![report("processing"), report("Completed")]);
        backend.script_artifacts(vec![Ok(ArtifactListing {
            success: true,
            images: vec![proxied_artifact("a-1", "https://api/proxy/a.png")],
        })]);

        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let mut session = GenerationSession::new(backend);
        session.set_event_writer(EventWriter::new(&events_path));

        session.submit(&variant(), &request())?;
        let request_ref = session.job().map(|job| job.request_ref.clone()).unwrap();
        session.run_to_completion(&NoopSleeper, |_, _, _| {})?;

        let content = std::fs::read_to_string(&events_path)?;
        let lines: Vec<Value> = content
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        assert!(!lines.is_empty());
        // every event agrees with the ids summary.json records
        for event in &lines {
            assert_eq!(event["job_id"], Value::String("job-1".to_string()));
            assert_eq!(event["request_ref"], Value::String(request_ref.clone()));
        }
        Ok(())
    }

    #[test]
    fn repeated_completed_report_keeps_first_duration_and_event() -> anyhow::Result<()> {
        let backend = FakeBackend::with_job_ids(&["job-1"]);
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let mut session = GenerationSession::new(backend);
        session.set_event_writer(EventWriter::new(&events_path));
        let token = session.submit(&variant(), &request())?;

        let applied = session.apply_status(&token, FetchOutcome::Report(report("COMPLETED")));
        assert_eq!(applied, Some(Transition::Completed));
        let first = session.final_duration().cloned().unwrap();

        // a second report for the already-terminal job changes nothing
        let applied = session.apply_status(&token, FetchOutcome::Report(report("COMPLETED")));
        assert_eq!(applied, Some(Transition::Completed));
        assert_eq!(session.final_duration(), Some(&first));

        let content = std::fs::read_to_string(&events_path)?;
        let completed = content
            .lines()
            .filter(|line| line.contains("\"job_completed\""))
            .count();
        assert_eq!(completed, 1);
        Ok(())
    }

    #[test]
    fn token_mismatch_by_generation_counter() -> anyhow::Result<()> {
        let backend = FakeBackend::with_job_ids(&["job-1"]);
        let mut session = GenerationSession::new(backend);
        let token = session.submit(&variant(), &request())?;
        assert!(session.is_current(&token));
        let stale = SessionToken {
            generation: 0,
            job_id: "job-1".to_string(),
        };
        assert!(!session.is_current(&stale));
        Ok(())
    }
}
