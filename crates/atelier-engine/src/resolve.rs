use std::time::Duration;

use atelier_contracts::artifacts::{display_urls, ArtifactCache, ArtifactRecord};
use atelier_contracts::job::Job;

use crate::backend::JobBackend;
use crate::poll::Sleeper;

/// Delay before the single second-chance artifact fetch. The backend's
/// status flip to COMPLETED is not transactional with artifact persistence,
/// so "empty right now" often means "not queryable yet".
pub const ARTIFACT_RETRY_DELAY: Duration = Duration::from_millis(3000);

/// Where the displayed result URLs came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSource {
    /// First artifact fetch returned records.
    Artifacts,
    /// The status endpoint's own inline `resultUrls` (legacy/alternate path).
    InlineUrls,
    /// The delayed second-chance artifact fetch returned records.
    ArtifactsAfterRetry,
    /// Nothing resolvable yet. Not an error; the caller offers a manual
    /// refresh.
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedResults {
    pub urls: Vec<String>,
    pub source: ResultSource,
}

impl ResolvedResults {
    pub fn pending() -> Self {
        Self {
            urls: Vec::new(),
            source: ResultSource::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.source == ResultSource::Pending
    }
}

/// One GET against the job-scoped artifact listing. `None` means the fetch
/// itself failed ("try later"), `Some(vec![])` means the backend answered but
/// has nothing persisted yet. Non-empty listings are cached under the job id.
pub fn resolve<B: JobBackend>(
    backend: &B,
    job_id: &str,
    cache: &mut ArtifactCache,
) -> Option<Vec<ArtifactRecord>> {
    match backend.job_artifacts(job_id) {
        Ok(listing) => {
            if !listing.images.is_empty() {
                cache.insert(job_id, listing.images.clone());
            }
            Some(listing.images)
        }
        Err(err) => {
            tracing::debug!(job_id, error = %err, "artifact fetch failed, treating as try-later");
            None
        }
    }
}

/// Fallback chain executed once at the COMPLETED transition:
///
/// 1. immediate artifact fetch, mapped through the source-preference order;
/// 2. the job's own inline `resultUrls`;
/// 3. one delayed retry of the artifact fetch after [`ARTIFACT_RETRY_DELAY`];
///    if that also yields nothing, the outcome is `Pending` rather than an
///    error.
pub fn resolve_results<B: JobBackend, S: Sleeper>(
    backend: &B,
    job: &Job,
    cache: &mut ArtifactCache,
    sleeper: &S,
) -> ResolvedResults {
    if let Some(artifacts) = resolve(backend, &job.id, cache) {
        let urls = display_urls(&artifacts);
        if !urls.is_empty() {
            return ResolvedResults {
                urls,
                source: ResultSource::Artifacts,
            };
        }
    }

    let inline = job.inline_result_urls();
    if !inline.is_empty() {
        return ResolvedResults {
            urls: inline,
            source: ResultSource::InlineUrls,
        };
    }

    sleeper.sleep(ARTIFACT_RETRY_DELAY);
    if let Some(artifacts) = resolve(backend, &job.id, cache) {
        let urls = display_urls(&artifacts);
        if !urls.is_empty() {
            return ResolvedResults {
                urls,
                source: ResultSource::ArtifactsAfterRetry,
            };
        }
    }

    ResolvedResults::pending()
}
