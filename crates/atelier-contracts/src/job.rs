use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::status::JobStatus;

/// One generation request tracked client-side from submission to terminal
/// state. The backend is the system of record; this value is never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub progress: Option<u8>,
    pub message: Option<String>,
    pub result_urls: Option<Vec<String>>,
    /// Client clock at submission time. Duration-fallback anchor when the
    /// precise start instant was not recorded.
    pub created_at: DateTime<Utc>,
    /// Client-side reference attached to events and summaries. Assigned
    /// before the backend id exists.
    pub request_ref: String,
    /// Opaque echo of the request parameters, kept for display only.
    #[serde(default)]
    pub params: IndexMap<String, Value>,
}

impl Job {
    /// Optimistic record built at submission time, before the first poll.
    pub fn submitted(id: impl Into<String>, params: IndexMap<String, Value>) -> Self {
        Self {
            id: id.into(),
            status: JobStatus::Processing,
            progress: Some(0),
            message: None,
            result_urls: None,
            created_at: Utc::now(),
            request_ref: Uuid::new_v4().to_string(),
            params,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Field-by-field override from a poll tick. Lists are replaced
    /// wholesale, never merged. No-op once the job is terminal.
    pub fn apply_report(&mut self, report: &StatusReport) {
        if self.is_terminal() {
            return;
        }
        if let Some(status) = report.normalized_status() {
            self.status = status;
        }
        if let Some(progress) = report.progress {
            self.progress = Some(progress.clamp(0, 100) as u8);
        }
        if report.message.is_some() {
            self.message = report.message.clone();
        }
        if report.result_urls.is_some() {
            self.result_urls = report.result_urls.clone();
        }
    }

    pub fn inline_result_urls(&self) -> Vec<String> {
        self.result_urls
            .iter()
            .flatten()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect()
    }
}

/// Wire shape of `GET /api/jobs/:jobId`. The backend's status casing is not
/// trusted; consumers go through [`StatusReport::normalized_status`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    #[serde(default)]
    pub status: String,
    pub progress: Option<i64>,
    pub message: Option<String>,
    pub result_urls: Option<Vec<String>>,
    pub error: Option<String>,
}

impl StatusReport {
    pub fn normalized_status(&self) -> Option<JobStatus> {
        JobStatus::parse(&self.status)
    }

    pub fn error_message(&self, fallback: &str) -> String {
        self.error
            .as_deref()
            .map(str::trim)
            .filter(|message| !message.is_empty())
            .unwrap_or(fallback)
            .to_string()
    }
}
