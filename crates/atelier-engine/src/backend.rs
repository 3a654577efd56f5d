use std::env;

use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use atelier_contracts::artifacts::ArtifactRecord;
use atelier_contracts::job::StatusReport;
use atelier_contracts::variants::VariantSpec;

use crate::error::EngineError;

/// What a successful job creation gives back. The backend answers with
/// either a bare `{ "jobId": ... }` or a full job object `{ "id": ...,
/// "status": ... }`; both decode into this.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitReceipt {
    pub job_id: String,
    pub status: Option<String>,
}

/// Wire shape of `GET /api/jobs/:jobId/images`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactListing {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub images: Vec<ArtifactRecord>,
}

/// Transport seam for the job lifecycle. The engine and its tests only ever
/// talk to the backend through this trait.
pub trait JobBackend {
    fn submit(&self, variant: &VariantSpec, body: &Value) -> Result<SubmitReceipt, EngineError>;
    fn job_status(&self, job_id: &str) -> Result<StatusReport, EngineError>;
    fn job_artifacts(&self, job_id: &str) -> Result<ArtifactListing, EngineError>;
    /// Raw artifact download, used when mirroring results to disk.
    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, EngineError>;
}

/// Blocking HTTP implementation against the dashboard backend.
pub struct HttpBackend {
    api_base: String,
    http: HttpClient,
}

impl HttpBackend {
    pub fn new() -> Self {
        Self::with_base(
            env::var("ATELIER_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "http://localhost:3000".to_string()),
        )
    }

    pub fn with_base(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            http: HttpClient::new(),
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }
}

impl Default for HttpBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl JobBackend for HttpBackend {
    fn submit(&self, variant: &VariantSpec, body: &Value) -> Result<SubmitReceipt, EngineError> {
        let url = self.url(&variant.endpoint_path());
        let response = self.http.post(&url).json(body).send()?;
        let payload = decode_or_submit_error(response)?;
        parse_submit_receipt(&payload)
    }

    fn job_status(&self, job_id: &str) -> Result<StatusReport, EngineError> {
        let url = self.url(&format!("/api/jobs/{job_id}"));
        let response = self.http.get(&url).send()?;
        let payload = decode_or_http_error(response)?;
        serde_json::from_value(payload)
            .map_err(|err| EngineError::Transport(format!("invalid status payload: {err}")))
    }

    fn job_artifacts(&self, job_id: &str) -> Result<ArtifactListing, EngineError> {
        let url = self.url(&format!("/api/jobs/{job_id}/images"));
        let response = self.http.get(&url).send()?;
        let payload = decode_or_http_error(response)?;
        serde_json::from_value(payload)
            .map_err(|err| EngineError::Transport(format!("invalid artifact payload: {err}")))
    }

    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, EngineError> {
        let response = self.http.get(url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Transport(format!(
                "artifact download failed ({})",
                status.as_u16()
            )));
        }
        Ok(response
            .bytes()
            .map_err(EngineError::from)?
            .to_vec())
    }
}

/// Non-2xx submit responses carry `{ "error": ... }`; surface that message,
/// falling back to the generic one.
fn decode_or_submit_error(response: HttpResponse) -> Result<Value, EngineError> {
    let status = response.status();
    let body = response.text().map_err(EngineError::from)?;
    if !status.is_success() {
        return Err(EngineError::submission(extract_error_field(&body)));
    }
    serde_json::from_str(&body)
        .map_err(|err| EngineError::Transport(format!("invalid JSON payload: {err}")))
}

fn decode_or_http_error(response: HttpResponse) -> Result<Value, EngineError> {
    let status = response.status();
    let body = response.text().map_err(EngineError::from)?;
    if !status.is_success() {
        let detail = extract_error_field(&body)
            .unwrap_or_else(|| truncate_text(&body, 256));
        return Err(EngineError::Transport(format!(
            "request failed ({}): {detail}",
            status.as_u16()
        )));
    }
    serde_json::from_str(&body)
        .map_err(|err| EngineError::Transport(format!("invalid JSON payload: {err}")))
}

fn extract_error_field(body: &str) -> Option<String> {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|payload| {
            payload
                .get("error")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|message| !message.is_empty())
                .map(str::to_string)
        })
}

pub(crate) fn parse_submit_receipt(payload: &Value) -> Result<SubmitReceipt, EngineError> {
    let job_id = payload
        .get("jobId")
        .or_else(|| payload.get("id"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            EngineError::Transport("submit response missing job identifier".to_string())
        })?;
    let status = payload
        .get("status")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(SubmitReceipt {
        job_id: job_id.to_string(),
        status,
    })
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
