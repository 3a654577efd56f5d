use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Wire shape of one output file from `GET /api/jobs/:jobId/images`. Every
/// field except `id` is optional on the wire; the URL fields are alternative
/// representations of the same bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    #[serde(default)]
    pub id: String,
    pub filename: Option<String>,
    pub url: Option<String>,
    pub data_url: Option<String>,
    pub aws_s3_url: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub file_size: Option<u64>,
    pub format: Option<String>,
}

/// One concrete place the artifact bytes can be fetched from. Replaces the
/// dashboard's `dataUrl || url` truthy-coalescing with an ordered union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    /// Backend-proxied URL (`dataUrl`). Preferred for display.
    ProxiedUrl(String),
    /// Direct cloud URL (`awsS3Url` or `url`).
    CloudUrl(String),
}

impl ArtifactSource {
    pub fn url(&self) -> &str {
        match self {
            Self::ProxiedUrl(url) | Self::CloudUrl(url) => url,
        }
    }
}

impl ArtifactRecord {
    /// All usable sources in display-preference order: proxied first, then
    /// cloud variants. Blank fields are dropped, never yielded.
    pub fn sources(&self) -> Vec<ArtifactSource> {
        let mut sources = Vec::new();
        if let Some(url) = non_blank(self.data_url.as_deref()) {
            sources.push(ArtifactSource::ProxiedUrl(url));
        }
        if let Some(url) = non_blank(self.aws_s3_url.as_deref()) {
            sources.push(ArtifactSource::CloudUrl(url));
        }
        if let Some(url) = non_blank(self.url.as_deref()) {
            if !sources.iter().any(|source| source.url() == url) {
                sources.push(ArtifactSource::CloudUrl(url));
            }
        }
        sources
    }

    pub fn display_url(&self) -> Option<String> {
        self.sources()
            .first()
            .map(|source| source.url().to_string())
    }

    /// Alternate source for a render-time swap after a load error on the
    /// preferred one.
    pub fn fallback_url(&self) -> Option<String> {
        self.sources()
            .get(1)
            .map(|source| source.url().to_string())
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// In-memory per-job artifact cache, keyed by job id. Entries are written
/// only by the artifact resolver, never by the poll loop.
#[derive(Debug, Clone, Default)]
pub struct ArtifactCache {
    entries: HashMap<String, Vec<ArtifactRecord>>,
}

impl ArtifactCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, job_id: &str) -> Option<&[ArtifactRecord]> {
        self.entries.get(job_id).map(Vec::as_slice)
    }

    pub fn insert(&mut self, job_id: impl Into<String>, artifacts: Vec<ArtifactRecord>) {
        self.entries.insert(job_id.into(), artifacts);
    }

    pub fn remove(&mut self, job_id: &str) -> Option<Vec<ArtifactRecord>> {
        self.entries.remove(job_id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Maps a resolved artifact list to the displayable URL set, dropping
/// records with no usable source.
pub fn display_urls(artifacts: &[ArtifactRecord]) -> Vec<String> {
    artifacts
        .iter()
        .filter_map(ArtifactRecord::display_url)
        .collect()
}
