use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Historical record of one finished generation, written next to its
/// downloaded artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub request_ref: String,
    pub variant: String,
    pub status: String,
    pub submitted_at: String,
    pub finished_at: String,
    pub duration: String,
    pub artifact_count: u64,
    pub result_urls: Vec<String>,
}

pub fn write_summary(
    path: &Path,
    summary: &JobSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = match serde_json::to_value(summary)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use super::{write_summary, JobSummary};

    #[test]
    fn write_summary_generates_expected_payload() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("summary.json");

        let summary = JobSummary {
            job_id: "job-123".to_string(),
            request_ref: "req-1".to_string(),
            variant: "flux-kontext".to_string(),
            status: "COMPLETED".to_string(),
            submitted_at: "2026-08-24T00:00:00+00:00".to_string(),
            finished_at: "2026-08-24T00:01:23+00:00".to_string(),
            duration: "1m 23s".to_string(),
            artifact_count: 2,
            result_urls: vec!["https://api/proxy/a.png".to_string()],
        };
        let mut extra = Map::new();
        extra.insert("folder".to_string(), Value::String("vault/f1".to_string()));
        write_summary(&path, &summary, Some(&extra))?;

        let parsed: Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        assert_eq!(parsed["job_id"], json!("job-123"));
        assert_eq!(parsed["duration"], json!("1m 23s"));
        assert_eq!(parsed["artifact_count"], json!(2));
        assert_eq!(parsed["result_urls"][0], json!("https://api/proxy/a.png"));
        assert_eq!(parsed["folder"], json!("vault/f1"));
        assert!(parsed.get("ts").and_then(Value::as_str).is_some());
        Ok(())
    }
}
