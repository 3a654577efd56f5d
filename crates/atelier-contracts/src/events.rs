use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only writer for the job lifecycle trail (`events.jsonl`).
///
/// Every line is one compact JSON object with `type` and `ts` set by the
/// writer. Once a submission succeeds the writer is bound to the job via
/// [`EventWriter::bind_job`], after which `job_id` and `request_ref` are
/// stamped onto every event, so the trail correlates with `summary.json`
/// without the caller repeating the ids in each payload. The caller payload
/// is merged last and can override any default.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    state: Mutex<BoundJob>,
}

#[derive(Debug, Default)]
struct BoundJob {
    job_id: Option<String>,
    request_ref: Option<String>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                state: Mutex::new(BoundJob::default()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Binds the trail to a submitted job. Subsequent events carry the job's
    /// id and request reference; a later bind (a superseding submission)
    /// replaces both.
    pub fn bind_job(
        &self,
        job_id: impl Into<String>,
        request_ref: impl Into<String>,
    ) -> anyhow::Result<()> {
        let mut state = self.lock_state()?;
        state.job_id = Some(job_id.into());
        state.request_ref = Some(request_ref.into());
        Ok(())
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert("ts".to_string(), Value::String(now_utc_iso()));

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let state = self.lock_state()?;
        if let Some(job_id) = &state.job_id {
            event.insert("job_id".to_string(), Value::String(job_id.clone()));
        }
        if let Some(request_ref) = &state.request_ref {
            event.insert(
                "request_ref".to_string(),
                Value::String(request_ref.clone()),
            );
        }
        for (key, value) in payload {
            event.insert(key, value);
        }

        let line = serde_json::to_string(&event)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }

    fn lock_state(&self) -> anyhow::Result<std::sync::MutexGuard<'_, BoundJob>> {
        self.inner
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
