use indexmap::IndexMap;
use serde_json::{json, Value};

use atelier_contracts::job::Job;
use atelier_contracts::variants::VariantSpec;

use crate::backend::{JobBackend, SubmitReceipt};
use crate::error::EngineError;

/// Everything the caller provides for one generation request. The workflow
/// graph and params are opaque to the lifecycle; only the presence checks in
/// [`SubmitRequest::validate`] look at them.
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub prompt: Option<String>,
    pub source_image: Option<String>,
    /// Destination folder selection. Always required.
    pub folder: Option<String>,
    pub workflow: Value,
    pub params: IndexMap<String, Value>,
    pub user_id: Option<String>,
}

impl SubmitRequest {
    /// Synchronous pre-flight validation. A failure here means no network
    /// request is ever issued.
    pub fn validate(&self, variant: &VariantSpec) -> Result<(), EngineError> {
        if is_blank(self.folder.as_deref()) {
            return Err(EngineError::validation(
                "Please select a destination folder",
            ));
        }
        if variant.needs_prompt && is_blank(self.prompt.as_deref()) {
            return Err(EngineError::validation("Please enter a prompt"));
        }
        if variant.needs_source_image && is_blank(self.source_image.as_deref()) {
            return Err(EngineError::validation("Please select a source image"));
        }
        Ok(())
    }

    pub fn to_body(&self) -> Value {
        let mut body = json!({
            "workflow": self.workflow,
            "params": self.params,
            "folder": self.folder,
        });
        let object = body.as_object_mut().expect("body is an object");
        if let Some(prompt) = self.prompt.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            object.insert("prompt".to_string(), Value::String(prompt.to_string()));
        }
        if let Some(image) = self
            .source_image
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            object.insert("image".to_string(), Value::String(image.to_string()));
        }
        if let Some(user_id) = self.user_id.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            object.insert("user_id".to_string(), Value::String(user_id.to_string()));
        }
        body
    }
}

/// Validates, posts to the variant's endpoint, and builds the optimistic job
/// record. Submission failures are terminal at this layer; the caller stays
/// in a clean pre-submission state and re-triggers manually.
pub fn submit<B: JobBackend>(
    backend: &B,
    variant: &VariantSpec,
    request: &SubmitRequest,
) -> Result<Job, EngineError> {
    request.validate(variant)?;
    let receipt: SubmitReceipt = backend.submit(variant, &request.to_body())?;
    tracing::debug!(job_id = %receipt.job_id, variant = %variant.name, "job submitted");
    Ok(Job::submitted(receipt.job_id, request.params.clone()))
}

fn is_blank(value: Option<&str>) -> bool {
    value.map(str::trim).filter(|v| !v.is_empty()).is_none()
}
