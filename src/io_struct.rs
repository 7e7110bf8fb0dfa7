use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.95
}

fn default_top_k() -> i32 {
    40
}

fn default_use_search() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatReqInput {
    pub query: String,
    pub sys_prompt: Option<String>,
    pub model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_top_k")]
    pub top_k: i32,
    pub thinking_level: Option<String>,
    #[serde(default = "default_use_search")]
    pub use_search: bool,

    #[serde(flatten)]
    pub other: Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GroundingSource {
    pub title: String,
    pub uri: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatResponse {
    pub text: String,
    pub grounding_sources: Vec<GroundingSource>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubmitJobReqInput {
    /// Caller-supplied job id; generated when absent.
    pub id: Option<String>,
    pub topic: String,

    #[serde(flatten)]
    pub other: Value,
}

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub job_uuid: String,
    pub status: String,
    pub project: String,
}

/// One line of the JSONL batch input. The external batch API requires
/// exactly this shape: a provider-shaped `request` plus a correlation id.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StageItem {
    pub request: Value,
    pub custom_id: String,
}

/// State of a remote batch job as reported by the external API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteJobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RemoteJobState {
    /// Maps the wire state name. Unknown states map to `Running` so the
    /// scheduler keeps polling instead of guessing a terminal outcome.
    pub fn from_state_name(name: &str) -> Self {
        match name {
            "JOB_STATE_QUEUED" | "JOB_STATE_PENDING" => RemoteJobState::Pending,
            "JOB_STATE_SUCCEEDED" => RemoteJobState::Succeeded,
            "JOB_STATE_FAILED" | "JOB_STATE_EXPIRED" => RemoteJobState::Failed,
            "JOB_STATE_CANCELLED" | "JOB_STATE_CANCELLING" => RemoteJobState::Cancelled,
            _ => RemoteJobState::Running,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RemoteJobState::Succeeded | RemoteJobState::Failed | RemoteJobState::Cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_req_defaults() {
        let req: ChatReqInput = serde_json::from_str(r#"{"query": "hi"}"#).unwrap();
        assert_eq!(req.temperature, 0.7);
        assert_eq!(req.top_k, 40);
        assert!(req.use_search);
        assert!(req.model.is_none());
    }

    #[test]
    fn test_stage_item_line_shape() {
        let item = StageItem {
            request: serde_json::json!({"contents": []}),
            custom_id: "job-1".to_string(),
        };
        let line = serde_json::to_string(&item).unwrap();
        assert_eq!(line, r#"{"request":{"contents":[]},"custom_id":"job-1"}"#);
    }

    #[test]
    fn test_remote_state_mapping() {
        assert_eq!(
            RemoteJobState::from_state_name("JOB_STATE_SUCCEEDED"),
            RemoteJobState::Succeeded
        );
        assert_eq!(
            RemoteJobState::from_state_name("JOB_STATE_CANCELLING"),
            RemoteJobState::Cancelled
        );
        // Unknown states keep the job pollable.
        assert_eq!(
            RemoteJobState::from_state_name("JOB_STATE_SOMETHING_NEW"),
            RemoteJobState::Running
        );
        assert!(!RemoteJobState::Pending.is_terminal());
        assert!(RemoteJobState::Failed.is_terminal());
    }
}
