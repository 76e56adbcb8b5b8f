use publish_agent::ActionProposal;
use serde::{Deserialize, Serialize};

/// What a model may answer with, one JSON object per turn.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ModelReply {
    Act(ActionProposal),
    Done { summary: String },
    GiveUp { reason: String },
}

/// A message in the chat-completions request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: serde_json::Value,
}

impl ChatMessage {
    pub fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: serde_json::Value::String(content.into()),
        }
    }
}

pub const DOM_SNAPSHOT_MAX_CHARS: usize = 4000;
pub const SCREENSHOT_JPEG_QUALITY: u32 = 60;
/// Past steps included in a prompt.
pub const HISTORY_WINDOW: usize = 12;
