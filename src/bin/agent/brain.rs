use async_trait::async_trait;
use publish_agent::{AgentError, Decision, HistoryEntry, ObservedState, VisionDecisionProvider};
use reqwest::Client;
use serde_json::json;
use std::time::Duration;

use crate::types::{ChatMessage, HISTORY_WINDOW, ModelReply};

const SYSTEM_PROMPT: &str = r##"You are a browser automation agent working toward a publishing goal. You see the current page and answer with ONE JSON object describing the next step.

Next action:
{"decision":"act","name":"<short step name>","confidence":0.0-1.0,"post_wait_ms":500,
 "action":<ACTION>,
 "expect":{"kind":"text_present","arg":"..."}}

ACTION is one of:
- {"action":"navigate","url":"https://..."}
- {"action":"click","selector":"#publish"}
- {"action":"click","coordinates":{"x":120,"y":300}}
- {"action":"type","selector":"[data-name=\"title\"]","text":"..."}
- {"action":"upload","selector":"input[type=file]","path":"/path/to/file"}
- {"action":"wait","ms":1000}

"expect" is optional. Its kind is one of url_contains, title_contains, element_present, text_present.

Goal reached: {"decision":"done","summary":"..."}
Goal impossible: {"decision":"give_up","reason":"..."}

Rules:
1. Return ONLY the JSON object. No markdown, no explanation.
2. Copy selectors exactly as listed in the DOM snapshot. Prefer #id, [name=...] and [data-name=...] over [data-eid=...].
3. Type the exact input values given in the task. Newlines in text become Enter presses.
4. Name steps after the field or control they touch (title, body, tags, publish).
5. Lower your confidence when you are guessing."##;

/// Chat-completions compatible vision provider (OpenAI, DeepSeek, ...).
pub struct OpenAiCompatProvider {
    name: String,
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    /// Attach screenshots to the prompt when the model accepts images.
    vision: bool,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: impl Into<String>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        vision: bool,
    ) -> Self {
        Self {
            name: name.into(),
            client: Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            vision,
        }
    }

    fn messages(
        &self,
        state: &ObservedState,
        goal: &str,
        history: &[HistoryEntry],
    ) -> Vec<ChatMessage> {
        let mut prompt = format!("Task: {goal}\n");

        let recent = &history[history.len().saturating_sub(HISTORY_WINDOW)..];
        if !recent.is_empty() {
            prompt.push_str("\nSteps so far:\n");
            for h in recent {
                let outcome = match (&h.error, h.success) {
                    (_, true) => "ok".to_string(),
                    (Some(e), false) => format!("FAILED: {e}"),
                    (None, false) => "FAILED".to_string(),
                };
                prompt.push_str(&format!("{}. {} -> {}\n", h.step, h.action, outcome));
            }
        }

        prompt.push_str(&format!(
            "\nPage URL: {}\nTitle: {}\n\nDOM:\n{}\n\nWhat is your next step?",
            state.url, state.title, state.dom_snapshot
        ));

        let user = match (&state.screenshot, self.vision) {
            (Some(jpeg), true) => ChatMessage {
                role: "user".to_string(),
                content: json!([
                    {"type": "text", "text": prompt},
                    {"type": "image_url", "image_url": {"url": format!("data:image/jpeg;base64,{jpeg}")}}
                ]),
            },
            _ => ChatMessage::text("user", prompt),
        };

        vec![ChatMessage::text("system", SYSTEM_PROMPT), user]
    }

    fn fail(&self, message: impl Into<String>) -> AgentError {
        AgentError::Provider {
            provider: self.name.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl VisionDecisionProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn decide(
        &self,
        state: &ObservedState,
        goal: &str,
        history: &[HistoryEntry],
        timeout: Duration,
    ) -> Result<Decision, AgentError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(timeout)
            .json(&json!({
                "model": self.model,
                "messages": self.messages(state, goal, history),
                "temperature": 0.2,
            }))
            .send()
            .await
            .map_err(|e| self.fail(format!("request failed: {e}")))?;

        let status = response.status();
        let json_resp: serde_json::Value = response
            .json()
            .await
            .map_err(|e| self.fail(format!("unreadable response: {e}")))?;

        if !status.is_success() {
            let err_msg = json_resp["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error");
            tracing::warn!("[Brain] {} API error ({}): {}", self.name, status, err_msg);
            return Err(self.fail(format!("API error ({status}): {err_msg}")));
        }

        let content = json_resp["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| self.fail(format!("no content in response: {json_resp}")))?;

        tracing::debug!("[Brain] {} says: {}", self.name, content);

        // Models sometimes wrap JSON in markdown fences.
        let cleaned = content
            .trim()
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();

        let reply: ModelReply = serde_json::from_str(cleaned)
            .map_err(|e| self.fail(format!("unparseable reply: {e}")))?;

        Ok(match reply {
            ModelReply::Act(proposal) => Decision::Act(proposal),
            ModelReply::Done { summary } => Decision::GoalSatisfied { summary },
            ModelReply::GiveUp { reason } => Decision::GoalFailed { reason },
        })
    }
}
