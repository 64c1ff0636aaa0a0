use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::InferenceError;
use crate::types::{GenerateRequest, GenerateResponse, Segment, Usage};

/// Pure LLM API call. No state, no history, no context management.
/// Request in, response out.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, InferenceError>;
}

/// Claude API client via Anthropic's messages endpoint.
#[derive(Clone)]
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".into(),
        }
    }

    pub fn with_client(client: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".into(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

/// Fold role-tagged segments into the alternating user/assistant message list
/// the Messages API expects. A role whose last `:` part is `assistant` (the
/// main agent or a named sub-agent) is an assistant turn; everything else is
/// user text. Roles other than plain `user` and `assistant` keep their label as
/// a `[role]: ` prefix. Consecutive segments with the same wire role are merged.
pub(crate) fn messages_from_segments(segments: &[Segment]) -> Vec<Value> {
    let mut messages: Vec<(&'static str, String)> = Vec::new();
    for seg in segments {
        let role = wire_role(&seg.role);
        let text = if seg.role == role {
            seg.text.clone()
        } else {
            format!("[{}]: {}", seg.role, seg.text)
        };
        match messages.last_mut() {
            Some((last_role, merged)) if *last_role == role => {
                merged.push_str("\n\n");
                merged.push_str(&text);
            }
            _ => messages.push((role, text)),
        }
    }
    // The API rejects a conversation that opens with an assistant turn.
    if matches!(messages.first(), Some(("assistant", _))) {
        messages.insert(0, ("user", "(conversation continues)".into()));
    }
    messages
        .into_iter()
        .map(|(role, content)| json!({ "role": role, "content": content }))
        .collect()
}

fn wire_role(role: &str) -> &'static str {
    match role.rsplit(':').next() {
        Some("assistant") => "assistant",
        _ => "user",
    }
}

#[async_trait]
impl InferenceProvider for AnthropicProvider {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse, InferenceError> {
        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": messages_from_segments(&request.segments),
        });

        if let Some(ref system) = request.system {
            body["system"] = Value::String(system.clone());
        }

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| InferenceError::Request(e.to_string()))?;

        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| InferenceError::Request(e.to_string()))?;

        if status != 200 {
            return Err(InferenceError::ApiError { status, body: text });
        }

        let parsed: Value =
            serde_json::from_str(&text).map_err(|e| InferenceError::Parse(e.to_string()))?;

        let blocks = parsed["content"]
            .as_array()
            .ok_or_else(|| InferenceError::Parse("response has no content array".into()))?;
        let text = blocks
            .iter()
            .filter(|b| b["type"] == "text")
            .filter_map(|b| b["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let usage = Usage {
            input_tokens: parsed["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: parsed["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
        };

        Ok(GenerateResponse { text, usage })
    }
}
