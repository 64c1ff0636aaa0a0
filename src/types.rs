use serde::{Deserialize, Serialize};

/// One role-tagged text segment of a generate request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub role: String,
    pub text: String,
}

impl Segment {
    pub fn new(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            text: text.into(),
        }
    }
}

/// Fully-formed request. The provider just sends it.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub max_tokens: u32,
    pub system: Option<String>,
    pub segments: Vec<Segment>,
}

/// What came back from the LLM.
#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub text: String,
    pub usage: Usage,
}

/// Token usage for a single inference call, as reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}
