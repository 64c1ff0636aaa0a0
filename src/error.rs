#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("compaction failed: {reason}")]
    CompactionFailed { reason: String },
    #[error("ledger corruption: {0}")]
    LedgerCorruption(String),
    #[error("session error: {0}")]
    Session(String),
    #[error("config error: {0}")]
    Config(String),
}

impl ContextError {
    /// Recoverable errors leave the conversation running; only corruption halts it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ContextError::LedgerCorruption(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EstimationError {
    #[error("content is not valid UTF-8 (first invalid byte at offset {offset})")]
    InvalidUtf8 { offset: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("API returned {status}: {body}")]
    ApiError { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl InferenceError {
    /// True when the backend refused the request because the prompt was too long.
    pub fn is_context_overflow(&self) -> bool {
        match self {
            InferenceError::ApiError { status, body } => {
                (*status == 400 || *status == 413)
                    && (body.contains("prompt is too long")
                        || body.contains("context_length_exceeded")
                        || body.contains("too many tokens"))
            }
            _ => false,
        }
    }

    /// Prompt size the backend counted, if the rejection says so
    /// (`prompt is too long: 210000 tokens > 200000 maximum`).
    pub fn reported_prompt_tokens(&self) -> Option<u32> {
        let InferenceError::ApiError { body, .. } = self else {
            return None;
        };
        let rest = &body[body.find("prompt is too long:")? + "prompt is too long:".len()..];
        let digits: String = rest
            .trim_start()
            .chars()
            .take_while(char::is_ascii_digit)
            .collect();
        digits.parse().ok()
    }
}
