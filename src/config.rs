use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ContextError;
use crate::truncate::TruncationCaps;

/// Per-backend window configuration. Every field has a default and can be
/// overridden from a config file or with the `with_*` builders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Total context window of the backend, in tokens.
    pub context_window: u32,
    /// Fraction of the window held back for the model's response.
    pub reserved_output_fraction: f64,
    /// Fraction of the input budget at which the compaction signal latches.
    pub compaction_threshold: f64,
    /// Caps applied to every tool output before it is stored.
    pub truncation: TruncationCaps,
    /// Tokens of recent history compaction never touches.
    pub retention_budget: u32,
    /// Upper bound on the summary the backend may produce.
    pub summary_max_tokens: u32,
    /// Per-compaction deadline for the summarization request.
    #[serde(with = "duration_secs")]
    pub summarization_timeout: Duration,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            context_window: 200_000,
            reserved_output_fraction: 0.10,
            compaction_threshold: 0.70,
            truncation: TruncationCaps::default(),
            retention_budget: 20_000,
            summary_max_tokens: 2_048,
            summarization_timeout: Duration::from_secs(60),
        }
    }
}

impl WindowConfig {
    pub fn with_context_window(mut self, tokens: u32) -> Self {
        self.context_window = tokens;
        self
    }

    pub fn with_reserved_output_fraction(mut self, fraction: f64) -> Self {
        self.reserved_output_fraction = fraction;
        self
    }

    pub fn with_compaction_threshold(mut self, fraction: f64) -> Self {
        self.compaction_threshold = fraction;
        self
    }

    pub fn with_truncation(mut self, caps: TruncationCaps) -> Self {
        self.truncation = caps;
        self
    }

    pub fn with_retention_budget(mut self, tokens: u32) -> Self {
        self.retention_budget = tokens;
        self
    }

    pub fn with_summary_max_tokens(mut self, tokens: u32) -> Self {
        self.summary_max_tokens = tokens;
        self
    }

    pub fn with_summarization_timeout(mut self, timeout: Duration) -> Self {
        self.summarization_timeout = timeout;
        self
    }

    /// Tokens held back for the model's output.
    pub fn reserved_tokens(&self) -> u32 {
        (self.context_window as f64 * self.reserved_output_fraction).round() as u32
    }

    /// Usable space for input: window minus the output reserve.
    pub fn input_budget(&self) -> u32 {
        self.context_window.saturating_sub(self.reserved_tokens())
    }

    pub fn validate(&self) -> Result<(), ContextError> {
        if self.context_window == 0 {
            return Err(ContextError::Config("context_window must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.reserved_output_fraction) {
            return Err(ContextError::Config(format!(
                "reserved_output_fraction must be in [0, 1), got {}",
                self.reserved_output_fraction
            )));
        }
        if !(self.compaction_threshold > 0.0 && self.compaction_threshold <= 1.0) {
            return Err(ContextError::Config(format!(
                "compaction_threshold must be in (0, 1], got {}",
                self.compaction_threshold
            )));
        }
        let caps = &self.truncation;
        if caps.max_bytes == 0 || caps.max_lines == 0 {
            return Err(ContextError::Config("truncation caps must be positive".into()));
        }
        if self.summary_max_tokens == 0 {
            return Err(ContextError::Config("summary_max_tokens must be positive".into()));
        }
        if self.summarization_timeout.is_zero() {
            return Err(ContextError::Config("summarization_timeout must be positive".into()));
        }
        Ok(())
    }
}

/// Window settings for every backend the host talks to.
///
/// ```json
/// {
///   "defaults": { "compaction_threshold": 0.7 },
///   "backends": {
///     "claude-sonnet-4-20250514": { "context_window": 200000 },
///     "llama3.2": { "context_window": 8192, "retention_budget": 2000 }
///   }
/// }
/// ```
///
/// A backend entry is a complete `WindowConfig`; fields it omits take the
/// built-in defaults, not the values under `defaults`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub defaults: WindowConfig,
    pub backends: HashMap<String, WindowConfig>,
}

impl ContextConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ContextError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ContextError::Config(e.to_string()))?;
        config.defaults.validate()?;
        for (name, window) in &config.backends {
            window
                .validate()
                .map_err(|e| ContextError::Config(format!("backend {name}: {e}")))?;
        }
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ContextError> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ContextError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// Window settings for `backend`, falling back to the defaults.
    pub fn window_for(&self, backend: &str) -> WindowConfig {
        self.backends
            .get(backend)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
