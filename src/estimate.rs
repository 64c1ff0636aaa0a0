use tracing::debug;

use crate::error::EstimationError;

/// Default characters per token for English text and code.
pub const DEFAULT_CHARS_PER_TOKEN: f64 = 4.0;

/// Calibrated ratios are clamped to this range so one odd turn can't skew
/// every later estimate.
const MIN_CHARS_PER_TOKEN: f64 = 1.0;
const MAX_CHARS_PER_TOKEN: f64 = 8.0;

/// Approximate token counting. A local heuristic, not a vendor tokenizer.
///
/// ASCII characters cost one unit and every other character costs a whole
/// token's worth of units, since BPE tokenizers rarely merge CJK or emoji with
/// their neighbours. Tokens are `ceil(units / chars_per_token)`, so appending
/// content never lowers the estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenEstimator {
    chars_per_token: f64,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self {
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }
}

impl TokenEstimator {
    pub fn new(chars_per_token: f64) -> Self {
        Self {
            chars_per_token: clamp_ratio(chars_per_token),
        }
    }

    /// Derive a ratio from backend-reported usage: `chars` of input the
    /// backend counted as `observed_tokens`.
    pub fn calibrated(chars: usize, observed_tokens: u32) -> Self {
        if observed_tokens == 0 || chars == 0 {
            return Self::default();
        }
        Self::new(chars as f64 / observed_tokens as f64)
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }

    /// Estimate tokens for raw content. Fails only if the bytes are not UTF-8.
    pub fn estimate(&self, content: &[u8]) -> Result<u32, EstimationError> {
        match std::str::from_utf8(content) {
            Ok(s) => Ok(self.estimate_str(s)),
            Err(e) => Err(EstimationError::InvalidUtf8 {
                offset: e.valid_up_to(),
            }),
        }
    }

    /// Estimate tokens for text.
    pub fn estimate_str(&self, content: &str) -> u32 {
        let whole_token = self.chars_per_token;
        let units: f64 = content
            .chars()
            .map(|c| if c.is_ascii() { 1.0 } else { whole_token })
            .sum();
        let tokens = (units / self.chars_per_token).ceil();
        if tokens >= u32::MAX as f64 {
            u32::MAX
        } else {
            tokens as u32
        }
    }

    /// Like [`estimate`](Self::estimate) but never fails: malformed bytes are
    /// decoded lossily (each invalid run becomes one replacement character)
    /// and the same heuristic runs over the result.
    pub fn estimate_lossy(&self, content: &[u8]) -> u32 {
        match self.estimate(content) {
            Ok(tokens) => tokens,
            Err(e) => {
                debug!(error = %e, bytes = content.len(), "estimating malformed content lossily");
                self.estimate_str(&String::from_utf8_lossy(content))
            }
        }
    }
}

fn clamp_ratio(ratio: f64) -> f64 {
    if ratio.is_finite() {
        ratio.clamp(MIN_CHARS_PER_TOKEN, MAX_CHARS_PER_TOKEN)
    } else {
        DEFAULT_CHARS_PER_TOKEN
    }
}
