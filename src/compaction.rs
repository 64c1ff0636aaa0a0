use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ContextError, InferenceError};
use crate::estimate::TokenEstimator;
use crate::ledger::{CompactionMetadata, ContextItem, ItemKind, Ledger};
use crate::provider::InferenceProvider;
use crate::types::{GenerateRequest, Segment};

/// System prompt for [`ProviderSummarizer`] unless overridden with
/// [`ProviderSummarizer::with_prompt`].
pub const SUMMARY_PROMPT: &str = "\
Summarize the conversation excerpt below. The summary replaces these messages \
in a fresh context window, so preserve everything needed to continue the task \
without re-reading them.

Cover:
1. The primary task and what has been accomplished
2. Files, functions, commands, and decisions mentioned (verbatim paths and names)
3. Errors encountered and how they were resolved
4. Pending work and next steps

Only include facts stated in the messages. Be concise; omit pleasantries.";

/// Turns a run of conversation items into summary text. One call, no tools,
/// no access to the rest of the session.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        items: &[ContextItem],
        max_tokens: u32,
    ) -> Result<String, InferenceError>;
}

/// Summarizer backed by any [`InferenceProvider`], issuing exactly one
/// generate request per call.
pub struct ProviderSummarizer<P> {
    provider: P,
    model: String,
    prompt: String,
}

impl<P: InferenceProvider> ProviderSummarizer<P> {
    pub fn new(provider: P, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            prompt: SUMMARY_PROMPT.to_string(),
        }
    }

    /// Replace the system prompt sent with every summarization request.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn build_request(&self, items: &[ContextItem], max_tokens: u32) -> GenerateRequest {
        let mut transcript = String::new();
        for item in items {
            transcript.push_str(&format!("[{}]: {}\n\n", item.role(), item.content()));
        }
        GenerateRequest {
            model: self.model.clone(),
            max_tokens,
            system: Some(self.prompt.clone()),
            segments: vec![Segment::new(
                "user",
                format!("Conversation to summarize:\n\n{transcript}"),
            )],
        }
    }
}

#[async_trait]
impl<P: InferenceProvider> Summarizer for ProviderSummarizer<P> {
    async fn summarize(
        &self,
        items: &[ContextItem],
        max_tokens: u32,
    ) -> Result<String, InferenceError> {
        let response = self
            .provider
            .generate(self.build_request(items, max_tokens))
            .await?;
        debug!(
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "summarization response"
        );
        Ok(response.text)
    }
}

/// Index of the first item in the retained tail.
///
/// Walks from the newest item backwards, keeping items while the running
/// total stays within `retention_budget`. Everything before the returned
/// index is a compaction candidate.
pub fn retention_boundary(items: &[ContextItem], retention_budget: u32) -> usize {
    let mut kept: u64 = 0;
    let mut boundary = items.len();
    for (idx, item) in items.iter().enumerate().rev() {
        let next = kept + item.estimated_tokens() as u64;
        if next > retention_budget as u64 {
            break;
        }
        kept = next;
        boundary = idx;
    }
    boundary
}

/// The prefix selected for summarization.
#[derive(Debug, Clone)]
pub struct CompactionPlan {
    pub candidates: Vec<ContextItem>,
    pub candidate_tokens: u64,
    pub tokens_before: u64,
}

impl CompactionPlan {
    /// Select candidates from `ledger`, or `None` when there is nothing worth
    /// compacting (everything fits in the retention budget, or the only
    /// candidate is already a summary).
    pub fn select(ledger: &Ledger, retention_budget: u32) -> Option<Self> {
        let boundary = retention_boundary(ledger.items(), retention_budget);
        let candidates = &ledger.items()[..boundary];
        match candidates {
            [] => None,
            [only] if only.kind() == ItemKind::Summary => None,
            _ => Some(Self {
                candidate_tokens: candidates.iter().map(|i| i.estimated_tokens() as u64).sum(),
                candidates: candidates.to_vec(),
                tokens_before: ledger.used_tokens(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// True if `ledger` still starts with exactly these candidates.
    pub fn prefix_intact(&self, ledger: &Ledger) -> bool {
        ledger.len() >= self.candidates.len()
            && self
                .candidates
                .iter()
                .zip(ledger.items())
                .all(|(a, b)| a.id() == b.id())
    }

    pub fn span_start(&self) -> Option<DateTime<Utc>> {
        self.candidates.first().map(ContextItem::created_at)
    }

    pub fn span_end(&self) -> Option<DateTime<Utc>> {
        self.candidates.last().map(ContextItem::created_at)
    }
}

/// What a compaction request did.
#[derive(Debug, Clone, PartialEq)]
pub enum CompactionOutcome {
    /// No signal was latched; nothing to do.
    NotNeeded,
    /// History already fits in the retention budget.
    NoOp,
    /// Another compaction was in flight; this request was folded into it.
    Coalesced,
    Compacted(CompactionReport),
}

/// Metadata about one successful compaction.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionReport {
    pub items_compacted: usize,
    pub tokens_before: u64,
    pub tokens_after: u64,
    pub summary_tokens: u32,
    /// Candidate tokens divided by summary tokens.
    pub compression_ratio: f64,
    pub span_start: Option<DateTime<Utc>>,
    pub span_end: Option<DateTime<Utc>>,
    /// Usage is still at or over the threshold after compacting.
    pub still_over_threshold: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionState {
    Idle,
    Summarizing,
    Failed,
}

/// Runs summarization for one session.
///
/// The engine asks a [`Summarizer`] for one summary of a [`CompactionPlan`]
/// and hands back the summary item for the session handle to splice into the
/// ledger. It never touches the ledger itself, so a failure at any step leaves
/// it untouched. At most one run is in flight; the state returns to `Idle`
/// when the run's guard is dropped, including when the caller's future is
/// dropped mid-request.
pub struct CompactionEngine {
    summarizer: Box<dyn Summarizer>,
    state: Mutex<CompactionState>,
}

impl CompactionEngine {
    pub fn new(summarizer: impl Summarizer + 'static) -> Self {
        Self::from_boxed(Box::new(summarizer))
    }

    pub fn from_boxed(summarizer: Box<dyn Summarizer>) -> Self {
        Self {
            summarizer,
            state: Mutex::new(CompactionState::Idle),
        }
    }

    pub fn state(&self) -> CompactionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the engine. `None` if a run is already in flight.
    pub fn try_begin(&self) -> Option<RunGuard<'_>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != CompactionState::Idle {
            return None;
        }
        *state = CompactionState::Summarizing;
        Some(RunGuard { engine: self })
    }

    fn set_state(&self, next: CompactionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    /// Ask the summarizer for a summary of `plan` and build the replacement
    /// item, carrying [`CompactionMetadata`] about what it replaced. Any backend error, timeout, cancellation, empty summary, or
    /// summary larger than what it replaces is a `CompactionFailed`.
    pub async fn summarize(
        &self,
        _guard: &RunGuard<'_>,
        plan: &CompactionPlan,
        estimator: &TokenEstimator,
        max_tokens: u32,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ContextItem, ContextError> {
        let request = self.summarizer.summarize(&plan.candidates, max_tokens);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err("session cancelled".to_string()),
            res = tokio::time::timeout(timeout, request) => match res {
                Err(_) => Err(format!("summarization timed out after {timeout:?}")),
                Ok(Err(e)) => Err(e.to_string()),
                Ok(Ok(text)) => Ok(text),
            },
        };

        let text = match result {
            Ok(text) if text.trim().is_empty() => Err("backend returned an empty summary".into()),
            other => other,
        }
        .map_err(|reason| self.fail(reason))?;

        let summary = ContextItem::new(
            ItemKind::Summary,
            ItemKind::Summary.default_role(),
            format!(
                "[Conversation summary: {} earlier items]\n\n{}",
                plan.len(),
                text.trim()
            ),
            estimator,
        );
        let summary_tokens = summary.estimated_tokens();

        if summary_tokens as u64 > plan.candidate_tokens {
            return Err(self.fail(format!(
                "summary ({summary_tokens} tokens) is larger than the {} tokens it would replace",
                plan.candidate_tokens
            )));
        }
        Ok(summary.with_compaction(CompactionMetadata {
            items_compacted: plan.len(),
            span_start: plan.span_start(),
            span_end: plan.span_end(),
            original_tokens: plan.candidate_tokens,
            summary_tokens,
            compression_ratio: plan.candidate_tokens as f64 / summary_tokens.max(1) as f64,
        }))
    }

    pub(crate) fn fail(&self, reason: String) -> ContextError {
        warn!(reason = %reason, "compaction failed, ledger left unchanged");
        self.set_state(CompactionState::Failed);
        ContextError::CompactionFailed { reason }
    }
}

/// Held for the duration of one compaction run.
pub struct RunGuard<'a> {
    engine: &'a CompactionEngine,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.engine.set_state(CompactionState::Idle);
    }
}
