use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::budget::{BudgetSnapshot, BudgetTracker, CompactionSignal, TurnLog, TurnUsage};
use crate::compaction::{
    CompactionEngine, CompactionOutcome, CompactionPlan, CompactionReport, CompactionState,
    Summarizer,
};
use crate::config::WindowConfig;
use crate::error::{ContextError, InferenceError};
use crate::estimate::TokenEstimator;
use crate::events::BudgetEvent;
use crate::ledger::{ContextItem, ItemKind, Ledger};
use crate::session::{NoSessionStore, SessionCheckpoint, SessionStore};
use crate::truncate::{is_binary, truncate, truncate_binary};
use crate::types::{Segment, Usage};

/// Builds a [`SessionHandle`], either fresh or from a checkpoint.
pub struct SessionBuilder {
    config: WindowConfig,
    summarizer: Box<dyn Summarizer>,
    estimator: TokenEstimator,
    session_id: Option<String>,
    events: Option<mpsc::Sender<BudgetEvent>>,
    cancel: Option<CancellationToken>,
    store: Box<dyn SessionStore>,
}

impl SessionBuilder {
    pub fn new(summarizer: impl Summarizer + 'static) -> Self {
        Self {
            config: WindowConfig::default(),
            summarizer: Box::new(summarizer),
            estimator: TokenEstimator::default(),
            session_id: None,
            events: None,
            cancel: None,
            store: Box::new(NoSessionStore),
        }
    }

    pub fn with_config(mut self, config: WindowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_estimator(mut self, estimator: TokenEstimator) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    /// Stream [`BudgetEvent`]s to `tx`. Sends never block; events are dropped
    /// when the channel is full.
    pub fn with_events(mut self, tx: mpsc::Sender<BudgetEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Tie the session to an outer cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_store(mut self, store: impl SessionStore + 'static) -> Self {
        self.store = Box::new(store);
        self
    }

    /// Start an empty session.
    pub fn build(self) -> Result<SessionHandle, ContextError> {
        self.config.validate()?;
        let now = Utc::now();
        let session_id = self
            .session_id
            .clone()
            .unwrap_or_else(|| default_session_id(now));
        let state = LedgerState {
            ledger: Arc::new(Ledger::new()),
            signal_latched: false,
            corrupted: None,
            turns: TurnLog::default(),
        };
        Ok(self.finish(session_id, now, state))
    }

    /// Rebuild a session from a checkpoint. The checkpoint's own window config
    /// wins over the builder's, so the restored snapshot matches the saved one.
    pub fn restore(self, checkpoint: SessionCheckpoint) -> Result<SessionHandle, ContextError> {
        let ledger = checkpoint.to_ledger()?;
        info!(
            session_id = %checkpoint.session_id,
            items = ledger.len(),
            used_tokens = ledger.used_tokens(),
            "session restored"
        );
        let state = LedgerState {
            ledger: Arc::new(ledger),
            signal_latched: checkpoint.signal_latched,
            corrupted: None,
            turns: checkpoint.turns,
        };
        let builder = Self {
            config: checkpoint.config,
            ..self
        };
        Ok(builder.finish(checkpoint.session_id, checkpoint.created_at, state))
    }

    /// Load `session_id` from the configured store and restore it.
    pub async fn resume(self, session_id: &str) -> Result<Option<SessionHandle>, ContextError> {
        match self.store.load(session_id).await? {
            Some(checkpoint) => self.restore(checkpoint).map(Some),
            None => Ok(None),
        }
    }

    fn finish(self, session_id: String, created_at: DateTime<Utc>, state: LedgerState) -> SessionHandle {
        SessionHandle {
            shared: Arc::new(Shared {
                session_id,
                created_at,
                tracker: BudgetTracker::new(self.config),
                estimator: self.estimator,
                engine: CompactionEngine::from_boxed(self.summarizer),
                state: Mutex::new(state),
                cancel: self.cancel.unwrap_or_default(),
                events: self.events,
                store: self.store,
            }),
        }
    }
}

fn default_session_id(now: DateTime<Utc>) -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("session_{:x}_{seq:x}", now.timestamp_micros())
}

struct LedgerState {
    ledger: Arc<Ledger>,
    signal_latched: bool,
    corrupted: Option<String>,
    turns: TurnLog,
}

struct Shared {
    session_id: String,
    created_at: DateTime<Utc>,
    tracker: BudgetTracker,
    estimator: TokenEstimator,
    engine: CompactionEngine,
    state: Mutex<LedgerState>,
    cancel: CancellationToken,
    events: Option<mpsc::Sender<BudgetEvent>>,
    store: Box<dyn SessionStore>,
}

/// What an append stored.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendReceipt {
    pub item_id: String,
    /// Estimate of the stored (possibly truncated) content.
    pub tokens: u32,
    pub truncated: bool,
    /// Present on every append while usage is at or over the threshold.
    pub signal: Option<CompactionSignal>,
}

/// Outcome of reporting a backend rejection of an oversized request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RejectionReport {
    pub estimated_tokens: u64,
    pub reported_tokens: Option<u32>,
    /// Estimator tuned to what the backend counted, when it said.
    pub calibrated: Option<TokenEstimator>,
}

/// Cheap-to-clone handle onto one session's ledger and budget.
///
/// Every collaborator that touches a session's context (the main agent loop,
/// the tool dispatcher, delegated sub-agents) holds a clone of one handle.
/// All ledger mutations go through it and are serialized behind a single
/// mutex; reads take a reference to the current ledger and do their
/// arithmetic outside the lock.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn config(&self) -> &WindowConfig {
        self.shared.tracker.config()
    }

    pub fn estimator(&self) -> &TokenEstimator {
        &self.shared.estimator
    }

    /// Named view for a delegated sub-agent. Shares this handle's ledger.
    pub fn agent(&self, name: impl Into<String>) -> AgentClient {
        AgentClient {
            handle: self.clone(),
            name: name.into(),
        }
    }

    /// Append one item. `ToolOutput` content goes through the truncation
    /// policy first; the stored item's estimate covers what was stored.
    pub fn append_item(
        &self,
        kind: ItemKind,
        role: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<AppendReceipt, ContextError> {
        let content = content.into();
        let (content, truncated) = if kind == ItemKind::ToolOutput {
            let out = truncate(&content, &self.config().truncation);
            (out.content, out.truncated)
        } else {
            (content, false)
        };
        let item = ContextItem::new(kind, role, content, &self.shared.estimator).with_truncated(truncated);
        self.push(item)
    }

    /// Append raw tool output. Binary output is cut by bytes only.
    pub fn append_tool_output(&self, tool: &str, output: &[u8]) -> Result<AppendReceipt, ContextError> {
        let role = format!("tool:{tool}");
        if is_binary(output) {
            let out = truncate_binary(output, self.config().truncation.max_bytes);
            let item = ContextItem::new(ItemKind::ToolOutput, role, out.content, &self.shared.estimator)
                .with_truncated(out.truncated);
            return self.push(item);
        }
        // Not binary, so this is valid UTF-8.
        let text = String::from_utf8_lossy(output);
        self.append_item(ItemKind::ToolOutput, role, text)
    }

    fn push(&self, item: ContextItem) -> Result<AppendReceipt, ContextError> {
        let mut state = self.lock();
        self.ensure_healthy(&state)?;

        let tokens = item.estimated_tokens();
        if state.ledger.used_tokens().checked_add(tokens as u64).is_none() {
            return Err(self.corrupt(&mut state, "token total overflowed".into()));
        }

        let kind = item.kind();
        let role = item.role().to_string();
        let receipt_base = (item.id().to_string(), item.truncated());
        Arc::make_mut(&mut state.ledger).push(item);
        let used_tokens = state.ledger.used_tokens();

        let signal = self.shared.tracker.check(&state.ledger);
        let newly_latched = signal.is_some() && !state.signal_latched;
        if signal.is_some() {
            state.signal_latched = true;
        }
        drop(state);

        debug!(?kind, role = %role, tokens, used_tokens, "item appended");
        self.emit(BudgetEvent::ItemAppended {
            kind,
            role,
            tokens,
            used_tokens,
        });
        if let (true, Some(sig)) = (newly_latched, signal) {
            info!(
                used_tokens = sig.used_tokens,
                percentage_used = sig.percentage_used,
                threshold = sig.threshold,
                "compaction threshold crossed"
            );
            self.emit(BudgetEvent::ThresholdCrossed {
                used_tokens: sig.used_tokens,
                percentage_used: sig.percentage_used,
            });
        }

        let (item_id, truncated) = receipt_base;
        Ok(AppendReceipt {
            item_id,
            tokens,
            truncated,
            signal,
        })
    }

    /// Current budget, computed from the ledger as it is right now.
    pub fn snapshot(&self) -> BudgetSnapshot {
        let (ledger, latched) = self.read();
        self.shared.tracker.snapshot(&ledger, latched)
    }

    /// One-line status for users, e.g. `630/900 tokens (70%) • compaction at 70%`.
    pub fn report_line(&self) -> String {
        self.snapshot().to_string()
    }

    /// Items in order, oldest first.
    pub fn history(&self) -> Vec<ContextItem> {
        self.read().0.items().to_vec()
    }

    /// The ledger rendered as request segments.
    pub fn segments(&self) -> Vec<Segment> {
        self.read().0.segments()
    }

    pub fn compaction_state(&self) -> CompactionState {
        self.shared.engine.state()
    }

    /// Compact only if the threshold signal is latched.
    pub async fn request_compaction_if_needed(&self) -> Result<CompactionOutcome, ContextError> {
        if !self.read().1 {
            return Ok(CompactionOutcome::NotNeeded);
        }
        self.compact_now().await
    }

    /// Summarize everything older than the retention budget into one item.
    ///
    /// The lock is released while the backend works, so other callers can
    /// keep appending. A concurrent call returns `Coalesced`. On failure the
    /// ledger is left exactly as it was and the signal stays latched.
    pub async fn compact_now(&self) -> Result<CompactionOutcome, ContextError> {
        {
            let state = self.lock();
            self.ensure_healthy(&state)?;
        }
        let Some(guard) = self.shared.engine.try_begin() else {
            debug!(session_id = %self.session_id(), "compaction already in flight, coalescing");
            return Ok(CompactionOutcome::Coalesced);
        };

        let config = self.config();
        let ledger = self.read().0;
        let Some(plan) = CompactionPlan::select(&ledger, config.retention_budget) else {
            info!(
                items = ledger.len(),
                used_tokens = ledger.used_tokens(),
                retention_budget = config.retention_budget,
                "history fits in retention budget, nothing to compact"
            );
            return Ok(CompactionOutcome::NoOp);
        };
        drop(ledger);

        info!(
            candidates = plan.len(),
            candidate_tokens = plan.candidate_tokens,
            tokens_before = plan.tokens_before,
            "compaction started"
        );
        self.emit(BudgetEvent::CompactionStarted {
            candidates: plan.len(),
            candidate_tokens: plan.candidate_tokens,
        });

        let summarized = self
            .shared
            .engine
            .summarize(
                &guard,
                &plan,
                &self.shared.estimator,
                config.summary_max_tokens,
                config.summarization_timeout,
                &self.shared.cancel,
            )
            .await;
        // The backend may answer in the same instant the session is cancelled.
        let summarized = summarized.and_then(|summary| {
            if self.shared.cancel.is_cancelled() {
                Err(self.shared.engine.fail("session cancelled".into()))
            } else {
                Ok(summary)
            }
        });
        let summary = match summarized {
            Ok(summary) => summary,
            Err(e) => {
                self.emit(BudgetEvent::CompactionFailed {
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };
        let summary_tokens = summary.estimated_tokens();

        let (tokens_after, still_over) = {
            let mut state = self.lock();
            self.ensure_healthy(&state)?;
            if !plan.prefix_intact(&state.ledger) {
                return Err(self.corrupt(
                    &mut state,
                    format!("compaction prefix of {} items no longer matches the ledger", plan.len()),
                ));
            }
            Arc::make_mut(&mut state.ledger).replace_prefix(plan.len(), summary);
            if let Err(e) = state.ledger.verify() {
                return Err(self.corrupt(&mut state, format!("after compaction: {e}")));
            }
            // Appends made while summarizing count toward the new total too.
            let still_over = self.shared.tracker.check(&state.ledger).is_some();
            state.signal_latched = still_over;
            state.turns.mark_compaction();
            (state.ledger.used_tokens(), still_over)
        };
        drop(guard);

        let report = CompactionReport {
            items_compacted: plan.len(),
            tokens_before: plan.tokens_before,
            tokens_after,
            summary_tokens,
            compression_ratio: plan.candidate_tokens as f64 / summary_tokens.max(1) as f64,
            span_start: plan.span_start(),
            span_end: plan.span_end(),
            still_over_threshold: still_over,
        };
        info!(
            items_compacted = report.items_compacted,
            tokens_before = report.tokens_before,
            tokens_after = report.tokens_after,
            compression_ratio = report.compression_ratio,
            still_over_threshold = still_over,
            "compaction complete"
        );
        if still_over {
            warn!(tokens_after, "still over the compaction threshold after compacting");
        }
        self.emit(BudgetEvent::Compacted {
            pre_tokens: report.tokens_before,
            post_tokens: report.tokens_after,
        });
        Ok(CompactionOutcome::Compacted(report))
    }

    /// Record what the backend billed for one turn.
    pub fn record_turn_usage(&self, usage: Usage) -> TurnUsage {
        let mut state = self.lock();
        let turn = state.turns.record(usage);
        debug!(
            turn = turn.turn,
            reported_input = usage.input_tokens,
            estimated_input = state.ledger.used_tokens(),
            output_tokens = usage.output_tokens,
            "turn usage recorded"
        );
        turn
    }

    pub fn turns(&self) -> TurnLog {
        self.lock().turns.clone()
    }

    /// Note that the backend refused a request as too large. Our estimate was
    /// low; this only logs a calibration signal and suggests a tuned estimator.
    pub fn report_backend_rejection(&self, err: &InferenceError) -> RejectionReport {
        let ledger = self.read().0;
        let estimated_tokens = ledger.used_tokens();
        let reported_tokens = err.reported_prompt_tokens();
        let calibrated = reported_tokens.map(|reported| {
            let chars: usize = ledger.items().iter().map(|i| i.content().chars().count()).sum();
            TokenEstimator::calibrated(chars, reported)
        });
        warn!(
            estimated_tokens,
            reported_tokens = ?reported_tokens,
            current_ratio = self.shared.estimator.chars_per_token(),
            suggested_ratio = ?calibrated.map(|e| e.chars_per_token()),
            error = %err,
            "backend rejected request as too large"
        );
        RejectionReport {
            estimated_tokens,
            reported_tokens,
            calibrated,
        }
    }

    /// Flat copy of everything needed to restore this session.
    pub fn checkpoint(&self) -> SessionCheckpoint {
        let state = self.lock();
        SessionCheckpoint {
            session_id: self.shared.session_id.clone(),
            items: state.ledger.items().to_vec(),
            config: self.config().clone(),
            signal_latched: state.signal_latched,
            compactions: state.ledger.compactions(),
            used_tokens: state.ledger.used_tokens(),
            turns: state.turns.clone(),
            created_at: self.shared.created_at,
            updated_at: Utc::now(),
        }
    }

    /// Write a checkpoint to the configured store.
    pub async fn save(&self) -> Result<(), ContextError> {
        let checkpoint = self.checkpoint();
        self.shared.store.checkpoint(&checkpoint).await?;
        debug!(session_id = %checkpoint.session_id, items = checkpoint.items.len(), "session checkpointed");
        Ok(())
    }

    /// Cancel the session. An in-flight compaction aborts and leaves the
    /// ledger as it was.
    pub fn cancel(&self) {
        info!(session_id = %self.session_id(), "session cancelled");
        self.shared.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read(&self) -> (Arc<Ledger>, bool) {
        let state = self.lock();
        (state.ledger.clone(), state.signal_latched)
    }

    fn ensure_healthy(&self, state: &LedgerState) -> Result<(), ContextError> {
        match &state.corrupted {
            Some(reason) => Err(ContextError::LedgerCorruption(reason.clone())),
            None => Ok(()),
        }
    }

    fn corrupt(&self, state: &mut LedgerState, reason: String) -> ContextError {
        error!(session_id = %self.session_id(), reason = %reason, "ledger corrupted, session halted");
        state.corrupted = Some(reason.clone());
        self.emit(BudgetEvent::LedgerCorrupted {
            reason: reason.clone(),
        });
        ContextError::LedgerCorruption(reason)
    }

    fn emit(&self, event: BudgetEvent) {
        if let Some(tx) = &self.shared.events {
            if let Err(e) = tx.try_send(event) {
                debug!(error = %e, "budget event dropped");
            }
        }
    }
}

/// A delegated sub-agent's view of the session. Roles are prefixed with the
/// agent's name so the summarizer can tell who said what.
#[derive(Clone)]
pub struct AgentClient {
    handle: SessionHandle,
    name: String,
}

impl AgentClient {
    pub fn append_message(&self, kind: ItemKind, content: impl Into<String>) -> Result<AppendReceipt, ContextError> {
        let role = format!("{}:{}", self.name, kind.default_role());
        self.handle.append_item(kind, role, content)
    }

    pub fn append_tool_output(&self, tool: &str, output: &[u8]) -> Result<AppendReceipt, ContextError> {
        self.handle.append_tool_output(&format!("{}:{tool}", self.name), output)
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        self.handle.snapshot()
    }

    pub async fn request_compaction_if_needed(&self) -> Result<CompactionOutcome, ContextError> {
        self.handle.request_compaction_if_needed().await
    }
}
