use crate::ledger::ItemKind;

/// Events emitted by a session handle, for UI streaming and telemetry.
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetEvent {
    ItemAppended { kind: ItemKind, role: String, tokens: u32, used_tokens: u64 },
    ThresholdCrossed { used_tokens: u64, percentage_used: f64 },
    CompactionStarted { candidates: usize, candidate_tokens: u64 },
    Compacted { pre_tokens: u64, post_tokens: u64 },
    CompactionFailed { reason: String },
    LedgerCorrupted { reason: String },
}
