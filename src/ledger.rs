use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ContextError;
use crate::estimate::TokenEstimator;
use crate::types::Segment;

/// What a ledger entry represents in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    UserMessage,
    AssistantMessage,
    ToolOutput,
    Summary,
}

impl ItemKind {
    /// Role used when the caller doesn't attribute the item.
    pub fn default_role(&self) -> &'static str {
        match self {
            ItemKind::UserMessage => "user",
            ItemKind::AssistantMessage => "assistant",
            ItemKind::ToolOutput => "tool",
            ItemKind::Summary => "summary",
        }
    }
}

/// What a summary replaced. Stored on the summary item so it outlives the
/// compaction call and survives checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionMetadata {
    pub items_compacted: usize,
    pub span_start: Option<DateTime<Utc>>,
    pub span_end: Option<DateTime<Utc>>,
    pub original_tokens: u64,
    pub summary_tokens: u32,
    /// Original tokens divided by summary tokens.
    pub compression_ratio: f64,
}

/// One immutable entry in the ledger. The token estimate is fixed at creation
/// and describes the stored content, not whatever the caller originally had.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    id: String,
    kind: ItemKind,
    role: String,
    content: String,
    estimated_tokens: u32,
    created_at: DateTime<Utc>,
    truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    compaction: Option<CompactionMetadata>,
}

impl ContextItem {
    pub fn new(
        kind: ItemKind,
        role: impl Into<String>,
        content: impl Into<String>,
        estimator: &TokenEstimator,
    ) -> Self {
        let content = content.into();
        Self {
            id: generate_id(),
            kind,
            role: role.into(),
            estimated_tokens: estimator.estimate_str(&content),
            content,
            created_at: Utc::now(),
            truncated: false,
            compaction: None,
        }
    }

    /// Mark the content as altered by the truncation policy.
    pub fn with_truncated(mut self, truncated: bool) -> Self {
        self.truncated = truncated;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn estimated_tokens(&self) -> u32 {
        self.estimated_tokens
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn with_compaction(mut self, metadata: CompactionMetadata) -> Self {
        self.compaction = Some(metadata);
        self
    }

    /// Set on summary items produced by compaction.
    pub fn compaction(&self) -> Option<&CompactionMetadata> {
        self.compaction.as_ref()
    }

    /// Render as a request segment.
    pub fn to_segment(&self) -> Segment {
        Segment::new(self.role.clone(), self.content.clone())
    }
}

/// Ordered record of a session's conversation items.
///
/// Grows by appending. The only other mutation is [`replace_prefix`](Self::replace_prefix),
/// which swaps a contiguous run of the oldest items for one summary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ledger {
    items: Vec<ContextItem>,
    used_tokens: u64,
    compactions: u32,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted items. The running total is recomputed from the
    /// items themselves.
    pub fn from_items(items: Vec<ContextItem>, compactions: u32) -> Self {
        let used_tokens = items.iter().map(|i| i.estimated_tokens as u64).sum();
        Self {
            items,
            used_tokens,
            compactions,
        }
    }

    pub fn push(&mut self, item: ContextItem) {
        self.used_tokens += item.estimated_tokens as u64;
        self.items.push(item);
    }

    /// Replace the first `count` items with `summary`, keeping everything
    /// after them in order.
    pub fn replace_prefix(&mut self, count: usize, summary: ContextItem) {
        let count = count.min(self.items.len());
        let removed: u64 = self.items[..count]
            .iter()
            .map(|i| i.estimated_tokens as u64)
            .sum();
        self.used_tokens = self.used_tokens.saturating_sub(removed) + summary.estimated_tokens as u64;
        self.items.splice(..count, std::iter::once(summary));
        self.compactions += 1;
    }

    pub fn items(&self) -> &[ContextItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Running total, maintained incrementally.
    pub fn used_tokens(&self) -> u64 {
        self.used_tokens
    }

    /// Sum of item estimates, recomputed from scratch. Must always equal
    /// [`used_tokens`](Self::used_tokens).
    pub fn recount(&self) -> u64 {
        self.items.iter().map(|i| i.estimated_tokens as u64).sum()
    }

    /// Fails if the running total has drifted from the items.
    pub fn verify(&self) -> Result<(), ContextError> {
        let recounted = self.recount();
        if recounted != self.used_tokens {
            return Err(ContextError::LedgerCorruption(format!(
                "running total {} does not match item sum {recounted}",
                self.used_tokens
            )));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn skew_total(&mut self, delta: u64) {
        self.used_tokens += delta;
    }

    /// How many compaction replaces this ledger has gone through.
    pub fn compactions(&self) -> u32 {
        self.compactions
    }

    pub fn segments(&self) -> Vec<Segment> {
        self.items.iter().map(ContextItem::to_segment).collect()
    }
}

fn generate_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("item_{ts:x}_{seq:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(kind: ItemKind, content: &str) -> ContextItem {
        ContextItem::new(kind, kind.default_role(), content, &TokenEstimator::default())
    }

    #[test]
    fn estimate_is_fixed_at_creation() {
        let it = item(ItemKind::UserMessage, &"a".repeat(40));
        assert_eq!(it.estimated_tokens(), 10);
        assert!(!it.truncated());
        assert_eq!(it.role(), "user");
    }

    #[test]
    fn ids_are_unique() {
        let a = item(ItemKind::UserMessage, "x");
        let b = item(ItemKind::UserMessage, "x");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn running_total_matches_recount() {
        let mut ledger = Ledger::new();
        for i in 0..50 {
            ledger.push(item(ItemKind::ToolOutput, &"z".repeat(i * 7)));
        }
        assert_eq!(ledger.used_tokens(), ledger.recount());
        assert_eq!(ledger.len(), 50);
    }

    #[test]
    fn replace_prefix_keeps_tail_order() {
        let mut ledger = Ledger::new();
        for i in 0..5 {
            ledger.push(item(ItemKind::UserMessage, &format!("message {i}")));
        }
        let tail: Vec<String> = ledger.items()[3..].iter().map(|i| i.id().to_string()).collect();

        ledger.replace_prefix(3, item(ItemKind::Summary, "summary of 0-2"));

        assert_eq!(ledger.len(), 3);
        assert_eq!(ledger.items()[0].kind(), ItemKind::Summary);
        let kept: Vec<&str> = ledger.items()[1..].iter().map(|i| i.id()).collect();
        assert_eq!(kept, tail);
        assert_eq!(ledger.used_tokens(), ledger.recount());
        assert_eq!(ledger.compactions(), 1);
    }

    #[test]
    fn verify_catches_drifted_total() {
        let mut ledger = Ledger::new();
        ledger.push(item(ItemKind::UserMessage, "abcdefgh"));
        ledger.verify().unwrap();

        ledger.used_tokens += 3;
        assert!(matches!(ledger.verify(), Err(ContextError::LedgerCorruption(_))));
    }

    #[test]
    fn compaction_metadata_is_optional_in_json() {
        let plain = item(ItemKind::UserMessage, "hi");
        let json = serde_json::to_value(&plain).unwrap();
        assert!(json.get("compaction").is_none());

        let summary = item(ItemKind::Summary, "sum").with_compaction(CompactionMetadata {
            items_compacted: 3,
            span_start: Some(plain.created_at()),
            span_end: Some(plain.created_at()),
            original_tokens: 120,
            summary_tokens: 1,
            compression_ratio: 120.0,
        });
        let back: ContextItem = serde_json::from_value(serde_json::to_value(&summary).unwrap()).unwrap();
        assert_eq!(back, summary);
        assert_eq!(back.compaction().unwrap().items_compacted, 3);
    }

    #[test]
    fn from_items_recomputes_total() {
        let items = vec![item(ItemKind::UserMessage, "abcd"), item(ItemKind::AssistantMessage, "efgh")];
        let ledger = Ledger::from_items(items, 2);
        assert_eq!(ledger.used_tokens(), 2);
        assert_eq!(ledger.compactions(), 2);
    }

    #[test]
    fn item_serializes_with_snake_case_kind() {
        let it = item(ItemKind::ToolOutput, "out").with_truncated(true);
        let json = serde_json::to_value(&it).unwrap();
        assert_eq!(json["kind"], "tool_output");
        assert_eq!(json["truncated"], true);
        let back: ContextItem = serde_json::from_value(json).unwrap();
        assert_eq!(back, it);
    }
}
