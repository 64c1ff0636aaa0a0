use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::WindowConfig;
use crate::ledger::Ledger;
use crate::types::Usage;

/// Point-in-time view of how much of the input budget is in use.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetSnapshot {
    pub used_tokens: u64,
    /// Window minus output reserve minus used, floored at zero.
    pub available_tokens: u64,
    /// Window minus output reserve.
    pub input_budget: u64,
    /// Unrounded `used / input_budget`. May exceed 1.0.
    pub percentage_used: f64,
    pub compaction_threshold: f64,
    pub item_count: usize,
    pub signal_latched: bool,
}

impl BudgetSnapshot {
    pub fn over_threshold(&self) -> bool {
        self.percentage_used >= self.compaction_threshold
    }

    /// Rounded percentage for display only.
    pub fn percent_display(&self) -> u32 {
        (self.percentage_used * 100.0).round() as u32
    }
}

impl fmt::Display for BudgetSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} tokens ({}%) • compaction at {}%",
            self.used_tokens,
            self.input_budget,
            self.percent_display(),
            (self.compaction_threshold * 100.0).round() as u32,
        )
    }
}

/// Raised when usage reaches the compaction threshold. Advisory: the caller
/// decides whether to compact.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompactionSignal {
    pub used_tokens: u64,
    pub percentage_used: f64,
    pub threshold: f64,
}

/// Computes snapshots and threshold checks for one window config. Nothing is
/// cached: every [`BudgetSnapshot`] is recomputed from the ledger at the
/// moment it is read.
#[derive(Debug, Clone)]
pub struct BudgetTracker {
    config: WindowConfig,
}

impl BudgetTracker {
    pub fn new(config: WindowConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    /// Fraction of the input budget used. An empty budget counts as full.
    pub fn usage_fraction(&self, used_tokens: u64) -> f64 {
        let budget = self.config.input_budget();
        if budget == 0 {
            return 1.0;
        }
        used_tokens as f64 / budget as f64
    }

    pub fn snapshot(&self, ledger: &Ledger, signal_latched: bool) -> BudgetSnapshot {
        let used = ledger.used_tokens();
        let input_budget = self.config.input_budget() as u64;
        BudgetSnapshot {
            used_tokens: used,
            available_tokens: input_budget.saturating_sub(used),
            input_budget,
            percentage_used: self.usage_fraction(used),
            compaction_threshold: self.config.compaction_threshold,
            item_count: ledger.len(),
            signal_latched,
        }
    }

    /// Returns a signal if the ledger is at or over the threshold.
    pub fn check(&self, ledger: &Ledger) -> Option<CompactionSignal> {
        let used = ledger.used_tokens();
        let fraction = self.usage_fraction(used);
        (fraction >= self.config.compaction_threshold).then_some(CompactionSignal {
            used_tokens: used,
            percentage_used: fraction,
            threshold: self.config.compaction_threshold,
        })
    }
}

/// Backend-reported usage for one model turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnUsage {
    pub turn: u32,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub recorded_at: DateTime<Utc>,
    /// A compaction completed during this turn.
    pub compaction: bool,
}

impl TurnUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens as u64 + self.output_tokens as u64
    }
}

/// Per-turn log of what the backend actually billed, kept alongside the
/// estimate-based ledger so the two can be compared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnLog {
    turns: Vec<TurnUsage>,
}

impl TurnLog {
    pub fn record(&mut self, usage: Usage) -> TurnUsage {
        let turn = TurnUsage {
            turn: self.turns.len() as u32 + 1,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            recorded_at: Utc::now(),
            compaction: false,
        };
        self.turns.push(turn);
        turn
    }

    /// Flag the latest turn as one in which compaction happened.
    pub fn mark_compaction(&mut self) {
        if let Some(last) = self.turns.last_mut() {
            last.compaction = true;
        }
    }

    pub fn turns(&self) -> &[TurnUsage] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn total_tokens(&self) -> u64 {
        self.turns.iter().map(TurnUsage::total).sum()
    }

    pub fn average_turn_tokens(&self) -> u64 {
        if self.turns.is_empty() {
            return 0;
        }
        self.total_tokens() / self.turns.len() as u64
    }

    /// Rough number of further turns that fit in the remaining budget.
    pub fn estimated_remaining_turns(&self, snapshot: &BudgetSnapshot) -> u64 {
        match self.average_turn_tokens() {
            0 => 0,
            avg => snapshot.available_tokens / avg,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimate::TokenEstimator;
    use crate::ledger::{ContextItem, ItemKind};

    fn scenario_config() -> WindowConfig {
        WindowConfig::default()
            .with_context_window(1_000)
            .with_reserved_output_fraction(0.10)
            .with_compaction_threshold(0.70)
    }

    fn ledger_with(tokens: &[usize]) -> Ledger {
        let est = TokenEstimator::default();
        let mut ledger = Ledger::new();
        for t in tokens {
            ledger.push(ContextItem::new(ItemKind::UserMessage, "user", "x".repeat(t * 4), &est));
        }
        ledger
    }

    #[test]
    fn threshold_reached_exactly_at_boundary() {
        let tracker = BudgetTracker::new(scenario_config());
        let ledger = ledger_with(&[300, 200, 130]);
        let snap = tracker.snapshot(&ledger, false);

        assert_eq!(snap.used_tokens, 630);
        assert_eq!(snap.input_budget, 900);
        assert_eq!(snap.available_tokens, 270);
        assert!((snap.percentage_used - 0.70).abs() < 1e-9);

        let signal = tracker.check(&ledger).expect("signal at 70%");
        assert_eq!(signal.used_tokens, 630);
    }

    #[test]
    fn just_under_threshold_no_signal() {
        let tracker = BudgetTracker::new(scenario_config());
        assert!(tracker.check(&ledger_with(&[629])).is_none());
    }

    #[test]
    fn available_floors_at_zero() {
        let tracker = BudgetTracker::new(scenario_config());
        let snap = tracker.snapshot(&ledger_with(&[1_200]), true);
        assert_eq!(snap.available_tokens, 0);
        assert!(snap.percentage_used > 1.0);
        assert!(snap.over_threshold());
    }

    #[test]
    fn report_line_rounds_percent() {
        let tracker = BudgetTracker::new(scenario_config());
        let snap = tracker.snapshot(&ledger_with(&[634]), false);
        // 634 / 900 = 70.44%
        assert_eq!(snap.to_string(), "634/900 tokens (70%) • compaction at 70%");
        let snap = tracker.snapshot(&ledger_with(&[635]), false);
        // 635 / 900 = 70.56%
        assert_eq!(snap.to_string(), "635/900 tokens (71%) • compaction at 70%");
    }

    #[test]
    fn zero_budget_counts_as_full() {
        let tracker = BudgetTracker::new(WindowConfig::default().with_context_window(0));
        assert_eq!(tracker.usage_fraction(0), 1.0);
    }

    #[test]
    fn turn_log_averages_and_projects() {
        let mut log = TurnLog::default();
        assert_eq!(log.average_turn_tokens(), 0);
        log.record(Usage { input_tokens: 100, output_tokens: 50 });
        log.record(Usage { input_tokens: 200, output_tokens: 50 });
        log.mark_compaction();

        assert_eq!(log.len(), 2);
        assert_eq!(log.average_turn_tokens(), 200);
        assert!(log.turns()[1].compaction);
        assert!(!log.turns()[0].compaction);

        let tracker = BudgetTracker::new(scenario_config());
        let snap = tracker.snapshot(&ledger_with(&[100]), false);
        assert_eq!(log.estimated_remaining_turns(&snap), 4);
    }
}
