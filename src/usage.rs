//! Token-usage accounting across pipeline steps.
//!
//! Every LLM-calling stage reports its [`TokenUsage`] to a shared
//! [`UsageTracker`] keyed by step name. Steps form a shallow tree: the
//! `extraction` step holds one child record per unit-level call, while the
//! schema-synthesis steps are plain leaves.

use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::llm::TokenUsage;

/// Step name for the query analysis call.
pub const STEP_ANALYSIS: &str = "analysis";
/// Step name for the query refinement call.
pub const STEP_REFINEMENT: &str = "refinement";
/// Step name for the schema generation call.
pub const STEP_SCHEMA_GENERATION: &str = "schema_generation";
/// Step name for the guide generation call.
pub const STEP_GUIDE: &str = "guide";
/// Step name for per-unit extraction calls.
pub const STEP_EXTRACTION: &str = "extraction";

/// Accumulated token counts for one named pipeline step.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// The step name (e.g. `"analysis"`, `"extraction"`).
    pub step: String,
    /// Prompt tokens attributed directly to this step.
    pub prompt_tokens: usize,
    /// Completion tokens attributed directly to this step.
    pub completion_tokens: usize,
    /// Thinking tokens, when any call on this step reported them.
    pub thinking_tokens: usize,
    /// Cached prompt tokens, when any call on this step reported them.
    pub cached_tokens: usize,
    /// Child records for unit-level calls under this step.
    pub children: Vec<UsageRecord>,
}

impl UsageRecord {
    /// Create an empty record for the given step.
    pub fn new(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            ..Default::default()
        }
    }

    /// Fold one call's usage into this record.
    pub fn add(&mut self, usage: TokenUsage) {
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
        self.thinking_tokens += usage.thinking_tokens.unwrap_or(0);
        self.cached_tokens += usage.cached_tokens.unwrap_or(0);
    }

    /// Total tokens for this record including all children.
    #[must_use]
    pub fn total(&self) -> usize {
        self.prompt_tokens
            + self.completion_tokens
            + self.children.iter().map(UsageRecord::total).sum::<usize>()
    }

    fn merge_from(&mut self, other: &UsageRecord) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.thinking_tokens += other.thinking_tokens;
        self.cached_tokens += other.cached_tokens;
        self.children.extend(other.children.iter().cloned());
    }
}

/// Thread-safe accumulator of per-step token usage.
///
/// The tracker is cloneable and shared across concurrent extraction calls;
/// all updates are serialized behind a mutex held only for the duration of
/// the bookkeeping, never across an LLM call.
///
/// # Example
///
/// ```rust
/// use llm_extract::{UsageTracker, TokenUsage};
///
/// let tracker = UsageTracker::new();
/// tracker.record("analysis", TokenUsage::new(100, 20));
/// tracker.record_unit_call("extraction", "unit_0", TokenUsage::new(50, 10));
///
/// assert_eq!(tracker.total(), 180);
/// assert_eq!(tracker.breakdown().len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct UsageTracker {
    steps: Arc<Mutex<IndexMap<String, UsageRecord>>>,
}

impl UsageTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call's usage directly against a step.
    pub fn record(&self, step: &str, usage: TokenUsage) {
        let mut steps = self.steps.lock().unwrap();
        steps
            .entry(step.to_string())
            .or_insert_with(|| UsageRecord::new(step))
            .add(usage);
    }

    /// Record a unit-level call as a child of a step.
    ///
    /// Used by the extraction stage, where each unit's call is accounted
    /// separately under the shared `"extraction"` step.
    pub fn record_unit_call(&self, step: &str, child: &str, usage: TokenUsage) {
        let mut steps = self.steps.lock().unwrap();
        let record = steps
            .entry(step.to_string())
            .or_insert_with(|| UsageRecord::new(step));
        let mut child_record = UsageRecord::new(child);
        child_record.add(usage);
        record.children.push(child_record);
    }

    /// Merge another tracker into this one.
    ///
    /// Matching step names have their counters summed and their child lists
    /// concatenated; steps unique to `other` are appended.
    pub fn merge(&self, other: &UsageTracker) {
        let other_steps = other.steps.lock().unwrap().clone();
        let mut steps = self.steps.lock().unwrap();
        for (name, record) in &other_steps {
            steps
                .entry(name.clone())
                .or_insert_with(|| UsageRecord::new(name))
                .merge_from(record);
        }
    }

    /// Flattened total across every step and child.
    #[must_use]
    pub fn total(&self) -> usize {
        self.steps
            .lock()
            .unwrap()
            .values()
            .map(UsageRecord::total)
            .sum()
    }

    /// Snapshot of the per-step breakdown, in recording order.
    #[must_use]
    pub fn breakdown(&self) -> Vec<UsageRecord> {
        self.steps.lock().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_accumulates_per_step() {
        let tracker = UsageTracker::new();
        tracker.record(STEP_ANALYSIS, TokenUsage::new(10, 5));
        tracker.record(STEP_ANALYSIS, TokenUsage::new(7, 3));
        tracker.record(STEP_REFINEMENT, TokenUsage::new(1, 1));

        let breakdown = tracker.breakdown();
        assert_eq!(breakdown.len(), 2);
        assert_eq!(breakdown[0].step, STEP_ANALYSIS);
        assert_eq!(breakdown[0].prompt_tokens, 17);
        assert_eq!(breakdown[0].completion_tokens, 8);
        assert_eq!(tracker.total(), 27);
    }

    #[test]
    fn unit_calls_nest_under_extraction() {
        let tracker = UsageTracker::new();
        tracker.record_unit_call(STEP_EXTRACTION, "unit_0", TokenUsage::new(10, 2));
        tracker.record_unit_call(STEP_EXTRACTION, "unit_1", TokenUsage::new(20, 4));

        let breakdown = tracker.breakdown();
        assert_eq!(breakdown.len(), 1);
        assert_eq!(breakdown[0].children.len(), 2);
        assert_eq!(breakdown[0].children[1].step, "unit_1");
        assert_eq!(tracker.total(), 36);
    }

    #[test]
    fn merge_sums_matching_steps_and_concatenates_children() {
        let a = UsageTracker::new();
        a.record(STEP_ANALYSIS, TokenUsage::new(10, 0));
        a.record_unit_call(STEP_EXTRACTION, "unit_0", TokenUsage::new(5, 5));

        let b = UsageTracker::new();
        b.record(STEP_ANALYSIS, TokenUsage::new(3, 2));
        b.record_unit_call(STEP_EXTRACTION, "unit_0", TokenUsage::new(1, 1));
        b.record(STEP_GUIDE, TokenUsage::new(4, 4));

        a.merge(&b);
        let breakdown = a.breakdown();
        assert_eq!(breakdown.len(), 3);
        assert_eq!(breakdown[0].prompt_tokens, 13);
        assert_eq!(breakdown[1].children.len(), 2);
        assert_eq!(a.total(), 15 + 12 + 8);
    }

    #[test]
    fn shared_handle_updates_one_accumulator() {
        let tracker = UsageTracker::new();
        let clone = tracker.clone();
        clone.record(STEP_EXTRACTION, TokenUsage::new(9, 1));
        assert_eq!(tracker.total(), 10);
    }
}
