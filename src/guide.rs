//! Guide generation: mapping record fields onto known input columns.
//!
//! When the caller already has a [`RecordType`], schema synthesis is skipped
//! and a [`FieldGuide`] primes extraction prompts instead. The guide maps
//! leaf field paths to column/source hints; an unmapped field is not an
//! error, the executor simply extracts it from raw text.

use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::Deserialize;

use crate::llm::{LlmClient, SamplingParams};
use crate::prompt;
use crate::schema::RecordType;
use crate::usage::{UsageTracker, STEP_GUIDE};

/// A mapping from leaf field paths to column/source hints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldGuide {
    mappings: IndexMap<String, String>,
}

impl FieldGuide {
    /// Add or replace a mapping.
    pub fn insert(&mut self, path: impl Into<String>, hint: impl Into<String>) {
        self.mappings.insert(path.into(), hint.into());
    }

    /// The hint for a leaf path, if mapped.
    pub fn get(&self, path: &str) -> Option<&str> {
        self.mappings.get(path).map(String::as_str)
    }

    /// Iterate mappings in insertion order.
    pub fn mappings(&self) -> impl Iterator<Item = (&str, &str)> {
        self.mappings.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether no field is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Number of mapped fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mappings.len()
    }
}

/// LLM output shape for the guide stage. Untrusted; validated before use.
#[derive(Debug, Deserialize, JsonSchema)]
struct GuideDraft {
    /// Proposed field-to-column mappings.
    mappings: Vec<GuideMapping>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct GuideMapping {
    /// Dotted leaf field path.
    field: String,
    /// Column or source name the value is expected in.
    column: String,
}

/// Builds a [`FieldGuide`] for a caller-supplied record type.
pub struct GuideGenerator<C> {
    client: C,
    params: SamplingParams,
}

impl<C: LlmClient> GuideGenerator<C> {
    /// Create a generator over the given client.
    pub fn new(client: C, params: SamplingParams) -> Self {
        Self { client, params }
    }

    /// Map the record type's leaf fields onto the available columns.
    ///
    /// One LLM call proposes mappings; proposals naming unknown fields or
    /// columns are discarded, and leaves the model left unmapped fall back
    /// to normalized-name matching. Anything still unmapped stays unmapped.
    /// A failed guide call degrades to the name-matching fallback alone.
    pub async fn generate(
        &self,
        record_type: &RecordType,
        columns: &[String],
        usage: &UsageTracker,
    ) -> FieldGuide {
        let leaves = record_type.leaves();
        let mut guide = FieldGuide::default();
        if leaves.is_empty() || columns.is_empty() {
            return guide;
        }

        let prompt = prompt::guide(&leaves, columns);
        let target = schemars::schema_for!(GuideDraft);
        let target = serde_json::to_value(target).unwrap_or_default();

        match self.client.call(&prompt, &target, &self.params).await {
            Ok((value, tokens)) => {
                usage.record(STEP_GUIDE, tokens);
                if let Ok(draft) = serde_json::from_value::<GuideDraft>(value) {
                    for mapping in draft.mappings {
                        let known_field = leaves.iter().any(|l| l.path == mapping.field);
                        // Store the actual column name, not the model's
                        // spelling of it.
                        let known_column = columns
                            .iter()
                            .find(|c| normalize(c) == normalize(&mapping.column));
                        if let (true, Some(column)) = (known_field, known_column) {
                            guide.insert(mapping.field, column.clone());
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "guide call failed; using name matching only");
            }
        }

        // Fallback for leaves the model left unmapped.
        for leaf in &leaves {
            if guide.get(&leaf.path).is_some() {
                continue;
            }
            let tail = leaf.path.rsplit('.').next().unwrap_or(&leaf.path);
            if let Some(column) = columns.iter().find(|c| normalize(c) == normalize(tail)) {
                guide.insert(leaf.path.clone(), column.clone());
            }
        }

        guide
    }
}

fn normalize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_sep = true;
    for ch in name.chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_sep = false;
        } else if !last_sep {
            out.push('_');
            last_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::schema::{FieldKind, FieldSpec};
    use crate::testing::MockLlm;
    use serde_json::json;

    fn incident_type() -> RecordType {
        let mut schema = RecordType::new("Incident", "one incident");
        schema.push_field(
            RecordType::ROOT,
            FieldSpec::new("date", FieldKind::Date, "when it occurred"),
        );
        schema.push_field(
            RecordType::ROOT,
            FieldSpec::new("summary", FieldKind::String, "what happened"),
        );
        schema
    }

    #[tokio::test]
    async fn unmapped_leaves_fall_back_to_normalized_name_matching() {
        // The model maps only "date", spelling the column its own way.
        let mock = MockLlm::new().with_response(json!({
            "mappings": [{"field": "date", "column": "EVENT_DATE"}],
        }));
        let generator = GuideGenerator::new(mock, SamplingParams::default());
        let columns = vec!["event_date".to_string(), "Summary".to_string()];
        let guide = generator
            .generate(&incident_type(), &columns, &UsageTracker::new())
            .await;

        // The proposal is kept under the actual column spelling.
        assert_eq!(guide.get("date"), Some("event_date"));
        // The leaf the model skipped is matched by normalized name.
        assert_eq!(guide.get("summary"), Some("Summary"));
        assert_eq!(guide.len(), 2);
    }

    #[tokio::test]
    async fn failed_guide_call_degrades_to_name_matching_alone() {
        let mock = MockLlm::new().with_failure(LlmError::timeout("deadline"));
        let generator = GuideGenerator::new(mock, SamplingParams::default());
        let columns = vec!["Incident Date".to_string(), "severity".to_string()];
        let guide = generator
            .generate(&incident_type(), &columns, &UsageTracker::new())
            .await;

        // "date" does not normalize to "incident_date"; "summary" matches
        // nothing either, so only exact normalized matches survive.
        assert_eq!(guide.get("date"), None);
        assert!(guide.is_empty());

        let mock = MockLlm::new().with_failure(LlmError::timeout("deadline"));
        let generator = GuideGenerator::new(mock, SamplingParams::default());
        let columns = vec!["Date".to_string(), "summary".to_string()];
        let guide = generator
            .generate(&incident_type(), &columns, &UsageTracker::new())
            .await;
        assert_eq!(guide.get("date"), Some("Date"));
        assert_eq!(guide.get("summary"), Some("summary"));
    }

    #[test]
    fn normalize_collapses_separators_and_case() {
        assert_eq!(normalize("Incident Date"), "incident_date");
        assert_eq!(normalize("incident-date "), "incident_date");
        assert_eq!(normalize("IncidentDate"), "incidentdate");
    }

    #[test]
    fn guide_lookup_and_order() {
        let mut guide = FieldGuide::default();
        guide.insert("a", "col_a");
        guide.insert("b", "col_b");
        assert_eq!(guide.get("a"), Some("col_a"));
        assert_eq!(guide.get("missing"), None);
        let order: Vec<&str> = guide.mappings().map(|(k, _)| k).collect();
        assert_eq!(order, vec!["a", "b"]);
    }
}
