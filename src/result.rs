//! Aggregated extraction results and tabular projection.
//!
//! Aggregation is a pure fold over the per-unit outcomes: counts, a
//! failure list, and on demand a flattened tabular view in which nested
//! groups become dotted columns and list-of-object fields expand into
//! repeated rows or list-typed columns, as the caller selects.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LlmErrorKind;
use crate::schema::{FieldKind, GroupId, Record, RecordType};
use crate::unit::{ExtractionOutcome, UnitId};

/// How list-of-object fields are projected into the tabular view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListMode {
    /// Each list item produces its own row; scalar fields repeat.
    #[default]
    Rows,
    /// The list stays in one row as a list-typed column.
    Columns,
}

/// One failed unit, as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// The failed unit's identifier.
    pub unit_id: UnitId,
    /// Classification of the final error.
    pub kind: LlmErrorKind,
    /// Message of the final error.
    pub message: String,
    /// Total attempts made for the unit.
    pub attempts: u32,
}

/// The complete result of one extraction request.
///
/// Holds one outcome per input unit in input order. Immutable after
/// construction; `success_count + failure_count` always equals the number
/// of input units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    outcomes: Vec<ExtractionOutcome>,
    record_type: RecordType,
    success_count: usize,
    failure_count: usize,
}

impl ExtractionResult {
    /// Fold per-unit outcomes into a result.
    #[must_use]
    pub fn aggregate(outcomes: Vec<ExtractionOutcome>, record_type: RecordType) -> Self {
        let success_count = outcomes.iter().filter(|o| o.is_success()).count();
        let failure_count = outcomes.len() - success_count;
        Self {
            outcomes,
            record_type,
            success_count,
            failure_count,
        }
    }

    /// All outcomes, in input order.
    pub fn outcomes(&self) -> &[ExtractionOutcome] {
        &self.outcomes
    }

    /// The record type the units were extracted against.
    pub fn record_type(&self) -> &RecordType {
        &self.record_type
    }

    /// Number of units that produced records.
    #[must_use]
    pub fn success_count(&self) -> usize {
        self.success_count
    }

    /// Number of units that failed.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.failure_count
    }

    /// Total number of units.
    #[must_use]
    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    /// Success rate as a percentage; 0 when there were no units.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            0.0
        } else {
            self.success_count as f64 / total as f64 * 100.0
        }
    }

    /// All successfully extracted records, in unit order.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.outcomes.iter().flat_map(|o| match o {
            ExtractionOutcome::Success { records, .. } => records.as_slice(),
            ExtractionOutcome::Failure { .. } => &[] as &[Record],
        })
    }

    /// Failure records for every failed unit, in unit order.
    #[must_use]
    pub fn failed(&self) -> Vec<FailureRecord> {
        self.outcomes
            .iter()
            .filter_map(|o| match o {
                ExtractionOutcome::Failure {
                    unit_id,
                    kind,
                    message,
                    attempts,
                } => Some(FailureRecord {
                    unit_id: *unit_id,
                    kind: *kind,
                    message: message.clone(),
                    attempts: *attempts,
                }),
                ExtractionOutcome::Success { .. } => None,
            })
            .collect()
    }

    /// Flatten successful records into tabular rows.
    ///
    /// Columns are dotted leaf paths prefixed by a `unit_id` column. In
    /// [`ListMode::Rows`], list-of-object fields multiply rows; in
    /// [`ListMode::Columns`], the list stays in one cell.
    #[must_use]
    pub fn rows(&self, mode: ListMode) -> Vec<IndexMap<String, Value>> {
        let mut out = Vec::new();
        for outcome in &self.outcomes {
            let ExtractionOutcome::Success { unit_id, records, .. } = outcome else {
                continue;
            };
            for record in records {
                for mut row in flatten_group(&self.record_type, RecordType::ROOT, "", record, mode)
                {
                    let mut full = IndexMap::with_capacity(row.len() + 1);
                    full.insert("unit_id".to_string(), Value::from(*unit_id));
                    full.extend(row.drain(..));
                    out.push(full);
                }
            }
        }
        out
    }
}

type Row = IndexMap<String, Value>;

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Flatten one object value against a group, producing one or more rows.
fn flatten_group(
    record_type: &RecordType,
    group: GroupId,
    prefix: &str,
    value: &Value,
    mode: ListMode,
) -> Vec<Row> {
    let mut rows: Vec<Row> = vec![IndexMap::new()];
    for field in &record_type.group(group).fields {
        let path = join_path(prefix, &field.name);
        let raw = value.get(&field.name).cloned().unwrap_or(Value::Null);
        match &field.kind {
            FieldKind::Object(child) => {
                let sub = flatten_group(record_type, *child, &path, &raw, mode);
                rows = cross_join(rows, sub);
            }
            FieldKind::List(inner) => match inner.as_ref() {
                FieldKind::Object(child) => match mode {
                    ListMode::Rows => {
                        let items = raw.as_array().cloned().unwrap_or_default();
                        let sub = if items.is_empty() {
                            null_row(record_type, *child, &path)
                        } else {
                            items
                                .iter()
                                .flat_map(|item| {
                                    flatten_group(record_type, *child, &path, item, mode)
                                })
                                .collect()
                        };
                        rows = cross_join(rows, sub);
                    }
                    ListMode::Columns => {
                        for row in &mut rows {
                            row.insert(path.clone(), raw.clone());
                        }
                    }
                },
                _ => {
                    for row in &mut rows {
                        row.insert(path.clone(), raw.clone());
                    }
                }
            },
            _ => {
                for row in &mut rows {
                    row.insert(path.clone(), raw.clone());
                }
            }
        }
    }
    rows
}

/// A single all-null row covering the leaf columns under a group.
fn null_row(record_type: &RecordType, group: GroupId, prefix: &str) -> Vec<Row> {
    let mut row = IndexMap::new();
    for field in &record_type.group(group).fields {
        let path = join_path(prefix, &field.name);
        match &field.kind {
            FieldKind::Object(child) => {
                for sub in null_row(record_type, *child, &path) {
                    row.extend(sub);
                }
            }
            FieldKind::List(inner) => {
                if let FieldKind::Object(child) = inner.as_ref() {
                    for sub in null_row(record_type, *child, &path) {
                        row.extend(sub);
                    }
                } else {
                    row.insert(path, Value::Null);
                }
            }
            _ => {
                row.insert(path, Value::Null);
            }
        }
    }
    vec![row]
}

fn cross_join(left: Vec<Row>, right: Vec<Row>) -> Vec<Row> {
    if right.is_empty() {
        return left;
    }
    let mut out = Vec::with_capacity(left.len() * right.len());
    for l in &left {
        for r in &right {
            let mut row = l.clone();
            row.extend(r.clone());
            out.push(row);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldSpec;
    use serde_json::json;

    fn incident_type() -> RecordType {
        let mut schema = RecordType::new("Incident", "incident");
        schema.push_field(
            RecordType::ROOT,
            FieldSpec::new("date", FieldKind::Date, "when"),
        );
        let steps = schema.push_group(RecordType::ROOT, "steps", "steps", true);
        schema.push_field(steps, FieldSpec::new("action", FieldKind::String, "what"));
        schema
    }

    fn success(unit_id: usize, records: Vec<Record>) -> ExtractionOutcome {
        ExtractionOutcome::Success {
            unit_id,
            records,
            attempts: 1,
        }
    }

    fn failure(unit_id: usize) -> ExtractionOutcome {
        ExtractionOutcome::Failure {
            unit_id,
            kind: LlmErrorKind::InvalidResponse,
            message: "validation failed".into(),
            attempts: 1,
        }
    }

    #[test]
    fn three_successes_two_failures_is_sixty_percent() {
        let outcomes = vec![
            success(0, vec![json!({"date": null, "steps": null})]),
            failure(1),
            success(2, vec![]),
            failure(3),
            success(4, vec![]),
        ];
        let result = ExtractionResult::aggregate(outcomes, incident_type());
        assert_eq!(result.success_count(), 3);
        assert_eq!(result.failure_count(), 2);
        assert_eq!(result.total(), 5);
        assert!((result.success_rate() - 60.0).abs() < f64::EPSILON);
        assert_eq!(result.failed().len(), 2);
        assert_eq!(result.failed()[0].unit_id, 1);
    }

    #[test]
    fn empty_result_has_zero_rate() {
        let result = ExtractionResult::aggregate(vec![], incident_type());
        assert_eq!(result.success_rate(), 0.0);
        assert_eq!(result.total(), 0);
    }

    #[test]
    fn rows_mode_expands_list_items_into_rows() {
        let record = json!({
            "date": "2024-01-01",
            "steps": [{"action": "a"}, {"action": "b"}],
        });
        let result =
            ExtractionResult::aggregate(vec![success(7, vec![record])], incident_type());
        let rows = result.rows(ListMode::Rows);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["unit_id"], json!(7));
        assert_eq!(rows[0]["date"], json!("2024-01-01"));
        assert_eq!(rows[0]["steps.action"], json!("a"));
        assert_eq!(rows[1]["steps.action"], json!("b"));
        assert_eq!(rows[1]["date"], json!("2024-01-01"));
    }

    #[test]
    fn columns_mode_keeps_list_in_one_cell() {
        let record = json!({
            "date": "2024-01-01",
            "steps": [{"action": "a"}, {"action": "b"}],
        });
        let result =
            ExtractionResult::aggregate(vec![success(0, vec![record])], incident_type());
        let rows = result.rows(ListMode::Columns);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["steps"], json!([{"action": "a"}, {"action": "b"}]));
    }

    #[test]
    fn empty_list_still_yields_one_row_with_null_columns() {
        let record = json!({"date": "2024-01-01", "steps": null});
        let result =
            ExtractionResult::aggregate(vec![success(0, vec![record])], incident_type());
        let rows = result.rows(ListMode::Rows);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["steps.action"], Value::Null);
    }

    #[test]
    fn failures_produce_no_rows_but_are_listed() {
        let result = ExtractionResult::aggregate(vec![failure(3)], incident_type());
        assert!(result.rows(ListMode::Rows).is_empty());
        let failed = result.failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts, 1);
    }
}
