//! Schema synthesis: from a natural-language query to a [`RecordType`].
//!
//! Synthesis runs three structured LLM calls (analysis, refinement, schema
//! generation) and then deterministically post-processes their output into
//! an arena schema. The LLM's structured output is untrusted input: it is
//! serde-decoded, type-inferred, and structure-checked exactly like
//! extraction output, never string-parsed ad hoc.
//!
//! Refinement mode translates caller instructions into explicit edit
//! operations ([`RefineOp`]) and applies them to the existing tree. The
//! application is idempotent: an instruction the schema already satisfies
//! produces no change.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::llm::{LlmClient, SamplingParams};
use crate::prompt;
use crate::retry::RetryPolicy;
use crate::schema::{FieldKind, FieldSpec, GroupId, RecordType};
use crate::usage::{UsageTracker, STEP_ANALYSIS, STEP_REFINEMENT, STEP_SCHEMA_GENERATION};

/// Structured result of the query analysis call.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct QueryAnalysis {
    /// What the query is trying to extract.
    pub extraction_purpose: String,
    /// Whether the query asks for a collection of records per text
    /// ("each", "every", "list of") rather than a single record.
    #[serde(default)]
    pub is_collection: bool,
    /// Plural noun naming the collection, when `is_collection`.
    #[serde(default)]
    pub collection_name: Option<String>,
    /// Input column containing the text to analyze, when column metadata
    /// was available.
    #[serde(default)]
    pub target_column: Option<String>,
}

/// Structured result of the query refinement call.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct QueryRefinement {
    /// The query expanded into an explicit extraction request.
    pub refined_query: String,
    /// Characteristics of the data to extract.
    #[serde(default)]
    pub data_characteristics: Vec<String>,
}

/// One drafted field as proposed by the schema generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DraftField {
    /// Field name.
    pub name: String,
    /// Free-form type cue ("string", "date", "number of days", ...).
    #[serde(rename = "type")]
    pub type_name: String,
    /// Field description.
    #[serde(default)]
    pub description: String,
    /// Whether the field holds several items.
    #[serde(default)]
    pub is_list: bool,
    /// Fields of a nested object, when the field is structured.
    #[serde(default)]
    pub nested_fields: Option<Vec<DraftField>>,
}

/// The schema generation call's full output.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SchemaDraft {
    /// Name for the generated model.
    pub model_name: String,
    /// Description of the model's purpose.
    #[serde(default)]
    pub model_description: String,
    /// Drafted fields.
    pub fields: Vec<DraftField>,
}

/// An explicit schema edit operation, as translated from natural-language
/// refinement instructions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RefineOp {
    /// Add (or redefine) a field under the group at `parent` (dotted path,
    /// empty for the root).
    AddField {
        /// Dotted path of the parent group, empty for the root.
        #[serde(default)]
        parent: String,
        /// The field to add.
        field: DraftField,
    },
    /// Remove the field at `path`. Removing a missing field is a no-op.
    RemoveField {
        /// Dotted path of the field.
        path: String,
    },
    /// Rename the field at `path`. Renaming onto an existing name is a
    /// no-op.
    RenameField {
        /// Dotted path of the field.
        path: String,
        /// The new field name.
        new_name: String,
    },
    /// Change the type of the field at `path`, keeping its description.
    RetypeField {
        /// Dotted path of the field.
        path: String,
        /// The new type cue.
        new_type: String,
    },
}

#[derive(Debug, Deserialize, JsonSchema)]
struct RefineOps {
    #[serde(default)]
    ops: Vec<RefineOp>,
}

/// A synthesized schema plus the intermediate analysis that produced it.
#[derive(Debug, Clone)]
pub struct SynthesizedSchema {
    /// The realized record type.
    pub record_type: RecordType,
    /// The refined query, used verbatim in extraction prompts.
    pub refined_query: String,
    /// The analysis result (target column, multiplicity).
    pub analysis: QueryAnalysis,
}

/// Derives record types from natural-language queries.
pub struct SchemaSynthesizer<C> {
    client: C,
    policy: RetryPolicy,
    params: SamplingParams,
}

impl<C: LlmClient> SchemaSynthesizer<C> {
    /// Create a synthesizer over the given client.
    pub fn new(client: C, policy: RetryPolicy, params: SamplingParams) -> Self {
        Self {
            client,
            policy,
            params,
        }
    }

    async fn structured_call<T: serde::de::DeserializeOwned>(
        &self,
        step: &str,
        prompt: &crate::llm::Prompt,
        target: serde_json::Value,
        usage: &UsageTracker,
    ) -> Result<T> {
        let (result, _attempts) = self
            .policy
            .run_call(&self.client, prompt, &target, &self.params)
            .await;
        let (value, tokens) =
            result.map_err(|e| Error::SchemaGeneration(format!("{step} call failed: {e}")))?;
        usage.record(step, tokens);
        serde_json::from_value(value)
            .map_err(|e| Error::SchemaGeneration(format!("{step} returned invalid structure: {e}")))
    }

    /// Analyze the query: extraction purpose, multiplicity, target column.
    ///
    /// The model's multiplicity flag is combined with a conservative
    /// keyword fallback, so an omitted flag on an obviously plural query
    /// still yields a collection schema.
    pub async fn analyze(
        &self,
        query: &str,
        columns: &[String],
        usage: &UsageTracker,
    ) -> Result<QueryAnalysis> {
        let prompt = prompt::analysis(query, columns);
        let target = schema_value::<QueryAnalysis>();
        let mut analysis: QueryAnalysis = self
            .structured_call(STEP_ANALYSIS, &prompt, target, usage)
            .await?;
        analysis.is_collection = analysis.is_collection || detect_collection(query);
        Ok(analysis)
    }

    /// Refine the query into an explicit field enumeration.
    pub async fn refine_query(&self, query: &str, usage: &UsageTracker) -> Result<QueryRefinement> {
        let prompt = prompt::refinement(query);
        let target = schema_value::<QueryRefinement>();
        self.structured_call(STEP_REFINEMENT, &prompt, target, usage)
            .await
    }

    /// Full synthesis: analysis, refinement, schema generation, and
    /// deterministic realization of the record type.
    pub async fn synthesize(
        &self,
        query: &str,
        sample_text: Option<&str>,
        columns: &[String],
        usage: &UsageTracker,
    ) -> Result<SynthesizedSchema> {
        let analysis = self.analyze(query, columns, usage).await?;
        let refinement = self.refine_query(query, usage).await?;

        let prompt = prompt::schema(
            &refinement.refined_query,
            &refinement.data_characteristics,
            sample_text,
        );
        let target = schema_value::<SchemaDraft>();
        let draft: SchemaDraft = self
            .structured_call(STEP_SCHEMA_GENERATION, &prompt, target, usage)
            .await?;

        let record_type = realize_draft(&draft, &analysis)?;
        tracing::debug!(
            schema = %serde_json::to_string(&record_type.to_json_schema()).unwrap_or_default(),
            "synthesized record type"
        );
        Ok(SynthesizedSchema {
            record_type,
            refined_query: refinement.refined_query,
            analysis,
        })
    }

    /// Refine an existing record type with natural-language instructions.
    ///
    /// The instructions are translated into [`RefineOp`]s by one LLM call
    /// and applied deterministically; unrelated fields are preserved
    /// unchanged, and re-applying the same instructions is a no-op.
    pub async fn refine(
        &self,
        record_type: &RecordType,
        instructions: &str,
        usage: &UsageTracker,
    ) -> Result<RecordType> {
        let schema_json = serde_json::to_string_pretty(&record_type.to_json_schema())?;
        let prompt = prompt::refine_ops(&schema_json, instructions);
        let target = schema_value::<RefineOps>();
        let ops: RefineOps = self
            .structured_call(STEP_REFINEMENT, &prompt, target, usage)
            .await?;

        let mut refined = record_type.clone();
        apply_refine_ops(&mut refined, &ops.ops);
        refined.check_structure()?;
        Ok(refined)
    }
}

fn schema_value<T: JsonSchema>() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_default()
}

/// Keyword fallback for multiplicity detection.
fn detect_collection(query: &str) -> bool {
    let q = query.to_lowercase();
    ["each ", "every ", "list of ", "all "]
        .iter()
        .any(|marker| q.starts_with(marker.trim_start()) || q.contains(marker))
}

/// Infer a leaf kind from the draft's free-form type cue, falling back to
/// cues in the field name. Everything without a stronger cue is a string.
fn infer_leaf_kind(type_name: &str, field_name: &str) -> FieldKind {
    let t = type_name.to_lowercase();
    let n = field_name.to_lowercase();
    if t.contains("date") || t.contains("time") {
        FieldKind::Date
    } else if t.contains("int")
        || t.contains("float")
        || t.contains("number")
        || t.contains("count")
        || t.contains("amount")
        || t.contains("decimal")
        || t.contains("double")
    {
        FieldKind::Number
    } else if t.contains("bool") {
        FieldKind::Boolean
    } else if n.ends_with("date") || n.ends_with("_at") || n.ends_with("_on") {
        FieldKind::Date
    } else if n.contains("count") || n.contains("amount") || n.starts_with("num_") {
        FieldKind::Number
    } else if n.starts_with("is_") || n.starts_with("has_") {
        FieldKind::Boolean
    } else {
        FieldKind::String
    }
}

fn draft_is_list(field: &DraftField) -> bool {
    let t = field.type_name.to_lowercase();
    field.is_list || t.contains("list") || t.contains("array")
}

/// Build the arena subtree for one drafted field and attach it to `group`.
fn attach_draft_field(schema: &mut RecordType, group: GroupId, field: &DraftField) {
    match &field.nested_fields {
        Some(nested) if !nested.is_empty() => {
            let child = schema.push_group(group, &field.name, &field.description, draft_is_list(field));
            for inner in nested {
                attach_draft_field(schema, child, inner);
            }
        }
        _ => {
            let leaf = infer_leaf_kind(&field.type_name, &field.name);
            let kind = if draft_is_list(field) {
                FieldKind::List(Box::new(leaf))
            } else {
                leaf
            };
            schema.push_field(group, FieldSpec::new(&field.name, kind, &field.description));
        }
    }
}

/// Deterministic post-processing: realize a record type from the draft,
/// honoring the analysis' multiplicity decision.
fn realize_draft(draft: &SchemaDraft, analysis: &QueryAnalysis) -> Result<RecordType> {
    if draft.model_name.trim().is_empty() {
        return Err(Error::SchemaGeneration("draft is missing a model name".into()));
    }
    if draft.fields.is_empty() {
        return Err(Error::SchemaGeneration("draft has no fields".into()));
    }

    let mut schema = RecordType::new(draft.model_name.trim(), &draft.model_description);
    let target_group = if analysis.is_collection {
        let name = analysis
            .collection_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or("items");
        schema.push_group(
            RecordType::ROOT,
            name,
            &analysis.extraction_purpose,
            true,
        )
    } else {
        RecordType::ROOT
    };
    for field in &draft.fields {
        attach_draft_field(&mut schema, target_group, field);
    }
    schema.check_structure()?;
    Ok(schema)
}

/// Whether an existing field already satisfies a drafted definition.
fn field_matches_draft(schema: &RecordType, group: GroupId, draft: &DraftField) -> bool {
    let Some(field) = schema
        .group(group)
        .fields
        .iter()
        .find(|f| f.name == draft.name)
    else {
        return false;
    };
    match &draft.nested_fields {
        Some(nested) if !nested.is_empty() => {
            let Some(child) = schema.field_group(group, &draft.name) else {
                return false;
            };
            let list_matches = matches!(&field.kind, FieldKind::List(_)) == draft_is_list(draft);
            list_matches
                && schema.group(child).fields.len() == nested.len()
                && nested.iter().all(|inner| field_matches_draft(schema, child, inner))
        }
        _ => {
            let leaf = infer_leaf_kind(&draft.type_name, &draft.name);
            let expected = if draft_is_list(draft) {
                FieldKind::List(Box::new(leaf))
            } else {
                leaf
            };
            field.kind == expected
        }
    }
}

fn resolve_group(schema: &RecordType, path: &str) -> Option<GroupId> {
    let mut group = RecordType::ROOT;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        group = schema.field_group(group, segment)?;
    }
    Some(group)
}

fn resolve_field(schema: &RecordType, path: &str) -> Option<(GroupId, String)> {
    let (parent, name) = match path.rsplit_once('.') {
        Some((parent, name)) => (parent, name),
        None => ("", path),
    };
    if name.is_empty() {
        return None;
    }
    resolve_group(schema, parent).map(|g| (g, name.to_string()))
}

/// Apply edit operations to a record type in place.
///
/// Each operation is individually idempotent; operations addressing paths
/// that do not exist are skipped. A retype or redefinition fully replaces
/// the previous field definition.
pub fn apply_refine_ops(schema: &mut RecordType, ops: &[RefineOp]) {
    for op in ops {
        match op {
            RefineOp::AddField { parent, field } => {
                let Some(group) = resolve_group(schema, parent) else {
                    tracing::warn!(parent, "refine: unknown parent group, skipping add");
                    continue;
                };
                if field_matches_draft(schema, group, field) {
                    continue;
                }
                tracing::info!(field = %field.name, "refine: redefining field");
                attach_draft_field(schema, group, field);
            }
            RefineOp::RemoveField { path } => {
                if let Some((group, name)) = resolve_field(schema, path) {
                    schema.remove_field(group, &name);
                }
            }
            RefineOp::RenameField { path, new_name } => {
                let Some((group, name)) = resolve_field(schema, path) else {
                    continue;
                };
                if name == *new_name {
                    continue;
                }
                let group_fields = &schema.group(group).fields;
                let exists = group_fields.iter().any(|f| f.name == name);
                let target_taken = group_fields.iter().any(|f| f.name == *new_name);
                if !exists || target_taken {
                    continue;
                }
                if let Some(field) = schema
                    .group_mut(group)
                    .fields
                    .iter_mut()
                    .find(|f| f.name == name)
                {
                    field.name = new_name.clone();
                }
            }
            RefineOp::RetypeField { path, new_type } => {
                let Some((group, name)) = resolve_field(schema, path) else {
                    continue;
                };
                let new_kind = infer_leaf_kind(new_type, &name);
                let new_kind = if new_type.to_lowercase().contains("list")
                    || new_type.to_lowercase().contains("array")
                {
                    FieldKind::List(Box::new(new_kind))
                } else {
                    new_kind
                };
                if let Some(field) = schema
                    .group_mut(group)
                    .fields
                    .iter_mut()
                    .find(|f| f.name == name)
                {
                    if field.kind != new_kind {
                        tracing::info!(path, ?new_kind, "refine: replacing field type");
                        field.kind = new_kind;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(fields: Vec<DraftField>) -> SchemaDraft {
        SchemaDraft {
            model_name: "Incident".into(),
            model_description: "Incidents in a report".into(),
            fields,
        }
    }

    fn leaf(name: &str, type_name: &str) -> DraftField {
        DraftField {
            name: name.into(),
            type_name: type_name.into(),
            description: format!("the {name}"),
            is_list: false,
            nested_fields: None,
        }
    }

    #[test]
    fn collection_markers_detected() {
        assert!(detect_collection("extract each incident's date"));
        assert!(detect_collection("list of vendors and amounts"));
        assert!(!detect_collection("extract the invoice total"));
    }

    #[test]
    fn type_cues_drive_kind_inference() {
        assert_eq!(infer_leaf_kind("date-time", "x"), FieldKind::Date);
        assert_eq!(infer_leaf_kind("number of days", "x"), FieldKind::Number);
        assert_eq!(infer_leaf_kind("boolean", "x"), FieldKind::Boolean);
        assert_eq!(infer_leaf_kind("text", "start_date"), FieldKind::Date);
        assert_eq!(infer_leaf_kind("string", "error_count"), FieldKind::Number);
        assert_eq!(infer_leaf_kind("string", "is_resolved"), FieldKind::Boolean);
        assert_eq!(infer_leaf_kind("string", "summary"), FieldKind::String);
    }

    #[test]
    fn collection_query_wraps_fields_in_list_of_object() {
        let analysis = QueryAnalysis {
            extraction_purpose: "incidents".into(),
            is_collection: true,
            collection_name: Some("incidents".into()),
            target_column: None,
        };
        let schema = realize_draft(
            &draft(vec![leaf("date", "date"), leaf("resolution_steps", "list of strings")]),
            &analysis,
        )
        .unwrap();

        let root = &schema.group(RecordType::ROOT).fields;
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].name, "incidents");
        assert!(matches!(root[0].kind, FieldKind::List(_)));
        let leaves = schema.leaves();
        let paths: Vec<&str> = leaves.iter().map(|l| l.path.as_str()).collect();
        assert_eq!(paths, vec!["incidents.date", "incidents.resolution_steps"]);
        assert_eq!(leaves[0].kind, FieldKind::Date);
    }

    #[test]
    fn singular_query_keeps_fields_at_root() {
        let analysis = QueryAnalysis {
            extraction_purpose: "invoice".into(),
            is_collection: false,
            collection_name: None,
            target_column: None,
        };
        let schema =
            realize_draft(&draft(vec![leaf("total_amount", "number")]), &analysis).unwrap();
        assert_eq!(schema.leaves()[0].path, "total_amount");
    }

    #[test]
    fn empty_draft_is_rejected() {
        let analysis = QueryAnalysis {
            extraction_purpose: "x".into(),
            is_collection: false,
            collection_name: None,
            target_column: None,
        };
        assert!(matches!(
            realize_draft(&draft(vec![]), &analysis),
            Err(Error::SchemaGeneration(_))
        ));
        let mut unnamed = draft(vec![leaf("a", "string")]);
        unnamed.model_name = "  ".into();
        assert!(realize_draft(&unnamed, &analysis).is_err());
    }

    #[test]
    fn add_existing_field_is_a_no_op() {
        let analysis = QueryAnalysis {
            extraction_purpose: "x".into(),
            is_collection: false,
            collection_name: None,
            target_column: None,
        };
        let mut schema =
            realize_draft(&draft(vec![leaf("date", "date"), leaf("summary", "string")]), &analysis)
                .unwrap();
        let before = schema.clone();

        let ops = vec![RefineOp::AddField {
            parent: String::new(),
            field: leaf("date", "date"),
        }];
        apply_refine_ops(&mut schema, &ops);
        assert_eq!(schema, before);

        // Applying twice is the same as applying once.
        apply_refine_ops(&mut schema, &ops);
        assert_eq!(schema, before);
    }

    #[test]
    fn retype_replaces_definition_and_is_idempotent() {
        let analysis = QueryAnalysis {
            extraction_purpose: "x".into(),
            is_collection: false,
            collection_name: None,
            target_column: None,
        };
        let mut schema =
            realize_draft(&draft(vec![leaf("severity", "string")]), &analysis).unwrap();

        let ops = vec![RefineOp::RetypeField {
            path: "severity".into(),
            new_type: "number".into(),
        }];
        apply_refine_ops(&mut schema, &ops);
        assert_eq!(
            schema.group(RecordType::ROOT).fields[0].kind,
            FieldKind::Number
        );
        let after_first = schema.clone();
        apply_refine_ops(&mut schema, &ops);
        assert_eq!(schema, after_first);
    }

    #[test]
    fn rename_skips_taken_names_and_missing_fields() {
        let analysis = QueryAnalysis {
            extraction_purpose: "x".into(),
            is_collection: false,
            collection_name: None,
            target_column: None,
        };
        let mut schema = realize_draft(
            &draft(vec![leaf("a", "string"), leaf("b", "string")]),
            &analysis,
        )
        .unwrap();

        apply_refine_ops(
            &mut schema,
            &[RefineOp::RenameField {
                path: "a".into(),
                new_name: "b".into(),
            }],
        );
        // "b" already exists; nothing changed.
        assert_eq!(schema.group(RecordType::ROOT).fields[0].name, "a");

        apply_refine_ops(
            &mut schema,
            &[RefineOp::RenameField {
                path: "a".into(),
                new_name: "alpha".into(),
            }],
        );
        assert_eq!(schema.group(RecordType::ROOT).fields[0].name, "alpha");
    }

    #[test]
    fn remove_then_remove_again_is_stable() {
        let analysis = QueryAnalysis {
            extraction_purpose: "x".into(),
            is_collection: false,
            collection_name: None,
            target_column: None,
        };
        let mut schema = realize_draft(
            &draft(vec![leaf("a", "string"), leaf("b", "string")]),
            &analysis,
        )
        .unwrap();
        let ops = vec![RefineOp::RemoveField { path: "a".into() }];
        apply_refine_ops(&mut schema, &ops);
        assert_eq!(schema.group(RecordType::ROOT).fields.len(), 1);
        apply_refine_ops(&mut schema, &ops);
        assert_eq!(schema.group(RecordType::ROOT).fields.len(), 1);
    }

    #[test]
    fn nested_draft_builds_object_group() {
        let analysis = QueryAnalysis {
            extraction_purpose: "x".into(),
            is_collection: false,
            collection_name: None,
            target_column: None,
        };
        let nested = DraftField {
            name: "metrics".into(),
            type_name: "object".into(),
            description: "performance metrics".into(),
            is_list: false,
            nested_fields: Some(vec![leaf("cpu_count", "integer"), leaf("host", "string")]),
        };
        let schema = realize_draft(&draft(vec![nested]), &analysis).unwrap();
        let leaves = schema.leaves();
        let paths: Vec<&str> = leaves.iter().map(|l| l.path.as_str()).collect();
        assert_eq!(paths, vec!["metrics.cpu_count", "metrics.host"]);
        assert_eq!(schema.group(1).name, "Incident.metrics");
    }
}
