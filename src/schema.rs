//! Dynamic record schemas.
//!
//! A [`RecordType`] is an explicit, serializable schema tree rather than a
//! language-native type: an arena of [`FieldGroup`] nodes addressed by
//! [`GroupId`], with group 0 as the root record. Validation, JSON Schema
//! projection, and flattening all operate generically over this tree, so a
//! schema synthesized at request time needs no code generation.
//!
//! Every field is optional with a null default: extraction may legitimately
//! find nothing, and a value that cannot be safely coerced to its declared
//! kind resolves to null instead of failing the unit.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};

/// Index of a [`FieldGroup`] within its [`RecordType`] arena.
pub type GroupId = usize;

/// A validated record instance: a JSON object coerced against a [`RecordType`].
pub type Record = Value;

/// The semantic type of a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Free text.
    String,
    /// Integer or floating-point number.
    Number,
    /// True/false.
    Boolean,
    /// A date or date-time, carried as an ISO 8601 string.
    Date,
    /// A nested object described by the referenced group.
    Object(GroupId),
    /// A homogeneous list of the inner kind.
    List(Box<FieldKind>),
}

impl FieldKind {
    /// A list of nested objects.
    pub fn list_of(group: GroupId) -> Self {
        FieldKind::List(Box::new(FieldKind::Object(group)))
    }

    fn group_ref(&self) -> Option<GroupId> {
        match self {
            FieldKind::Object(id) => Some(*id),
            FieldKind::List(inner) => inner.group_ref(),
            _ => None,
        }
    }
}

/// One field of a record: name, kind, and human description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field name, unique within its group.
    pub name: String,
    /// Semantic type.
    pub kind: FieldKind,
    /// What this field represents, fed into extraction prompts.
    pub description: String,
}

impl FieldSpec {
    /// Create a field spec.
    pub fn new(name: impl Into<String>, kind: FieldKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            description: description.into(),
        }
    }
}

/// A node in the schema tree: the ordered fields of one (possibly nested)
/// object, plus its position in the tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldGroup {
    /// Synthesized unique name (`Root`, `Root.incidents`, ...), preventing
    /// collisions between same-named fields at different nesting levels.
    pub name: String,
    /// Parent group, `None` only for the root.
    pub parent: Option<GroupId>,
    /// Nesting depth, 0 for the root.
    pub depth: usize,
    /// Ordered fields of this object.
    pub fields: Vec<FieldSpec>,
}

/// A leaf field with its dotted path from the root, as used by guides and
/// tabular flattening.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafField {
    /// Dotted path, e.g. `incidents.date`.
    pub path: String,
    /// The leaf's kind (never `Object`).
    pub kind: FieldKind,
    /// The leaf's description.
    pub description: String,
    /// Nesting depth of the owning group.
    pub depth: usize,
}

/// A named, ordered set of fields with resolved types.
///
/// Built once per request (or refinement) and reused across all units of
/// that request.
///
/// Record types built through [`push_field`](RecordType::push_field) and
/// [`push_group`](RecordType::push_group) are structurally valid by
/// construction. A record type deserialized from external data carries
/// arbitrary group indices; pass it through
/// [`check_structure`](RecordType::check_structure) before use, as group
/// lookups index the arena directly. Synthesis does this for every schema
/// it decodes.
///
/// # Example
///
/// ```rust
/// use llm_extract::{RecordType, FieldSpec, FieldKind};
///
/// let mut schema = RecordType::new("Incident", "One reported incident");
/// schema.push_field(
///     RecordType::ROOT,
///     FieldSpec::new("date", FieldKind::Date, "When the incident occurred"),
/// );
/// let steps = schema.push_group(RecordType::ROOT, "steps", "One resolution step", true);
/// schema.push_field(steps, FieldSpec::new("action", FieldKind::String, "What was done"));
///
/// assert_eq!(schema.leaves().len(), 2);
/// assert_eq!(schema.leaves()[1].path, "steps.action");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordType {
    /// Model name.
    pub name: String,
    /// Model purpose.
    pub description: String,
    groups: Vec<FieldGroup>,
}

impl RecordType {
    /// The root group id.
    pub const ROOT: GroupId = 0;

    /// Create an empty record type with a root group.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            groups: vec![FieldGroup {
                name: name.clone(),
                parent: None,
                depth: 0,
                fields: Vec::new(),
            }],
            name,
            description: description.into(),
        }
    }

    /// All groups, root first.
    pub fn groups(&self) -> &[FieldGroup] {
        &self.groups
    }

    /// Look up a group by id.
    pub fn group(&self, id: GroupId) -> &FieldGroup {
        &self.groups[id]
    }

    pub(crate) fn group_mut(&mut self, id: GroupId) -> &mut FieldGroup {
        &mut self.groups[id]
    }

    /// Append a field to a group. Re-adding a field with the same name
    /// replaces the existing definition in place (no duplicates).
    pub fn push_field(&mut self, group: GroupId, field: FieldSpec) {
        let fields = &mut self.groups[group].fields;
        if let Some(existing) = fields.iter_mut().find(|f| f.name == field.name) {
            *existing = field;
        } else {
            fields.push(field);
        }
    }

    /// Create a nested group and attach it to `parent` as an object field
    /// (or list-of-object field when `list` is true). Returns the new
    /// group's id.
    pub fn push_group(
        &mut self,
        parent: GroupId,
        field_name: &str,
        description: &str,
        list: bool,
    ) -> GroupId {
        let group_name = format!("{}.{}", self.groups[parent].name, field_name);
        let depth = self.groups[parent].depth + 1;
        let id = self.groups.len();
        self.groups.push(FieldGroup {
            name: group_name,
            parent: Some(parent),
            depth,
            fields: Vec::new(),
        });
        let kind = if list {
            FieldKind::list_of(id)
        } else {
            FieldKind::Object(id)
        };
        self.push_field(parent, FieldSpec::new(field_name, kind, description));
        id
    }

    /// Remove a field from a group by name. Returns whether it existed.
    /// Any group the field referenced stays in the arena but becomes
    /// unreachable and is ignored by validation and flattening.
    pub fn remove_field(&mut self, group: GroupId, name: &str) -> bool {
        let fields = &mut self.groups[group].fields;
        let before = fields.len();
        fields.retain(|f| f.name != name);
        fields.len() != before
    }

    /// Find the group id reached by an object field, if any.
    pub fn field_group(&self, group: GroupId, name: &str) -> Option<GroupId> {
        self.groups[group]
            .fields
            .iter()
            .find(|f| f.name == name)
            .and_then(|f| f.kind.group_ref())
    }

    /// Leaf fields in tree order with dotted paths from the root.
    #[must_use]
    pub fn leaves(&self) -> Vec<LeafField> {
        let mut out = Vec::new();
        self.collect_leaves(Self::ROOT, "", &mut out);
        out
    }

    fn collect_leaves(&self, group: GroupId, prefix: &str, out: &mut Vec<LeafField>) {
        for field in &self.groups[group].fields {
            let path = if prefix.is_empty() {
                field.name.clone()
            } else {
                format!("{prefix}.{}", field.name)
            };
            match field.kind.group_ref() {
                Some(child) => self.collect_leaves(child, &path, out),
                None => out.push(LeafField {
                    path,
                    kind: field.kind.clone(),
                    description: field.description.clone(),
                    depth: self.groups[group].depth,
                }),
            }
        }
    }

    /// Check structural invariants: parent references in range, acyclic,
    /// consistent depths, non-empty field names. Used when accepting a
    /// schema decoded from untrusted synthesis output.
    pub fn check_structure(&self) -> Result<()> {
        if self.groups.is_empty() {
            return Err(Error::SchemaGeneration("schema has no root group".into()));
        }
        for (id, group) in self.groups.iter().enumerate() {
            if id == Self::ROOT {
                if group.parent.is_some() {
                    return Err(Error::SchemaGeneration("root group has a parent".into()));
                }
                continue;
            }
            match group.parent {
                None => {
                    return Err(Error::SchemaGeneration(format!(
                        "group '{}' has no parent",
                        group.name
                    )))
                }
                Some(p) if p >= self.groups.len() => {
                    return Err(Error::SchemaGeneration(format!(
                        "group '{}' references missing parent {p}",
                        group.name
                    )))
                }
                Some(_) => {}
            }
        }
        for (id, group) in self.groups.iter().enumerate() {
            // Walk to the root; a walk longer than the arena means a cycle.
            let mut cursor = group.parent;
            let mut hops = 0usize;
            while let Some(p) = cursor {
                hops += 1;
                if hops > self.groups.len() {
                    return Err(Error::SchemaGeneration(format!(
                        "cyclic nesting through group '{}'",
                        group.name
                    )));
                }
                cursor = self.groups[p].parent;
            }
            if hops != group.depth {
                return Err(Error::SchemaGeneration(format!(
                    "group '{}' has depth {} but is {} hops from the root",
                    group.name, group.depth, hops
                )));
            }
            for field in &group.fields {
                if field.name.is_empty() {
                    return Err(Error::SchemaGeneration(format!(
                        "group '{}' contains an unnamed field",
                        self.groups[id].name
                    )));
                }
                if let Some(child) = field.kind.group_ref() {
                    if child >= self.groups.len() {
                        return Err(Error::SchemaGeneration(format!(
                            "field '{}' references missing group {child}",
                            field.name
                        )));
                    }
                    if self.groups[child].parent != Some(id) {
                        return Err(Error::SchemaGeneration(format!(
                            "field '{}' references group '{}' owned by another parent",
                            field.name, self.groups[child].name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Project this record type as a JSON Schema document.
    ///
    /// Every field is nullable; objects forbid unknown properties so the
    /// provider cannot smuggle extra fields past validation.
    #[must_use]
    pub fn to_json_schema(&self) -> Value {
        let mut schema = self.group_schema(Self::ROOT);
        if let Value::Object(map) = &mut schema {
            map.insert("title".into(), json!(self.name));
            map.insert("description".into(), json!(self.description));
        }
        schema
    }

    fn group_schema(&self, group: GroupId) -> Value {
        let mut properties = Map::new();
        for field in &self.groups[group].fields {
            let mut prop = self.kind_schema(&field.kind);
            if let Value::Object(map) = &mut prop {
                map.insert("description".into(), json!(field.description));
            }
            properties.insert(field.name.clone(), prop);
        }
        json!({
            "type": "object",
            "properties": properties,
            "additionalProperties": false,
        })
    }

    fn kind_schema(&self, kind: &FieldKind) -> Value {
        match kind {
            FieldKind::String => json!({ "type": ["string", "null"] }),
            FieldKind::Number => json!({ "type": ["number", "null"] }),
            FieldKind::Boolean => json!({ "type": ["boolean", "null"] }),
            FieldKind::Date => json!({ "type": ["string", "null"], "format": "date-time" }),
            FieldKind::Object(id) => self.group_schema(*id),
            FieldKind::List(inner) => json!({
                "type": ["array", "null"],
                "items": self.kind_schema(inner),
            }),
        }
    }

    /// Coerce a candidate value into a valid record.
    ///
    /// Unknown fields are dropped, missing fields become null, and values
    /// that cannot be safely coerced to their declared kind become null.
    /// A non-object input yields an all-null record.
    #[must_use]
    pub fn coerce_record(&self, value: &Value) -> Record {
        self.coerce_group(Self::ROOT, value)
    }

    fn coerce_group(&self, group: GroupId, value: &Value) -> Value {
        let source = value.as_object();
        let mut out = Map::new();
        for field in &self.groups[group].fields {
            let raw = source.and_then(|m| m.get(&field.name)).unwrap_or(&Value::Null);
            out.insert(field.name.clone(), self.coerce_kind(&field.kind, raw));
        }
        Value::Object(out)
    }

    fn coerce_kind(&self, kind: &FieldKind, value: &Value) -> Value {
        if value.is_null() {
            return Value::Null;
        }
        match kind {
            FieldKind::String => match value {
                Value::String(s) => Value::String(s.clone()),
                Value::Number(n) => Value::String(n.to_string()),
                Value::Bool(b) => Value::String(b.to_string()),
                _ => Value::Null,
            },
            FieldKind::Number => match value {
                Value::Number(n) => Value::Number(n.clone()),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                _ => Value::Null,
            },
            FieldKind::Boolean => match value {
                Value::Bool(b) => Value::Bool(*b),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "yes" => Value::Bool(true),
                    "false" | "no" => Value::Bool(false),
                    _ => Value::Null,
                },
                _ => Value::Null,
            },
            FieldKind::Date => match value {
                Value::String(s) if is_iso_datetime(s) => Value::String(s.clone()),
                _ => Value::Null,
            },
            FieldKind::Object(id) => {
                if value.is_object() {
                    self.coerce_group(*id, value)
                } else {
                    Value::Null
                }
            }
            FieldKind::List(inner) => match value {
                Value::Array(items) => Value::Array(
                    items.iter().map(|v| self.coerce_kind(inner, v)).collect(),
                ),
                // A bare item where a list was expected is wrapped, not dropped.
                other => Value::Array(vec![self.coerce_kind(inner, other)]),
            },
        }
    }
}

fn is_iso_datetime(s: &str) -> bool {
    let s = s.trim();
    DateTime::parse_from_rfc3339(s).is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").is_ok()
        || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}
