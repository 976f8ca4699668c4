//! Prompt construction for every LLM-calling stage.
//!
//! Each builder returns a [`Prompt`] pairing a role-establishing system
//! message with the stage's user message. The wording deliberately pushes
//! the model toward structured output; structural enforcement itself happens
//! through the target schema passed alongside the prompt.

use std::fmt::Write as _;

use crate::guide::FieldGuide;
use crate::llm::Prompt;
use crate::schema::LeafField;

const ANALYSIS_SYSTEM: &str = "You are a data analysis specialist. \
Determine what a query is asking to extract, whether it asks for one record \
or a collection of records per text, and which input column holds the text \
to analyze.";

const REFINEMENT_SYSTEM: &str = "You are a data structuring specialist. \
Expand queries into explicit field enumerations with clear descriptions, \
inferring the inherent structure of the data.";

const SCHEMA_SYSTEM: &str = "You are a schema design specialist. \
Design data extraction schemas that capture complex, nested structures with \
appropriate types.";

const GUIDE_SYSTEM: &str = "You are a data mapping specialist. \
Map extraction fields onto the input columns that are most likely to contain \
their values. Only use columns that actually exist.";

const REFINE_OPS_SYSTEM: &str = "You are a schema maintenance specialist. \
Translate change instructions into explicit schema edit operations. Emit no \
operation for instructions the schema already satisfies.";

const EXTRACTION_SYSTEM: &str = "You are a precise data extraction system. \
Return structured objects exactly matching the requested schema. Use the \
exact field types specified, return arrays for list fields, use ISO 8601 \
for dates, and use null for anything the text does not state.";

/// Prompt for the query analysis stage.
pub fn analysis(query: &str, columns: &[String]) -> Prompt {
    let columns = if columns.is_empty() {
        "(no column metadata; input is raw text)".to_string()
    } else {
        columns.join(", ")
    };
    Prompt::new(
        ANALYSIS_SYSTEM,
        format!(
            "Analyze this extraction query.\n\n\
             Query: {query}\n\
             Available columns: {columns}\n\n\
             Report the extraction purpose, whether the query asks for a \
             collection of items per text (markers like \"each\", \"every\", \
             \"list of\", \"all\"), a short plural noun naming the collection \
             if so, and the column containing the text to analyze."
        ),
    )
}

/// Prompt for the query refinement stage.
pub fn refinement(query: &str) -> Prompt {
    Prompt::new(
        REFINEMENT_SYSTEM,
        format!(
            "Expand the following query to enable structured extraction.\n\
             Consider:\n\
             1. What are the inherent characteristics of the data?\n\
             2. What distinct fields should be captured, with what types?\n\
             3. How should multiple related items be organized?\n\
             4. Are there nested relationships or hierarchies?\n\n\
             Query: {query}"
        ),
    )
}

/// Prompt for the schema generation stage.
pub fn schema(refined_query: &str, characteristics: &[String], sample_text: Option<&str>) -> Prompt {
    let mut user = format!(
        "Design a data extraction schema for this request.\n\n\
         Refined query: {refined_query}\n"
    );
    if !characteristics.is_empty() {
        let _ = write!(user, "\nData characteristics:\n- {}\n", characteristics.join("\n- "));
    }
    if let Some(sample) = sample_text {
        let _ = write!(user, "\nSample text:\n{sample}\n");
    }
    user.push_str(
        "\nName the model, describe its purpose, and enumerate its fields. \
         Use nested field lists for structured sub-objects and mark fields \
         holding several items as lists. Give every field a type and a \
         description.",
    );
    Prompt::new(SCHEMA_SYSTEM, user)
}

/// Prompt for the guide generation stage.
pub fn guide(leaves: &[LeafField], columns: &[String]) -> Prompt {
    let mut fields = String::new();
    for leaf in leaves {
        let _ = writeln!(fields, "- {}: {}", leaf.path, leaf.description);
    }
    Prompt::new(
        GUIDE_SYSTEM,
        format!(
            "Map each extraction field to the input column most likely to \
             contain its value.\n\n\
             Fields:\n{fields}\n\
             Available columns: {}\n\n\
             Omit fields with no plausible column; they will be extracted \
             from raw text directly.",
            columns.join(", ")
        ),
    )
}

/// Prompt for translating refinement instructions into edit operations.
pub fn refine_ops(schema_json: &str, instructions: &str) -> Prompt {
    Prompt::new(
        REFINE_OPS_SYSTEM,
        format!(
            "Current schema:\n{schema_json}\n\n\
             Instructions:\n{instructions}\n\n\
             Emit the minimal list of add/remove/rename/retype operations. \
             Address fields by their dotted path from the root. Leave \
             unrelated fields untouched."
        ),
    )
}

/// Prompt for one unit-level extraction call.
pub fn extraction(refined_query: &str, guide: Option<&FieldGuide>, text: &str) -> Prompt {
    let mut user = format!(
        "Extract structured information from the text below.\n\n\
         Request: {refined_query}\n"
    );
    if let Some(guide) = guide {
        if !guide.is_empty() {
            user.push_str("\nField source hints:\n");
            for (path, hint) in guide.mappings() {
                let _ = writeln!(user, "- {path}: look in {hint}");
            }
        }
    }
    let _ = write!(
        user,
        "\nReturn every matching record as one element of the result array. \
         Use null for fields the text does not state.\n\n\
         Text to analyze:\n{text}"
    );
    Prompt::new(EXTRACTION_SYSTEM, user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldKind;

    #[test]
    fn extraction_prompt_includes_guide_hints() {
        let mut guide = FieldGuide::default();
        guide.insert("date", "incident_date");
        let prompt = extraction("extract incidents", Some(&guide), "some text");
        assert!(prompt.user.contains("date: look in incident_date"));
        assert!(prompt.user.contains("some text"));
    }

    #[test]
    fn guide_prompt_lists_leaf_paths() {
        let leaves = vec![LeafField {
            path: "incidents.date".into(),
            kind: FieldKind::Date,
            description: "When it happened".into(),
            depth: 1,
        }];
        let prompt = guide(&leaves, &["text".into(), "date".into()]);
        assert!(prompt.user.contains("incidents.date"));
        assert!(prompt.user.contains("text, date"));
    }
}
