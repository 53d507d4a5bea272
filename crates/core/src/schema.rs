//! Answer schema definition and the validated [`StructuredAnswer`] it produces.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use thiserror::Error;

const CONCISE_ANSWER_MAX_CHARS: usize = 2_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    TextList,
}

impl FieldKind {
    fn type_label(self) -> &'static str {
        match self {
            Self::Text => "string",
            Self::TextList => "array of strings",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaField {
    pub name: String,
    pub description: String,
    pub kind: FieldKind,
    pub required: bool,
}

impl SchemaField {
    pub fn text(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind: FieldKind::Text,
            required: true,
        }
    }

    pub fn text_list(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind: FieldKind::TextList,
            required: true,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnswerSchema {
    pub fields: Vec<SchemaField>,
}

impl Default for AnswerSchema {
    fn default() -> Self {
        Self {
            fields: vec![
                SchemaField::text(
                    "summary",
                    "A concise, direct answer to the question based only on the context.",
                ),
                SchemaField::text_list(
                    "supporting_points",
                    "Ordered list of short statements from the context that support the summary.",
                ),
            ],
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaViolation {
    #[error("output is not a JSON object")]
    NotAnObject,

    #[error("missing required field '{0}'")]
    MissingField(String),

    #[error("field '{field}' must be {expected}")]
    WrongType {
        field: String,
        expected: &'static str,
    },

    #[error("required field '{0}' is empty")]
    EmptyField(String),
}

impl AnswerSchema {
    pub fn new(fields: Vec<SchemaField>) -> Self {
        Self { fields }
    }

    pub fn validate_definition(&self) -> Result<(), PipelineError> {
        if self.fields.is_empty() {
            return Err(PipelineError::Config(
                "answer schema has no fields".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(PipelineError::Config(
                    "answer schema field has an empty name".to_string(),
                ));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(PipelineError::Config(format!(
                    "answer schema field '{}' is declared twice",
                    field.name
                )));
            }
        }

        Ok(())
    }

    /// Prompt fragment describing the exact JSON shape the model must emit.
    pub fn format_instructions(&self) -> String {
        let body = self
            .fields
            .iter()
            .map(|field| {
                let optional = if field.required { "" } else { " (optional)" };
                format!(
                    "\t\"{}\": {}{}  // {}",
                    field.name,
                    field.kind.type_label(),
                    optional,
                    field.description
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "The output should be a markdown code snippet formatted in the following schema, \
             including the leading and trailing \"```json\" and \"```\":\n\n```json\n{{\n{body}\n}}\n```"
        )
    }

    /// Checks a parsed JSON value against the schema and keeps only the declared fields.
    pub fn conform(&self, value: Value) -> Result<StructuredAnswer, SchemaViolation> {
        let Value::Object(mut object) = value else {
            return Err(SchemaViolation::NotAnObject);
        };

        let mut conformed = Map::new();
        for field in &self.fields {
            let entry = match object.remove(&field.name) {
                Some(Value::Null) | None => {
                    if field.required {
                        return Err(SchemaViolation::MissingField(field.name.clone()));
                    }
                    continue;
                }
                Some(entry) => entry,
            };

            check_field(field, &entry)?;
            conformed.insert(field.name.clone(), entry);
        }

        Ok(StructuredAnswer(conformed))
    }
}

fn check_field(field: &SchemaField, value: &Value) -> Result<(), SchemaViolation> {
    let wrong_type = || SchemaViolation::WrongType {
        field: field.name.clone(),
        expected: field.kind.type_label(),
    };

    match field.kind {
        FieldKind::Text => {
            let text = value.as_str().ok_or_else(wrong_type)?;
            if field.required && text.trim().is_empty() {
                return Err(SchemaViolation::EmptyField(field.name.clone()));
            }
        }
        FieldKind::TextList => {
            let items = value.as_array().ok_or_else(wrong_type)?;
            if !items.iter().all(Value::is_string) {
                return Err(wrong_type());
            }
            if field.required && items.is_empty() {
                return Err(SchemaViolation::EmptyField(field.name.clone()));
            }
        }
    }

    Ok(())
}

/// A JSON object that passed [`AnswerSchema::conform`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct StructuredAnswer(Map<String, Value>);

impl StructuredAnswer {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    pub fn list(&self, field: &str) -> Vec<&str> {
        self.0
            .get(field)
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Short human-readable answer derived from the structured fields.
    pub fn concise(&self) -> String {
        for key in ["answer", "summary"] {
            if let Some(text) = self.text(key).map(str::trim).filter(|text| !text.is_empty()) {
                return text.to_string();
            }
        }

        let title = self.text("title").or_else(|| self.text("heading"));
        let first_section = ["sections", "bullets", "body"]
            .iter()
            .find_map(|key| self.get(key))
            .and_then(|value| match value {
                Value::Array(items) => items.first().map(value_to_text),
                other => Some(value_to_text(other)),
            });
        if let (Some(title), Some(first)) = (title, first_section) {
            return format!("{title}: {first}");
        }

        let joined = self
            .0
            .values()
            .filter(|value| !is_blank(value))
            .map(value_to_text)
            .collect::<Vec<_>>()
            .join(" ");
        joined.chars().take(CONCISE_ANSWER_MAX_CHARS).collect()
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}
