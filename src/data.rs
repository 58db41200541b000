//! Dynamic document/field typing (§3.2, §9 "Dynamic typing in source").

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Prefix reserved for derived/internal field names (`marqo__lexical_foo`, …).
pub const RESERVED_PREFIX: &str = "marqo__";

/// Field names a caller may never assign (§3.1 invariants).
pub const PROTECTED_FIELD_NAMES: [&str; 5] = ["_id", "_tensor_facets", "_highlights", "_score", "_found"];

pub fn is_reserved_or_protected(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX) || PROTECTED_FIELD_NAMES.contains(&name)
}

/// A value coming off the public API, resolved into a tagged variant (§9).
///
/// Validation (`pipeline::validate`) turns raw `serde_json::Value`s into these;
/// anything that doesn't fit becomes a per-document error instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value")]
pub enum FieldValue {
    Text(String),
    Bool(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    ArrayText(Vec<String>),
    ArrayInt(Vec<i64>),
    ArrayFloat(Vec<f64>),
    MapNumeric(HashMap<String, Number>),
    CustomVector { content: Option<String>, vector: Vec<f32> },
    Media(String),
}

/// A numeric leaf used inside `MapNumeric` (§4.4.6 "collect into a numeric map").
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(&self) -> f64 {
        match self {
            Number::Int(i) => *i as f64,
            Number::Float(f) => *f,
        }
    }
}

/// The logical type token stamped into `fieldTypes` for optimistic partial updates (§3.2).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldTypeToken {
    String,
    Bool,
    Int,
    Float,
    IntMapEntry,
    FloatMapEntry,
    StringArray,
    Tensor,
}

impl FieldTypeToken {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldTypeToken::String => "string",
            FieldTypeToken::Bool => "bool",
            FieldTypeToken::Int => "int",
            FieldTypeToken::Float => "float",
            FieldTypeToken::IntMapEntry => "int_map_entry",
            FieldTypeToken::FloatMapEntry => "float_map_entry",
            FieldTypeToken::StringArray => "string_array",
            FieldTypeToken::Tensor => "tensor",
        }
    }
}

/// A stored document's tensor-field chunk payload (§3.2).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TensorFieldChunks {
    pub chunks: Vec<String>,
    pub embeddings: Vec<Vec<f32>>,
}

/// A stored document, the in-memory form of §3.2.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoredDocument {
    pub id: String,
    pub create_timestamp: Option<f64>,

    pub short_strings: HashMap<String, String>,
    pub bools: HashMap<String, bool>,
    pub ints: HashMap<String, i64>,
    pub floats: HashMap<String, f64>,
    pub score_modifiers: HashMap<String, f64>,
    pub string_arrays: HashMap<String, Vec<String>>,

    pub tensor_fields: HashMap<String, TensorFieldChunks>,

    /// Present on SemiStructured at partial-update version (§3.2).
    pub field_types: HashMap<String, FieldTypeToken>,
    pub multimodal_weights: HashMap<String, HashMap<String, f64>>,

    pub vector_count: i64,
}

impl StoredDocument {
    pub fn new(id: impl Into<String>) -> Self {
        StoredDocument { id: id.into(), ..Default::default() }
    }

    pub fn recompute_vector_count(&mut self) {
        self.vector_count = self
            .tensor_fields
            .values()
            .map(|t| t.embeddings.len() as i64)
            .sum();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_prefix_and_protected_ids() {
        assert!(is_reserved_or_protected("marqo__lexical_title"));
        assert!(is_reserved_or_protected("_id"));
        assert!(is_reserved_or_protected("_score"));
        assert!(!is_reserved_or_protected("title"));
    }
}
