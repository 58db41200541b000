//! Per-document validation (§4.4.2). Each document is validated
//! independently; a failure records a per-document error but never aborts
//! the batch.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::data::{is_reserved_or_protected, FieldValue, Number};
use crate::error::{CoreError, Outcome};
use crate::index::definition::{FieldType, IndexDefinition};

const MAX_ID_LENGTH: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchVectorisationMode {
    PerField,
    PerDocument,
    PerBatch,
}

pub struct AddDocsParams {
    pub index_name: String,
    pub docs: Vec<Value>,
    /// Required for Unstructured/SemiStructured, forbidden for Structured (§4.4.1).
    pub tensor_fields: Option<Vec<String>>,
    pub mappings: Option<Value>,
    pub media_download_headers: Option<HashMap<String, String>>,
    pub device: Option<String>,
    pub use_existing_tensors: bool,
    pub batch_vectorisation_mode: BatchVectorisationMode,
}

/// A document that passed validation, ready for media download + embedding.
pub struct ValidatedDoc {
    pub id: String,
    pub fields: HashMap<String, FieldValue>,
    /// Field names to embed into tensor chunks for this document.
    pub tensor_field_names: Vec<String>,
    /// Fields newly introduced relative to the current SemiStructured schema (§4.3).
    pub new_lexical_fields: Vec<String>,
    pub new_tensor_fields: Vec<String>,
    pub new_string_array_fields: Vec<String>,
}

/// Validates every document independently, collapsing duplicate `_id`s to
/// the last occurrence (last-writer-wins, §4.4.2), and returns the
/// survivors alongside per-document error outcomes for the rejected ones
/// (input order is preserved for the error outcomes).
pub fn validate_and_collapse(index: &IndexDefinition, params: &AddDocsParams, max_doc_bytes: usize) -> (Vec<ValidatedDoc>, crate::error::BatchResult) {
    let mut batch = crate::error::BatchResult::default();

    // Duplicate-id collapse: keep only the last occurrence per id, preserving
    // that occurrence's position in iteration order.
    let mut last_index_for_id: HashMap<String, usize> = HashMap::new();
    for (i, doc) in params.docs.iter().enumerate() {
        if let Some(id) = doc.get("_id").and_then(|v| v.as_str()) {
            last_index_for_id.insert(id.to_string(), i);
        }
    }

    let mut validated = Vec::new();
    for (i, doc) in params.docs.iter().enumerate() {
        if let Some(id) = doc.get("_id").and_then(|v| v.as_str()) {
            if last_index_for_id.get(id) != Some(&i) {
                continue; // superseded by a later occurrence with the same id
            }
        }
        match validate_one(index, doc, params, max_doc_bytes) {
            Ok(v) => validated.push(v),
            Err((id, err)) => batch.push(Outcome::err(id, &err)),
        }
    }

    (validated, batch)
}

fn validate_one(
    index: &IndexDefinition,
    doc: &Value,
    params: &AddDocsParams,
    max_doc_bytes: usize,
) -> std::result::Result<ValidatedDoc, (String, CoreError)> {
    let obj = doc.as_object().ok_or_else(|| (server_generated_id(), CoreError::InvalidArgument("document must be a JSON object".to_string())))?;

    let id = match obj.get("_id") {
        Some(Value::String(s)) if !s.is_empty() && s.len() <= MAX_ID_LENGTH => s.clone(),
        Some(Value::String(_)) => return Err((server_generated_id(), CoreError::InvalidArgument("_id must be a non-empty string within the length limit".to_string()))),
        Some(_) => return Err((server_generated_id(), CoreError::InvalidArgument("_id must be a string".to_string()))),
        None => server_generated_id(),
    };

    let serialized_size = serde_json::to_vec(doc).map(|b| b.len()).unwrap_or(usize::MAX);
    if serialized_size > max_doc_bytes {
        return Err((id, CoreError::DocTooLarge(format!("document exceeds the maximum of {} bytes", max_doc_bytes))));
    }

    let mut fields = HashMap::new();
    let mut new_lexical_fields = Vec::new();
    let mut new_tensor_fields = Vec::new();
    let mut new_string_array_fields = Vec::new();

    for (name, value) in obj {
        if name == "_id" {
            continue;
        }
        if is_reserved_or_protected(name) {
            return Err((id, CoreError::InvalidArgument(format!("field name '{}' is reserved or protected", name))));
        }

        let field_value = match index {
            IndexDefinition::Structured { extra, .. } => {
                let declared = extra
                    .fields
                    .iter()
                    .find(|f| &f.name == name)
                    .ok_or_else(|| CoreError::InvalidArgument(format!("field '{}' is not declared on this index", name)))
                    .map_err(|e| (id.clone(), e))?;
                coerce_structured(declared.field_type, value).map_err(|e| (id.clone(), CoreError::InvalidArgument(e)))?
            }
            _ => coerce_dynamic(value).map_err(|e| (id.clone(), CoreError::InvalidArgument(e)))?,
        };

        if let IndexDefinition::SemiStructured { extra, .. } = index {
            match &field_value {
                FieldValue::Text(_) if !extra.lexical_fields.contains(name) => new_lexical_fields.push(name.clone()),
                FieldValue::ArrayText(_) if !extra.string_array_fields.contains(name) => new_string_array_fields.push(name.clone()),
                _ => {}
            }
        }

        fields.insert(name.clone(), field_value);
    }

    let tensor_field_names = match index {
        IndexDefinition::Structured { extra, .. } => {
            if params.tensor_fields.is_some() {
                return Err((id, CoreError::InvalidArgument("tensorFields is forbidden for Structured indexes".to_string())));
            }
            extra.tensor_fields.iter().map(|t| t.name.clone()).filter(|n| fields.contains_key(n)).collect()
        }
        _ => {
            let requested = params
                .tensor_fields
                .clone()
                .ok_or_else(|| CoreError::InvalidArgument("tensorFields is required for Unstructured/SemiStructured indexes".to_string()))
                .map_err(|e| (id.clone(), e))?;
            if let IndexDefinition::SemiStructured { extra, .. } = index {
                for f in &requested {
                    if fields.contains_key(f) && !extra.tensor_fields.contains(f) {
                        new_tensor_fields.push(f.clone());
                    }
                }
            }
            requested.into_iter().filter(|n| fields.contains_key(n)).collect()
        }
    };

    Ok(ValidatedDoc { id, fields, tensor_field_names, new_lexical_fields, new_tensor_fields, new_string_array_fields })
}

fn server_generated_id() -> String {
    format!("_generated_{}", uuid::Uuid::new_v4())
}

fn coerce_structured(field_type: FieldType, value: &Value) -> std::result::Result<FieldValue, String> {
    match (field_type, value) {
        (FieldType::Text, Value::String(s)) => Ok(FieldValue::Text(s.clone())),
        (FieldType::Bool, Value::Bool(b)) => Ok(FieldValue::Bool(*b)),
        (FieldType::Int, Value::Number(n)) => {
            let i = n.as_i64().ok_or("Int field must be an integer")?;
            i32::try_from(i).map(FieldValue::Int).map_err(|_| "value does not fit in a 32-bit signed integer".to_string())
        }
        (FieldType::Long, Value::Number(n)) => n.as_i64().map(FieldValue::Long).ok_or_else(|| "Long field must fit in a 64-bit signed integer".to_string()),
        (FieldType::Float, Value::Number(n)) => {
            let f = n.as_f64().ok_or("Float field must be numeric")?;
            if !f.is_finite() || f.abs() > f32::MAX as f64 {
                return Err("value does not fit in an IEEE-754 single-precision float".to_string());
            }
            Ok(FieldValue::Float(f as f32))
        }
        (FieldType::Double, Value::Number(n)) => n.as_f64().map(FieldValue::Double).ok_or_else(|| "Double field must be numeric".to_string()),
        (FieldType::ArrayText, Value::Array(items)) => items
            .iter()
            .map(|v| v.as_str().map(|s| s.to_string()).ok_or_else(|| "ArrayText elements must be strings".to_string()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(FieldValue::ArrayText),
        (FieldType::ArrayInt | FieldType::ArrayLong, Value::Array(items)) => items
            .iter()
            .map(|v| v.as_i64().ok_or_else(|| "array elements must be integers".to_string()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(FieldValue::ArrayInt),
        (FieldType::ArrayFloat | FieldType::ArrayDouble, Value::Array(items)) => items
            .iter()
            .map(|v| v.as_f64().ok_or_else(|| "array elements must be numeric".to_string()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(FieldValue::ArrayFloat),
        (FieldType::ImagePointer | FieldType::VideoPointer | FieldType::AudioPointer, Value::String(s)) => Ok(FieldValue::Media(s.clone())),
        (FieldType::CustomVector, Value::Object(_)) => coerce_custom_vector(value),
        (declared, _) => Err(format!("value does not conform to declared type {:?}", declared)),
    }
}

fn coerce_custom_vector(value: &Value) -> std::result::Result<FieldValue, String> {
    let content = value.get("content").and_then(|v| v.as_str()).map(|s| s.to_string());
    let vector = value
        .get("vector")
        .and_then(|v| v.as_array())
        .ok_or("CustomVector requires a 'vector' array")?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32).ok_or_else(|| "vector elements must be numeric".to_string()))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(FieldValue::CustomVector { content, vector })
}

/// Unstructured/SemiStructured: all list elements must share one of the four
/// primitive list types; maps of numerics are the score-modifier container (§4.4.2).
fn coerce_dynamic(value: &Value) -> std::result::Result<FieldValue, String> {
    match value {
        Value::String(s) => Ok(FieldValue::Text(s.clone())),
        Value::Bool(b) => Ok(FieldValue::Bool(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(FieldValue::Long(i))
            } else {
                n.as_f64().map(FieldValue::Double).ok_or_else(|| "unsupported number".to_string())
            }
        }
        Value::Array(items) => coerce_dynamic_array(items),
        Value::Object(map) => {
            if map.values().all(|v| v.is_number()) {
                let numbers = map
                    .iter()
                    .map(|(k, v)| (k.clone(), Number::Float(v.as_f64().unwrap_or_default())))
                    .collect::<HashMap<_, _>>();
                Ok(FieldValue::MapNumeric(numbers))
            } else {
                Err("nested non-numeric maps are not supported on Unstructured/SemiStructured indexes".to_string())
            }
        }
        Value::Null => Err("null field values are not supported".to_string()),
    }
}

fn coerce_dynamic_array(items: &[Value]) -> std::result::Result<FieldValue, String> {
    if items.is_empty() {
        return Ok(FieldValue::ArrayText(vec![]));
    }
    if items.iter().all(|v| v.is_string()) {
        return Ok(FieldValue::ArrayText(items.iter().map(|v| v.as_str().unwrap().to_string()).collect()));
    }
    if items.iter().all(|v| v.is_i64() || v.is_u64()) {
        return Ok(FieldValue::ArrayInt(items.iter().map(|v| v.as_i64().unwrap()).collect()));
    }
    if items.iter().all(|v| v.is_number()) {
        return Ok(FieldValue::ArrayFloat(items.iter().map(|v| v.as_f64().unwrap()).collect()));
    }
    Err("list elements must share a single primitive type (string, int, long, float, or double)".to_string())
}

#[allow(dead_code)]
fn distinct_types(fields: &HashMap<String, FieldValue>) -> HashSet<&'static str> {
    fields
        .values()
        .map(|v| match v {
            FieldValue::Text(_) => "text",
            FieldValue::Bool(_) => "bool",
            FieldValue::Int(_) => "int",
            FieldValue::Long(_) => "long",
            FieldValue::Float(_) => "float",
            FieldValue::Double(_) => "double",
            FieldValue::ArrayText(_) => "array_text",
            FieldValue::ArrayInt(_) => "array_int",
            FieldValue::ArrayFloat(_) => "array_float",
            FieldValue::MapNumeric(_) => "map_numeric",
            FieldValue::CustomVector { .. } => "custom_vector",
            FieldValue::Media(_) => "media",
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::definition::*;

    fn semi_structured_index() -> IndexDefinition {
        IndexDefinition::SemiStructured {
            common: IndexCommon {
                name: "idx".into(),
                schema_name: "idx".into(),
                index_type: IndexType::SemiStructured,
                model: ModelConfig { name: "m".into(), properties: None, text_query_prefix: None, text_chunk_prefix: None },
                normalize_embeddings: true,
                text_preprocessing: Default::default(),
                image_preprocessing: Default::default(),
                video_preprocessing: Default::default(),
                audio_preprocessing: Default::default(),
                distance_metric: DistanceMetric::Angular,
                vector_numeric_type: VectorNumericType::Float32,
                hnsw_config: HnswConfig { ef_construction: 128, m: 16 },
                embedding_dim: 8,
                marqo_version: "2.13.0".into(),
                created_at: 0.0,
                updated_at: 0.0,
                version: 1,
            },
            extra: SemiStructuredExtra {
                unstructured: UnstructuredExtra { treat_urls_and_pointers_as_images: true, treat_urls_and_pointers_as_media: false, filter_string_max_length: 200 },
                lexical_fields: vec![],
                tensor_fields: vec![],
                string_array_fields: vec![],
            },
        }
    }

    fn params(docs: Vec<Value>, tensor_fields: Vec<String>) -> AddDocsParams {
        AddDocsParams {
            index_name: "idx".into(),
            docs,
            tensor_fields: Some(tensor_fields),
            mappings: None,
            media_download_headers: None,
            device: None,
            use_existing_tensors: false,
            batch_vectorisation_mode: BatchVectorisationMode::PerDocument,
        }
    }

    #[test]
    fn duplicate_ids_collapse_to_last_occurrence() {
        let index = semi_structured_index();
        let docs = vec![
            serde_json::json!({"_id": "1", "title": "first"}),
            serde_json::json!({"_id": "1", "title": "second"}),
        ];
        let p = params(docs, vec!["title".to_string()]);
        let (validated, batch) = validate_and_collapse(&index, &p, 1_000_000);
        assert_eq!(validated.len(), 1);
        assert!(matches!(validated[0].fields.get("title"), Some(FieldValue::Text(t)) if t == "second"));
        assert!(!batch.errors);
    }

    #[test]
    fn new_lexical_field_is_tracked_for_schema_growth() {
        let index = semi_structured_index();
        let docs = vec![serde_json::json!({"_id": "1", "title": "hello"})];
        let p = params(docs, vec!["title".to_string()]);
        let (validated, _) = validate_and_collapse(&index, &p, 1_000_000);
        assert_eq!(validated[0].new_lexical_fields, vec!["title".to_string()]);
        assert_eq!(validated[0].new_tensor_fields, vec!["title".to_string()]);
    }

    #[test]
    fn reserved_field_name_is_rejected() {
        let index = semi_structured_index();
        let docs = vec![serde_json::json!({"_id": "1", "marqo__bad": "x"})];
        let p = params(docs, vec![]);
        let (validated, batch) = validate_and_collapse(&index, &p, 1_000_000);
        assert!(validated.is_empty());
        assert!(batch.errors);
    }

    #[test]
    fn mixed_type_list_is_rejected() {
        let index = semi_structured_index();
        let docs = vec![serde_json::json!({"_id": "1", "tags": ["a", 1]})];
        let p = params(docs, vec![]);
        let (validated, batch) = validate_and_collapse(&index, &p, 1_000_000);
        assert!(validated.is_empty());
        assert!(batch.errors);
    }

    #[test]
    fn doc_exceeding_max_bytes_is_rejected() {
        let index = semi_structured_index();
        let docs = vec![serde_json::json!({"_id": "1", "title": "x".repeat(100)})];
        let p = params(docs, vec![]);
        let (validated, batch) = validate_and_collapse(&index, &p, 10);
        assert!(validated.is_empty());
        assert_eq!(batch.items[0].status, 400);
    }
}
