//! Document assembly (§4.4.5, §3.2): folds a validated document plus its
//! computed tensor embeddings into the generic `StoredDocument` container
//! shape, then renders that into the wire form the store accepts.

use serde_json::Value;
use time::OffsetDateTime;

use crate::data::{FieldTypeToken, FieldValue, Number, StoredDocument};
use crate::error::{CoreError, Result};
use crate::index::definition::{FieldType, IndexDefinition};

use super::embed::DocumentEmbeddings;
use super::validate::ValidatedDoc;
use super::MediaRepo;

/// Monotonic epoch float for `marqo__create_timestamp` (§3.2): written once at
/// first feed, later carried forward as the partial-update version token.
fn now_epoch_seconds() -> f64 {
    let now = OffsetDateTime::now_utc();
    now.unix_timestamp() as f64 + now.nanosecond() as f64 / 1_000_000_000.0
}

pub fn assemble_document(
    index: &IndexDefinition,
    doc: &ValidatedDoc,
    embeddings: &DocumentEmbeddings,
    _media_repo: &MediaRepo,
) -> Result<StoredDocument> {
    let mut stored = StoredDocument::new(doc.id.clone());
    stored.create_timestamp = Some(now_epoch_seconds());

    for (name, value) in &doc.fields {
        place_field(index, &mut stored, name, value)?;
    }

    if let Some(per_doc) = embeddings.get(&doc.id) {
        for field_name in &doc.tensor_field_names {
            if let Some(chunks) = per_doc.get(field_name) {
                stored.tensor_fields.insert(field_name.clone(), chunks.clone());
            }
        }
        // Combination fields replace their dependents' entries (embed::combine_multimodal_fields)
        // and may not be named in `tensor_field_names` directly if they were added post-hoc.
        for (field_name, chunks) in per_doc {
            stored.tensor_fields.entry(field_name.clone()).or_insert_with(|| chunks.clone());
        }
    }

    if let IndexDefinition::Structured { extra, .. } = index {
        for field in &extra.fields {
            if field.field_type == FieldType::MultimodalCombination {
                if let Some(deps) = &field.dependent_fields {
                    let present = doc.fields.contains_key(&field.name)
                        || stored.tensor_fields.contains_key(&field.name)
                        || deps.keys().any(|d| doc.fields.contains_key(d));
                    if present {
                        stored.multimodal_weights.insert(field.name.clone(), deps.clone());
                    }
                }
            }
        }
    }

    stored.recompute_vector_count();
    Ok(stored)
}

fn place_field(index: &IndexDefinition, stored: &mut StoredDocument, name: &str, value: &FieldValue) -> Result<()> {
    match value {
        FieldValue::Text(text) => {
            stored.short_strings.insert(name.to_string(), text.clone());
            stored.field_types.insert(name.to_string(), FieldTypeToken::String);
        }
        FieldValue::Bool(b) => {
            stored.bools.insert(name.to_string(), *b);
            stored.field_types.insert(name.to_string(), FieldTypeToken::Bool);
        }
        FieldValue::Int(i) => {
            stored.ints.insert(name.to_string(), *i as i64);
            stored.field_types.insert(name.to_string(), FieldTypeToken::Int);
        }
        FieldValue::Long(i) => {
            stored.ints.insert(name.to_string(), *i);
            stored.field_types.insert(name.to_string(), FieldTypeToken::Int);
        }
        FieldValue::Float(f) => {
            stored.floats.insert(name.to_string(), *f as f64);
            stored.field_types.insert(name.to_string(), FieldTypeToken::Float);
        }
        FieldValue::Double(f) => {
            stored.floats.insert(name.to_string(), *f);
            stored.field_types.insert(name.to_string(), FieldTypeToken::Float);
        }
        FieldValue::ArrayText(items) => {
            stored.string_arrays.insert(name.to_string(), items.clone());
            stored.field_types.insert(name.to_string(), FieldTypeToken::StringArray);
        }
        FieldValue::ArrayInt(items) => {
            for (i, v) in items.iter().enumerate() {
                stored.score_modifiers.insert(format!("{}.{}", name, i), *v as f64);
            }
            stored.field_types.insert(name.to_string(), FieldTypeToken::IntMapEntry);
        }
        FieldValue::ArrayFloat(items) => {
            for (i, v) in items.iter().enumerate() {
                stored.score_modifiers.insert(format!("{}.{}", name, i), *v);
            }
            stored.field_types.insert(name.to_string(), FieldTypeToken::FloatMapEntry);
        }
        FieldValue::MapNumeric(map) => {
            for (key, n) in map {
                stored.score_modifiers.insert(format!("{}.{}", name, key), n.as_f64());
            }
            let token = if map.values().all(|n| matches!(n, Number::Int(_))) { FieldTypeToken::IntMapEntry } else { FieldTypeToken::FloatMapEntry };
            stored.field_types.insert(name.to_string(), token);
        }
        FieldValue::Media(url) => {
            stored.short_strings.insert(name.to_string(), url.clone());
            stored.field_types.insert(name.to_string(), FieldTypeToken::String);
        }
        FieldValue::CustomVector { content, .. } => {
            if let Some(content) = content {
                stored.short_strings.insert(name.to_string(), content.clone());
            }
            stored.field_types.insert(name.to_string(), FieldTypeToken::Tensor);
        }
    }
    let _ = index;
    Ok(())
}

/// Renders a `StoredDocument` into the generic field map the store accepts
/// (`marqo__lexical_*`, `marqo__chunks_*`, `marqo__embeddings_*`, …, §3.2).
pub fn stored_document_to_fields(stored: &StoredDocument) -> Value {
    let mut fields = serde_json::Map::new();

    for (k, v) in &stored.short_strings {
        fields.insert(format!("{}lexical_{}", crate::data::RESERVED_PREFIX, k), Value::String(v.clone()));
    }
    for (k, v) in &stored.bools {
        fields.insert(k.clone(), Value::Bool(*v));
    }
    for (k, v) in &stored.ints {
        fields.insert(k.clone(), Value::Number((*v).into()));
    }
    for (k, v) in &stored.floats {
        fields.insert(k.clone(), serde_json::json!(*v));
    }
    for (k, v) in &stored.string_arrays {
        fields.insert(k.clone(), Value::Array(v.iter().cloned().map(Value::String).collect()));
    }
    if !stored.score_modifiers.is_empty() {
        let modifiers: serde_json::Map<String, Value> = stored.score_modifiers.iter().map(|(k, v)| (k.clone(), serde_json::json!(*v))).collect();
        fields.insert(format!("{}score_modifiers", crate::data::RESERVED_PREFIX), Value::Object(modifiers));
    }
    for (field_name, chunks) in &stored.tensor_fields {
        fields.insert(format!("{}chunks_{}", crate::data::RESERVED_PREFIX, field_name), Value::Array(chunks.chunks.iter().cloned().map(Value::String).collect()));
        let cells: Vec<Value> = chunks
            .embeddings
            .iter()
            .enumerate()
            .map(|(i, v)| serde_json::json!({ "address": { "p": i.to_string() }, "values": v }))
            .collect();
        fields.insert(
            format!("{}embeddings_{}", crate::data::RESERVED_PREFIX, field_name),
            serde_json::json!({ "blocks": cells }),
        );
    }
    if !stored.field_types.is_empty() {
        let types: serde_json::Map<String, Value> = stored.field_types.iter().map(|(k, v)| (k.clone(), Value::String(v.as_str().to_string()))).collect();
        fields.insert(format!("{}field_types", crate::data::RESERVED_PREFIX), Value::Object(types));
    }
    if !stored.multimodal_weights.is_empty() {
        let weights: serde_json::Map<String, Value> = stored
            .multimodal_weights
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::json!(v)))
            .collect();
        fields.insert(format!("{}multimodal_weights", crate::data::RESERVED_PREFIX), Value::Object(weights));
    }
    fields.insert(format!("{}vector_count", crate::data::RESERVED_PREFIX), serde_json::json!(stored.vector_count));
    if let Some(ts) = stored.create_timestamp {
        fields.insert(format!("{}create_timestamp", crate::data::RESERVED_PREFIX), serde_json::json!(ts));
    }

    Value::Object(fields)
}

#[allow(dead_code)]
fn unsupported(name: &str) -> CoreError {
    CoreError::InvalidArgument(format!("field '{}' could not be assembled", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::definition::*;
    use std::collections::HashMap as Map;

    fn unstructured_index() -> IndexDefinition {
        IndexDefinition::Unstructured {
            common: IndexCommon {
                name: "idx".into(),
                schema_name: "idx".into(),
                index_type: IndexType::Unstructured,
                model: ModelConfig { name: "m".into(), properties: None, text_query_prefix: None, text_chunk_prefix: None },
                normalize_embeddings: true,
                text_preprocessing: Default::default(),
                image_preprocessing: Default::default(),
                video_preprocessing: Default::default(),
                audio_preprocessing: Default::default(),
                distance_metric: DistanceMetric::Angular,
                vector_numeric_type: VectorNumericType::Float32,
                hnsw_config: HnswConfig { ef_construction: 128, m: 16 },
                embedding_dim: 4,
                marqo_version: "2.13.0".into(),
                created_at: 0.0,
                updated_at: 0.0,
                version: 1,
            },
            extra: UnstructuredExtra { treat_urls_and_pointers_as_images: true, treat_urls_and_pointers_as_media: false, filter_string_max_length: 200 },
        }
    }

    #[test]
    fn assembles_text_field_into_short_strings_and_lexical_wire_field() {
        let index = unstructured_index();
        let mut fields = Map::new();
        fields.insert("title".to_string(), FieldValue::Text("hello world".to_string()));
        let doc = ValidatedDoc { id: "1".into(), fields, tensor_field_names: vec![], new_lexical_fields: vec![], new_tensor_fields: vec![], new_string_array_fields: vec![] };
        let stored = assemble_document(&index, &doc, &Map::new(), &Map::new()).unwrap();
        assert_eq!(stored.short_strings.get("title"), Some(&"hello world".to_string()));
        let wire = stored_document_to_fields(&stored);
        assert!(wire.get("marqo__lexical_title").is_some());
    }

    #[test]
    fn vector_count_reflects_tensor_chunk_embeddings() {
        let index = unstructured_index();
        let mut fields = Map::new();
        fields.insert("title".to_string(), FieldValue::Text("hello".to_string()));
        let doc = ValidatedDoc {
            id: "1".into(),
            fields,
            tensor_field_names: vec!["title".to_string()],
            new_lexical_fields: vec![],
            new_tensor_fields: vec![],
            new_string_array_fields: vec![],
        };
        let mut embeddings: DocumentEmbeddings = Map::new();
        let mut per_doc = Map::new();
        per_doc.insert("title".to_string(), crate::data::TensorFieldChunks { chunks: vec!["hello".into()], embeddings: vec![vec![0.1, 0.2, 0.3, 0.4]] });
        embeddings.insert("1".to_string(), per_doc);
        let stored = assemble_document(&index, &doc, &embeddings, &Map::new()).unwrap();
        assert_eq!(stored.vector_count, 1);
    }
}
