//! Partial document updates (§4.4.6): field-granular patches applied
//! without re-embedding or re-validating the whole document.
//!
//! Score-modifier fields are routed through Vespa's map-key `assign`
//! syntax (`marqo__score_modifiers{field}`) rather than replacing the
//! whole map, so updating one numeric field never clobbers the others
//! already on the stored document — the pinned resolution for the
//! "does overwriting a score modifier drop its siblings" open question.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde_json::Value;

use crate::data::{FieldValue, RESERVED_PREFIX};
use crate::error::{BatchResult, CoreError, Outcome, Result};
use crate::index::definition::{FieldType, IndexDefinition};
use crate::store::{GetOutcome, StoreClient, UpdateDoc};

/// A single field-granular patch: only the named fields are touched, every
/// other field on the stored document is left alone.
pub struct PatchDoc {
    pub id: String,
    pub fields: HashMap<String, FieldValue>,
    /// Opaque optimistic-concurrency condition, store-dialect (§4.1), ANDed
    /// onto the precondition this pipeline derives from the read document.
    pub condition: Option<String>,
}

pub async fn run(store: &StoreClient, index: &IndexDefinition, docs: Vec<PatchDoc>, timeout: Duration) -> Result<BatchResult> {
    if docs.is_empty() {
        return Err(CoreError::InvalidArgument("docs must not be empty".to_string()));
    }

    let collapsed = collapse_duplicates(docs);
    let schema = &index.common().schema_name;

    // §4.4.6 step 1: resolve every existing stored document up front so map-entry
    // removal and the createTimestamp version token can be computed per patch.
    let ids: Vec<String> = collapsed.iter().map(|p| p.id.clone()).collect();
    let mut existing: HashMap<String, GetOutcome> = store.get_batch(ids, schema, None, timeout).await.into_iter().collect();

    let mut batch = BatchResult::default();
    let mut to_send = Vec::new();
    for patch in collapsed {
        match existing.remove(&patch.id) {
            Some(GetOutcome::Found(body)) => match render_update(index, &patch, &body) {
                Ok(update) => to_send.push(update),
                Err(err) => batch.push(Outcome::err(&patch.id, &err)),
            },
            Some(GetOutcome::NotFound) | None => {
                batch.push(Outcome { id: patch.id.clone(), status: 404, message: Some("Document does not exist in the index".to_string()) });
            }
            Some(GetOutcome::Error(outcome)) => batch.push(outcome),
        }
    }

    if !to_send.is_empty() {
        let sent = store.update_documents_batch(to_send, schema, timeout).await;
        for item in sent.items {
            batch.push(item);
        }
    }

    Ok(batch)
}

fn collapse_duplicates(docs: Vec<PatchDoc>) -> Vec<PatchDoc> {
    let mut last_index_for_id: HashMap<String, usize> = HashMap::new();
    for (i, doc) in docs.iter().enumerate() {
        last_index_for_id.insert(doc.id.clone(), i);
    }
    docs.into_iter()
        .enumerate()
        .filter(|(i, doc)| last_index_for_id.get(&doc.id) == Some(i))
        .map(|(_, doc)| doc)
        .collect()
}

/// Reads the map-key cells already on the stored document's
/// `marqo__score_modifiers` map whose key starts with `"<name>."`, i.e. every
/// entry previously flattened out of the map-numeric field `name`.
fn existing_map_keys(existing_fields: &serde_json::Map<String, Value>, name: &str) -> HashSet<String> {
    let prefix = format!("{}.", name);
    existing_fields
        .get(&format!("{}score_modifiers", RESERVED_PREFIX))
        .and_then(|v| v.as_object())
        .map(|modifiers| {
            modifiers
                .keys()
                .filter_map(|k| k.strip_prefix(&prefix).map(|_| k.clone()))
                .collect()
        })
        .unwrap_or_default()
}

fn render_update(index: &IndexDefinition, patch: &PatchDoc, existing: &Value) -> Result<UpdateDoc> {
    let existing_fields = existing.get("fields").and_then(|v| v.as_object());
    let create_timestamp = existing_fields
        .and_then(|f| f.get(&format!("{}create_timestamp", RESERVED_PREFIX)))
        .and_then(|v| v.as_f64());

    let mut fields = serde_json::Map::new();
    let mut touched_types: Vec<(String, &'static str)> = Vec::new();

    for (name, value) in &patch.fields {
        if let IndexDefinition::Structured { extra, .. } = index {
            let declared = extra.fields.iter().find(|f| &f.name == name);
            match declared {
                Some(f) if f.field_type == FieldType::MultimodalCombination => {
                    return Err(CoreError::UnsupportedFeature(format!("tensor field '{}' cannot be partially updated", name)));
                }
                Some(_) => {}
                None => return Err(CoreError::InvalidArgument(format!("field '{}' is not declared on this index", name))),
            }
            if extra.tensor_fields.iter().any(|t| &t.name == name) {
                return Err(CoreError::UnsupportedFeature(format!("tensor field '{}' cannot be partially updated", name)));
            }
        }

        match value {
            FieldValue::Int(_) | FieldValue::Long(_) => {
                let path = format!("{}score_modifiers{{{}}}", RESERVED_PREFIX, name);
                fields.insert(path, serde_json::json!({ "assign": numeric_value(value) }));
                fields.insert(name.clone(), serde_json::json!({ "assign": numeric_value(value) }));
                let token = crate::data::FieldTypeToken::Int;
                fields.insert(format!("{}field_types{{{}}}", RESERVED_PREFIX, name), serde_json::json!({ "assign": token.as_str() }));
                touched_types.push((name.clone(), token.as_str()));
            }
            FieldValue::Float(_) | FieldValue::Double(_) => {
                let path = format!("{}score_modifiers{{{}}}", RESERVED_PREFIX, name);
                fields.insert(path, serde_json::json!({ "assign": numeric_value(value) }));
                fields.insert(name.clone(), serde_json::json!({ "assign": numeric_value(value) }));
                let token = crate::data::FieldTypeToken::Float;
                fields.insert(format!("{}field_types{{{}}}", RESERVED_PREFIX, name), serde_json::json!({ "assign": token.as_str() }));
                touched_types.push((name.clone(), token.as_str()));
            }
            FieldValue::Text(text) => {
                fields.insert(format!("{}lexical_{}", RESERVED_PREFIX, name), serde_json::json!({ "assign": text }));
                let token = crate::data::FieldTypeToken::String;
                fields.insert(format!("{}field_types{{{}}}", RESERVED_PREFIX, name), serde_json::json!({ "assign": token.as_str() }));
                touched_types.push((name.clone(), token.as_str()));
            }
            FieldValue::Bool(b) => {
                fields.insert(name.clone(), serde_json::json!({ "assign": b }));
                let token = crate::data::FieldTypeToken::Bool;
                fields.insert(format!("{}field_types{{{}}}", RESERVED_PREFIX, name), serde_json::json!({ "assign": token.as_str() }));
                touched_types.push((name.clone(), token.as_str()));
            }
            FieldValue::ArrayText(items) => {
                fields.insert(name.clone(), serde_json::json!({ "assign": items }));
                let token = crate::data::FieldTypeToken::StringArray;
                fields.insert(format!("{}field_types{{{}}}", RESERVED_PREFIX, name), serde_json::json!({ "assign": token.as_str() }));
                touched_types.push((name.clone(), token.as_str()));
            }
            FieldValue::MapNumeric(map) => {
                for (key, n) in map {
                    let path = format!("{}score_modifiers{{{}.{}}}", RESERVED_PREFIX, name, key);
                    fields.insert(path, serde_json::json!({ "assign": n.as_f64() }));
                }
                // §4.4.6: keys present on the stored document but absent from this
                // patch's map are removed, along with their score-modifier cells.
                if let Some(existing_fields) = existing_fields {
                    for stale_key in existing_map_keys(existing_fields, name) {
                        let suffix = stale_key.strip_prefix(&format!("{}.", name)).unwrap_or(&stale_key);
                        if !map.contains_key(suffix) {
                            let path = format!("{}score_modifiers{{{}}}", RESERVED_PREFIX, stale_key);
                            fields.insert(path, serde_json::json!({ "remove": 1 }));
                        }
                    }
                }
                let token = if map.values().all(|n| matches!(n, crate::data::Number::Int(_))) {
                    crate::data::FieldTypeToken::IntMapEntry
                } else {
                    crate::data::FieldTypeToken::FloatMapEntry
                };
                fields.insert(format!("{}field_types{{{}}}", RESERVED_PREFIX, name), serde_json::json!({ "assign": token.as_str() }));
                touched_types.push((name.clone(), token.as_str()));
            }
            FieldValue::Media(url) => {
                fields.insert(format!("{}lexical_{}", RESERVED_PREFIX, name), serde_json::json!({ "assign": url }));
                let token = crate::data::FieldTypeToken::String;
                fields.insert(format!("{}field_types{{{}}}", RESERVED_PREFIX, name), serde_json::json!({ "assign": token.as_str() }));
                touched_types.push((name.clone(), token.as_str()));
            }
            FieldValue::ArrayInt(_) | FieldValue::ArrayFloat(_) | FieldValue::CustomVector { .. } => {
                return Err(CoreError::UnsupportedFeature(format!("field '{}' of this type does not support partial update", name)));
            }
        }
    }

    // §4.1/§4.4.6: optimistic precondition — id match; for each touched field the
    // stored type is either unset or equal to the type this patch is writing, and
    // never `tensor`; createTimestamp carried forward from the read document as
    // the version token.
    let mut clauses = vec![format!("id.id==\"{}\"", patch.id)];
    if let Some(ts) = create_timestamp {
        clauses.push(format!("{}create_timestamp=={}", RESERVED_PREFIX, ts));
    }
    for (name, token) in &touched_types {
        clauses.push(format!(
            "({p}field_types{{{n}}}==null or {p}field_types{{{n}}}==\"{t}\") and {p}field_types{{{n}}}!=\"{tensor}\"",
            p = RESERVED_PREFIX,
            n = name,
            t = token,
            tensor = crate::data::FieldTypeToken::Tensor.as_str()
        ));
    }
    if let Some(extra) = &patch.condition {
        clauses.push(extra.clone());
    }

    Ok(UpdateDoc { id: patch.id.clone(), fields: Value::Object(fields), condition: Some(clauses.join(" and ")), had_precondition: true })
}

fn numeric_value(value: &FieldValue) -> Value {
    match value {
        FieldValue::Int(i) => serde_json::json!(*i),
        FieldValue::Long(i) => serde_json::json!(*i),
        FieldValue::Float(f) => serde_json::json!(*f),
        FieldValue::Double(f) => serde_json::json!(*f),
        _ => Value::Null,
    }
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

    fn empty_existing() -> Value {
        serde_json::json!({ "fields": {} })
    }

    #[test]
    fn numeric_field_routes_to_score_modifier_map_key_and_plain_field() {
        let index = semi_structured_index();
        let mut fields = HashMap::new();
        fields.insert("views".to_string(), FieldValue::Long(42));
        let patch = PatchDoc { id: "1".into(), fields, condition: None };
        let update = render_update(&index, &patch, &empty_existing()).unwrap();
        let key = format!("{}score_modifiers{{views}}", crate::data::RESERVED_PREFIX);
        assert!(update.fields.get(&key).is_some());
        assert_eq!(update.fields.get("views").and_then(|v| v.get("assign")).and_then(|v| v.as_i64()), Some(42));
        let types_key = format!("{}field_types{{views}}", crate::data::RESERVED_PREFIX);
        assert_eq!(update.fields.get(&types_key).and_then(|v| v.get("assign")).and_then(|v| v.as_str()), Some("int"));
        assert!(update.had_precondition);
        assert!(update.condition.unwrap().contains("id.id==\"1\""));
    }

    #[test]
    fn create_timestamp_from_existing_document_is_carried_into_condition() {
        let index = semi_structured_index();
        let mut fields = HashMap::new();
        fields.insert("views".to_string(), FieldValue::Long(42));
        let patch = PatchDoc { id: "1".into(), fields, condition: None };
        let mut inner = serde_json::Map::new();
        inner.insert(format!("{}create_timestamp", crate::data::RESERVED_PREFIX), serde_json::json!(12345.0));
        let existing = Value::Object(serde_json::Map::from_iter([("fields".to_string(), Value::Object(inner))]));
        let update = render_update(&index, &patch, &existing).unwrap();
        assert!(update.condition.unwrap().contains("marqo__create_timestamp==12345"));
    }

    #[test]
    fn map_keys_absent_from_the_patch_but_present_on_the_stored_document_are_removed() {
        let index = semi_structured_index();
        let mut map = HashMap::new();
        map.insert("only".to_string(), crate::data::Number::Int(9));
        let mut fields = HashMap::new();
        fields.insert("m".to_string(), FieldValue::MapNumeric(map));
        let patch = PatchDoc { id: "1".into(), fields, condition: None };
        let existing = serde_json::json!({
            "fields": {
                format!("{}score_modifiers", crate::data::RESERVED_PREFIX): { "m.only": 1.0, "m.k": 2.0, "m.j": 3.0 }
            }
        });
        let update = render_update(&index, &patch, &existing).unwrap();
        let assigned = format!("{}score_modifiers{{m.only}}", crate::data::RESERVED_PREFIX);
        assert_eq!(update.fields.get(&assigned).and_then(|v| v.get("assign")).and_then(|v| v.as_f64()), Some(9.0));
        let removed_k = format!("{}score_modifiers{{m.k}}", crate::data::RESERVED_PREFIX);
        let removed_j = format!("{}score_modifiers{{m.j}}", crate::data::RESERVED_PREFIX);
        assert!(update.fields.get(&removed_k).and_then(|v| v.get("remove")).is_some());
        assert!(update.fields.get(&removed_j).and_then(|v| v.get("remove")).is_some());
    }

    #[test]
    fn duplicate_ids_keep_only_the_last_patch() {
        let mut f1 = HashMap::new();
        f1.insert("a".to_string(), FieldValue::Text("first".into()));
        let mut f2 = HashMap::new();
        f2.insert("a".to_string(), FieldValue::Text("second".into()));
        let docs = vec![PatchDoc { id: "1".into(), fields: f1, condition: None }, PatchDoc { id: "1".into(), fields: f2, condition: None }];
        let collapsed = collapse_duplicates(docs);
        assert_eq!(collapsed.len(), 1);
        assert!(matches!(collapsed[0].fields.get("a"), Some(FieldValue::Text(t)) if t == "second"));
    }
}
