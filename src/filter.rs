//! Filter expression tree and compiler (§3.4).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::index::definition::{FeatureFlag, IndexDefinition, IndexType};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    EqualityTerm { field: String, value: Value },
    RangeTerm { field: String, lower: Option<f64>, upper: Option<f64> },
    InTerm { field: String, values: Vec<Value> },
}

/// Compiles a `Filter` tree into a store-native predicate string.
///
/// `_id` is mapped to the document-id field; other fields are routed by
/// bucket (filter-eligible short string, numeric, bool) according to the
/// index definition. For Unstructured indexes, `InTerm` is unsupported (§3.4).
pub fn compile(filter: &Filter, index: &IndexDefinition) -> Result<String> {
    Ok(format!("({})", compile_node(filter, index)?))
}

fn compile_node(filter: &Filter, index: &IndexDefinition) -> Result<String> {
    match filter {
        Filter::And(children) => join(children, index, "AND"),
        Filter::Or(children) => join(children, index, "OR"),
        Filter::Not(inner) => Ok(format!("!({})", compile_node(inner, index)?)),
        Filter::EqualityTerm { field, value } => compile_equality(field, value, index),
        Filter::RangeTerm { field, lower, upper } => compile_range(field, *lower, *upper, index),
        Filter::InTerm { field, values } => compile_in(field, values, index),
    }
}

fn join(children: &[Filter], index: &IndexDefinition, op: &str) -> Result<String> {
    if children.is_empty() {
        return Err(CoreError::InvalidArgument("empty filter group".to_string()));
    }
    let parts: Result<Vec<String>> = children.iter().map(|c| compile_node(c, index)).collect();
    Ok(format!("({})", parts?.join(&format!(" {} ", op))))
}

fn filter_field_name(field: &str, index: &IndexDefinition) -> Result<String> {
    if field == "_id" {
        return Ok("id".to_string());
    }
    match index {
        IndexDefinition::Structured { extra, .. } => {
            let declared = extra
                .fields
                .iter()
                .find(|f| f.name == field)
                .ok_or_else(|| CoreError::InvalidArgument(format!("unknown filter field '{}'", field)))?;
            if !declared.features.contains(&FeatureFlag::Filter) {
                return Err(CoreError::InvalidArgument(format!(
                    "field '{}' is not filterable",
                    field
                )));
            }
            Ok(format!("{}filter_{}", crate::data::RESERVED_PREFIX, field))
        }
        _ => Ok(format!("{}filter_{}", crate::data::RESERVED_PREFIX, field)),
    }
}

fn compile_equality(field: &str, value: &Value, index: &IndexDefinition) -> Result<String> {
    let name = filter_field_name(field, index)?;
    let literal = value_literal(value);
    Ok(format!("{} contains {}", name, literal))
}

fn compile_range(field: &str, lower: Option<f64>, upper: Option<f64>, index: &IndexDefinition) -> Result<String> {
    let name = filter_field_name(field, index)?;
    let mut clauses = Vec::new();
    if let Some(lo) = lower {
        clauses.push(format!("{} >= {}", name, lo));
    }
    if let Some(hi) = upper {
        clauses.push(format!("{} <= {}", name, hi));
    }
    if clauses.is_empty() {
        return Err(CoreError::InvalidArgument(format!(
            "range term on '{}' has neither bound",
            field
        )));
    }
    Ok(format!("({})", clauses.join(" AND ")))
}

fn compile_in(field: &str, values: &[Value], index: &IndexDefinition) -> Result<String> {
    if matches!(index.index_type(), IndexType::Unstructured) {
        return Err(CoreError::UnsupportedFeature(
            "IN filters are not supported on legacy Unstructured indexes".to_string(),
        ));
    }
    let name = filter_field_name(field, index)?;
    let parts: Vec<String> = values.iter().map(|v| format!("{} contains {}", name, value_literal(v))).collect();
    Ok(format!("({})", parts.join(" OR ")))
}

fn value_literal(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{}\"", s.replace('"', "\\\"")),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::definition::*;

    fn structured_index() -> IndexDefinition {
        IndexDefinition::Structured {
            common: IndexCommon {
                name: "idx".into(),
                schema_name: "idx".into(),
                index_type: IndexType::Structured,
                model: ModelConfig { name: "m".into(), properties: None, text_query_prefix: None, text_chunk_prefix: None },
                normalize_embeddings: true,
                text_preprocessing: Default::default(),
                image_preprocessing: Default::default(),
                video_preprocessing: Default::default(),
                audio_preprocessing: Default::default(),
                distance_metric: DistanceMetric::Angular,
                vector_numeric_type: VectorNumericType::Float32,
                hnsw_config: HnswConfig { ef_construction: 128, m: 16 },
                embedding_dim: 768,
                marqo_version: "2.13.0".into(),
                created_at: 0.0,
                updated_at: 0.0,
                version: 1,
            },
            extra: StructuredExtra {
                fields: vec![Field {
                    name: "brand".into(),
                    field_type: FieldType::Text,
                    features: vec![FeatureFlag::Filter],
                    dependent_fields: None,
                }],
                tensor_fields: vec![],
            },
        }
    }

    #[test]
    fn compiles_equality_on_filterable_field() {
        let idx = structured_index();
        let f = Filter::EqualityTerm { field: "brand".into(), value: serde_json::json!("nike") };
        let compiled = compile(&f, &idx).unwrap();
        assert!(compiled.contains("marqo__filter_brand contains \"nike\""));
    }

    #[test]
    fn rejects_equality_on_non_filterable_field() {
        let idx = structured_index();
        let f = Filter::EqualityTerm { field: "unknown".into(), value: serde_json::json!(1) };
        assert!(compile(&f, &idx).is_err());
    }

    #[test]
    fn id_maps_to_document_id_field() {
        let idx = structured_index();
        let f = Filter::EqualityTerm { field: "_id".into(), value: serde_json::json!("doc-1") };
        let compiled = compile(&f, &idx).unwrap();
        assert!(compiled.contains("id contains \"doc-1\""));
    }

    #[test]
    fn in_term_rejected_on_unstructured() {
        let common = IndexCommon {
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
            embedding_dim: 768,
            marqo_version: "2.13.0".into(),
            created_at: 0.0,
            updated_at: 0.0,
            version: 1,
        };
        let idx = IndexDefinition::Unstructured {
            common,
            extra: UnstructuredExtra {
                treat_urls_and_pointers_as_images: true,
                treat_urls_and_pointers_as_media: false,
                filter_string_max_length: 200,
            },
        };
        let f = Filter::InTerm { field: "brand".into(), values: vec![serde_json::json!("nike")] };
        assert!(compile(&f, &idx).is_err());
    }
}
