//! Index definition data model (§3.1).

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::data::is_reserved_or_protected;
use crate::error::{CoreError, Result};

static INDEX_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_-][A-Za-z0-9_-]*$").unwrap());
static SCHEMA_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Legacy Unstructured indexes at or below this version reject hybrid search (§9 Open Questions).
/// Decision recorded in DESIGN.md: cutoff is inclusive-reject at `2.10`.
pub const HYBRID_SEARCH_MIN_UNSTRUCTURED_VERSION: (u32, u32) = (2, 11);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum IndexType {
    Structured,
    Unstructured,
    SemiStructured,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum FieldType {
    Text,
    Bool,
    Int,
    Long,
    Float,
    Double,
    ArrayText,
    ArrayInt,
    ArrayLong,
    ArrayFloat,
    ArrayDouble,
    ImagePointer,
    VideoPointer,
    AudioPointer,
    MultimodalCombination,
    CustomVector,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "PascalCase")]
pub enum FeatureFlag {
    LexicalSearch,
    ScoreModifier,
    Filter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    pub features: Vec<FeatureFlag>,
    /// Only set on `MultimodalCombination` fields (§3.1 invariants).
    pub dependent_fields: Option<HashMap<String, f64>>,
}

impl Field {
    pub fn lexical_field_name(&self) -> String {
        format!("{}lexical_{}", crate::data::RESERVED_PREFIX, self.name)
    }

    pub fn filter_field_name(&self) -> String {
        format!("{}filter_{}", crate::data::RESERVED_PREFIX, self.name)
    }

    pub fn validate(&self) -> Result<()> {
        if is_reserved_or_protected(&self.name) {
            return Err(CoreError::InvalidArgument(format!(
                "field name '{}' is reserved or protected",
                self.name
            )));
        }
        let lexical_ok = matches!(self.field_type, FieldType::Text | FieldType::ArrayText | FieldType::CustomVector);
        if self.features.contains(&FeatureFlag::LexicalSearch) && !lexical_ok {
            return Err(CoreError::InvalidArgument(format!(
                "LexicalSearch is not valid on field '{}' of type {:?}",
                self.name, self.field_type
            )));
        }
        let numeric_like = matches!(
            self.field_type,
            FieldType::Int | FieldType::Long | FieldType::Float | FieldType::Double
        );
        if self.features.contains(&FeatureFlag::ScoreModifier) && !numeric_like {
            return Err(CoreError::InvalidArgument(format!(
                "ScoreModifier is not valid on field '{}' of type {:?}",
                self.name, self.field_type
            )));
        }
        match self.field_type {
            FieldType::MultimodalCombination => {
                let deps = self.dependent_fields.as_ref();
                if deps.map(|d| d.is_empty()).unwrap_or(true) {
                    return Err(CoreError::InvalidArgument(format!(
                        "MultimodalCombination field '{}' requires non-empty dependentFields",
                        self.name
                    )));
                }
                if !self.features.is_empty() {
                    return Err(CoreError::InvalidArgument(format!(
                        "MultimodalCombination field '{}' forbids feature flags",
                        self.name
                    )));
                }
            }
            _ => {
                if self.dependent_fields.is_some() {
                    return Err(CoreError::InvalidArgument(format!(
                        "field '{}' is not a multimodal combination and forbids dependentFields",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorField {
    pub name: String,
}

impl TensorField {
    pub fn chunk_field_name(&self) -> String {
        format!("{}chunks_{}", crate::data::RESERVED_PREFIX, self.name)
    }

    pub fn embedding_field_name(&self) -> String {
        format!("{}embeddings_{}", crate::data::RESERVED_PREFIX, self.name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    Euclidean,
    Angular,
    Dotproduct,
    PrenormalizedAngular,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VectorNumericType {
    Float32,
    Bfloat16,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HnswConfig {
    pub ef_construction: u32,
    pub m: u32,
}

impl HnswConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ef_construction == 0 || self.m == 0 {
            return Err(CoreError::InvalidArgument(
                "HNSW efConstruction and m must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub properties: Option<serde_json::Value>,
    pub text_query_prefix: Option<String>,
    pub text_chunk_prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PreprocessingConfig {
    pub patch_method: Option<String>,
    pub split_length: Option<u32>,
    pub split_overlap: Option<u32>,
}

/// Common header shared by all three index-type variants (§3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexCommon {
    pub name: String,
    pub schema_name: String,
    pub index_type: IndexType,
    pub model: ModelConfig,
    pub normalize_embeddings: bool,
    pub text_preprocessing: PreprocessingConfig,
    pub image_preprocessing: PreprocessingConfig,
    pub video_preprocessing: PreprocessingConfig,
    pub audio_preprocessing: PreprocessingConfig,
    pub distance_metric: DistanceMetric,
    pub vector_numeric_type: VectorNumericType,
    pub hnsw_config: HnswConfig,
    /// Fixed output dimension of `model`, used to size the `embeddings` tensor field.
    pub embedding_dim: u32,
    pub marqo_version: String,
    pub created_at: f64,
    pub updated_at: f64,
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredExtra {
    pub fields: Vec<Field>,
    pub tensor_fields: Vec<TensorField>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnstructuredExtra {
    pub treat_urls_and_pointers_as_images: bool,
    pub treat_urls_and_pointers_as_media: bool,
    pub filter_string_max_length: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemiStructuredExtra {
    pub unstructured: UnstructuredExtra,
    pub lexical_fields: Vec<String>,
    pub tensor_fields: Vec<String>,
    pub string_array_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IndexDefinition {
    Structured { common: IndexCommon, extra: StructuredExtra },
    Unstructured { common: IndexCommon, extra: UnstructuredExtra },
    SemiStructured { common: IndexCommon, extra: SemiStructuredExtra },
}

impl IndexDefinition {
    pub fn common(&self) -> &IndexCommon {
        match self {
            IndexDefinition::Structured { common, .. } => common,
            IndexDefinition::Unstructured { common, .. } => common,
            IndexDefinition::SemiStructured { common, .. } => common,
        }
    }

    pub fn common_mut(&mut self) -> &mut IndexCommon {
        match self {
            IndexDefinition::Structured { common, .. } => common,
            IndexDefinition::Unstructured { common, .. } => common,
            IndexDefinition::SemiStructured { common, .. } => common,
        }
    }

    pub fn name(&self) -> &str {
        &self.common().name
    }

    pub fn version(&self) -> u32 {
        self.common().version
    }

    pub fn index_type(&self) -> IndexType {
        self.common().index_type
    }

    /// Validates the common header and any type-specific invariants (§3.1).
    pub fn validate(&self) -> Result<()> {
        validate_index_name(&self.common().name)?;
        if !SCHEMA_NAME_RE.is_match(&self.common().schema_name) {
            return Err(CoreError::InvalidArgument(format!(
                "schema name '{}' is invalid",
                self.common().schema_name
            )));
        }
        self.common().hnsw_config.validate()?;

        if let IndexDefinition::Structured { extra, .. } = self {
            for field in &extra.fields {
                field.validate()?;
            }
            let declared: std::collections::HashSet<&str> =
                extra.fields.iter().map(|f| f.name.as_str()).collect();
            for tf in &extra.tensor_fields {
                if !declared.contains(tf.name.as_str()) {
                    return Err(CoreError::InvalidArgument(format!(
                        "tensor field '{}' does not reference a declared field",
                        tf.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Whether hybrid search is permitted on this index (§9 Open Questions).
    pub fn supports_hybrid_search(&self) -> bool {
        match self {
            IndexDefinition::Unstructured { common, .. } => {
                parse_marqo_version(&common.marqo_version)
                    .map(|(maj, min)| (maj, min) >= HYBRID_SEARCH_MIN_UNSTRUCTURED_VERSION)
                    .unwrap_or(true)
            }
            _ => true,
        }
    }
}

fn parse_marqo_version(v: &str) -> Option<(u32, u32)> {
    let mut parts = v.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

pub fn validate_index_name(name: &str) -> Result<()> {
    if !INDEX_NAME_RE.is_match(name) {
        return Err(CoreError::InvalidArgument(format!(
            "index name '{}' must match [A-Za-z_-][A-Za-z0-9_-]*",
            name
        )));
    }
    if name.starts_with(crate::data::RESERVED_PREFIX) {
        return Err(CoreError::InvalidArgument(format!(
            "index name '{}' must not start with the reserved prefix",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn common(index_type: IndexType) -> IndexCommon {
        IndexCommon {
            name: "my-index".to_string(),
            schema_name: "my_index".to_string(),
            index_type,
            model: ModelConfig { name: "model".into(), properties: None, text_query_prefix: None, text_chunk_prefix: None },
            normalize_embeddings: true,
            text_preprocessing: Default::default(),
            image_preprocessing: Default::default(),
            video_preprocessing: Default::default(),
            audio_preprocessing: Default::default(),
            distance_metric: DistanceMetric::Angular,
            vector_numeric_type: VectorNumericType::Float32,
            hnsw_config: HnswConfig { ef_construction: 128, m: 16 },
            embedding_dim: 768,
            marqo_version: "2.13.0".to_string(),
            created_at: 0.0,
            updated_at: 0.0,
            version: 1,
        }
    }

    #[test]
    fn rejects_reserved_prefix_name() {
        assert!(validate_index_name("marqo__reserved").is_err());
    }

    #[test]
    fn rejects_bad_name_chars() {
        assert!(validate_index_name("bad name!").is_err());
        assert!(validate_index_name("ok_name-1").is_ok());
    }

    #[test]
    fn tensor_field_must_reference_declared_field() {
        let def = IndexDefinition::Structured {
            common: common(IndexType::Structured),
            extra: StructuredExtra {
                fields: vec![Field {
                    name: "title".into(),
                    field_type: FieldType::Text,
                    features: vec![FeatureFlag::LexicalSearch],
                    dependent_fields: None,
                }],
                tensor_fields: vec![TensorField { name: "missing".into() }],
            },
        };
        assert!(def.validate().is_err());
    }

    #[test]
    fn multimodal_combination_requires_dependent_fields() {
        let f = Field {
            name: "combo".into(),
            field_type: FieldType::MultimodalCombination,
            features: vec![],
            dependent_fields: None,
        };
        assert!(f.validate().is_err());
    }

    #[test]
    fn hybrid_search_gated_by_legacy_version() {
        let mut c = common(IndexType::Unstructured);
        c.marqo_version = "2.9.0".to_string();
        let def = IndexDefinition::Unstructured {
            common: c,
            extra: UnstructuredExtra {
                treat_urls_and_pointers_as_images: true,
                treat_urls_and_pointers_as_media: false,
                filter_string_max_length: 200,
            },
        };
        assert!(!def.supports_hybrid_search());
    }
}
