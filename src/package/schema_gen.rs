//! Deterministic schema-file rendering (§4.3 "Schema generation").
//!
//! Grounded in the teacher's `indexer/app_package.rs::AppPackage::from_dynamic_json`,
//! generalized from one hardcoded ecommerce schema to per-index generation
//! driven by `IndexDefinition`.

use crate::index::definition::{
    DistanceMetric, FeatureFlag, FieldType, IndexCommon, VectorNumericType,
};

fn vespa_distance_metric(metric: DistanceMetric) -> &'static str {
    match metric {
        DistanceMetric::Euclidean => "euclidean",
        DistanceMetric::Angular => "angular",
        DistanceMetric::Dotproduct => "dotproduct",
        DistanceMetric::PrenormalizedAngular => "prenormalized-angular",
    }
}

fn vespa_numeric_type(t: VectorNumericType) -> &'static str {
    match t {
        VectorNumericType::Float32 => "float",
        VectorNumericType::Bfloat16 => "bfloat16",
    }
}

fn field_type_vespa(t: FieldType) -> &'static str {
    match t {
        FieldType::Text => "string",
        FieldType::Bool => "bool",
        FieldType::Int => "int",
        FieldType::Long => "long",
        FieldType::Float => "float",
        FieldType::Double => "double",
        FieldType::ArrayText => "array<string>",
        FieldType::ArrayInt => "array<int>",
        FieldType::ArrayLong => "array<long>",
        FieldType::ArrayFloat => "array<float>",
        FieldType::ArrayDouble => "array<double>",
        FieldType::ImagePointer | FieldType::VideoPointer | FieldType::AudioPointer => "string",
        FieldType::MultimodalCombination | FieldType::CustomVector => "string",
    }
}

const RANK_PROFILE_NAMES: [&str; 6] = [
    "embedding_similarity",
    "bm25",
    "hybrid_bm25_then_embedding_similarity",
    "hybrid_embedding_similarity_then_bm25",
    "hybrid_embedding_similarity_then_bm25_inverse",
    "hybrid_bm25_then_embedding_similarity_inverse",
];

fn render_tensor_field(name: &str, dim: u32, metric: DistanceMetric, numeric: VectorNumericType, hnsw_ef: u32, hnsw_m: u32) -> String {
    let chunks_field = format!("{}chunks_{}", crate::data::RESERVED_PREFIX, name);
    let embeddings_field = format!("{}embeddings_{}", crate::data::RESERVED_PREFIX, name);
    format!(
        "    field {chunks} type array<string> {{\n        indexing: attribute | summary\n    }}\n    field {embeddings} type tensor<{numeric}>(p{{}}, x[{dim}]) {{\n        indexing: attribute | index | summary\n        attribute {{\n            distance-metric: {metric}\n        }}\n        index {{\n            hnsw {{\n                max-links-per-node: {m}\n                neighbors-to-explore-at-insert: {ef}\n            }}\n        }}\n    }}\n",
        chunks = chunks_field,
        embeddings = embeddings_field,
        numeric = vespa_numeric_type(numeric),
        dim = dim,
        metric = vespa_distance_metric(metric),
        m = hnsw_m,
        ef = hnsw_ef,
    )
}

fn render_rank_profiles() -> String {
    let mut out = String::new();
    for name in RANK_PROFILE_NAMES {
        out.push_str(&format!(
            "    rank-profile {name} inherits default {{\n        first-phase {{\n            expression: nativeRank\n        }}\n    }}\n",
            name = name
        ));
    }
    out
}

/// Renders a Structured index's `.sd` file.
pub fn render_structured_schema(common: &IndexCommon, extra: &crate::index::definition::StructuredExtra, dim: u32) -> String {
    let mut body = String::new();
    body.push_str(&format!("schema {} {{\n", common.schema_name));
    body.push_str(&format!("    document {} {{\n", common.schema_name));
    body.push_str("        field id type string {\n            indexing: attribute | summary\n        }\n");

    for field in &extra.fields {
        body.push_str(&format!(
            "        field {} type {} {{\n            indexing: summary\n        }}\n",
            field.name,
            field_type_vespa(field.field_type)
        ));
        if field.features.contains(&FeatureFlag::LexicalSearch) {
            body.push_str(&format!(
                "        field {} type string {{\n            indexing: index | summary\n            index: enable-bm25\n        }}\n",
                field.lexical_field_name()
            ));
        }
        if field.features.contains(&FeatureFlag::Filter) {
            body.push_str(&format!(
                "        field {} type string {{\n            indexing: attribute\n            attribute: fast-search\n        }}\n",
                field.filter_field_name()
            ));
        }
        if field.features.contains(&FeatureFlag::ScoreModifier) {
            body.push_str(
                "        field marqo__score_modifiers type tensor<double>(p{}) {\n            indexing: attribute\n        }\n",
            );
        }
    }
    body.push_str("    }\n\n");

    for tf in &extra.tensor_fields {
        body.push_str(&render_tensor_field(
            &tf.name,
            dim,
            common.distance_metric,
            common.vector_numeric_type,
            common.hnsw_config.ef_construction,
            common.hnsw_config.m,
        ));
    }

    body.push_str(&render_rank_profiles());
    body.push_str("}\n");
    body
}

/// Renders a SemiStructured index's `.sd` file: generic containers plus the
/// declared lexical/tensor/string-array fields that grow monotonically (§4.3).
pub fn render_semi_structured_schema(
    common: &IndexCommon,
    extra: &crate::index::definition::SemiStructuredExtra,
    dim: u32,
    at_partial_update_version: bool,
) -> String {
    let mut body = String::new();
    body.push_str(&format!("schema {} {{\n", common.schema_name));
    body.push_str(&format!("    document {} {{\n", common.schema_name));
    body.push_str("        field id type string {\n            indexing: attribute | summary\n        }\n");
    body.push_str("        field short_strings_fields type map<string,string> {\n            indexing: summary\n        }\n");
    body.push_str("        field int_fields type map<string,long> {\n            indexing: summary\n        }\n");
    body.push_str("        field float_fields type map<string,double> {\n            indexing: summary\n        }\n");
    body.push_str("        field bool_fields type map<string,byte> {\n            indexing: summary\n        }\n");
    body.push_str("        field score_modifiers type tensor<double>(p{}) {\n            indexing: attribute\n        }\n");
    body.push_str("        field vespa_multimodal_params type map<string,string> {\n            indexing: summary\n        }\n");
    if at_partial_update_version {
        body.push_str("        field field_types type map<string,string> {\n            indexing: summary\n        }\n");
    }

    if extra.string_array_fields.is_empty() {
        body.push_str("        field string_array type array<string> {\n            indexing: attribute | summary\n            attribute: fast-search\n        }\n");
    } else {
        for name in &extra.string_array_fields {
            body.push_str(&format!(
                "        field marqo__string_array_{} type array<string> {{\n            indexing: attribute | summary\n            attribute: fast-search\n        }}\n",
                name
            ));
        }
    }

    for name in &extra.lexical_fields {
        body.push_str(&format!(
            "        field {}lexical_{} type string {{\n            indexing: index | summary\n            index: enable-bm25\n        }}\n",
            crate::data::RESERVED_PREFIX,
            name
        ));
    }
    body.push_str("    }\n\n");

    for name in &extra.tensor_fields {
        body.push_str(&render_tensor_field(
            name,
            dim,
            common.distance_metric,
            common.vector_numeric_type,
            common.hnsw_config.ef_construction,
            common.hnsw_config.m,
        ));
    }

    body.push_str(&render_rank_profiles());
    body.push_str("}\n");
    body
}

/// Renders `services.xml`'s cluster topology with one `content.documents` entry per schema.
pub fn render_services_xml(schema_names: &[String], cluster_id: &str) -> String {
    let documents: String = schema_names
        .iter()
        .map(|s| format!("            <document type=\"{0}\" mode=\"index\"/>\n", s))
        .collect();
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<services version=\"1.0\">\n    <container id=\"default\" version=\"1.0\">\n        <search/>\n        <document-api/>\n    </container>\n    <content id=\"{cluster}\" version=\"1.0\">\n        <redundancy>1</redundancy>\n        <documents>\n{documents}        </documents>\n        <nodes>\n            <node hostalias=\"node1\" distribution-key=\"0\"/>\n        </nodes>\n    </content>\n</services>\n",
        cluster = cluster_id,
        documents = documents,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::definition::*;

    fn common() -> IndexCommon {
        IndexCommon {
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
        }
    }

    #[test]
    fn structured_schema_contains_lexical_and_tensor_fields() {
        let extra = StructuredExtra {
            fields: vec![Field {
                name: "title".into(),
                field_type: FieldType::Text,
                features: vec![FeatureFlag::LexicalSearch, FeatureFlag::Filter],
                dependent_fields: None,
            }],
            tensor_fields: vec![TensorField { name: "title".into() }],
        };
        let sd = render_structured_schema(&common(), &extra, 768);
        assert!(sd.contains("marqo__lexical_title"));
        assert!(sd.contains("marqo__filter_title"));
        assert!(sd.contains("marqo__embeddings_title"));
        assert!(sd.contains("enable-bm25"));
        assert!(sd.contains("hybrid_bm25_then_embedding_similarity"));
    }

    #[test]
    fn semi_structured_schema_uses_per_field_string_arrays_when_declared() {
        let extra = SemiStructuredExtra {
            unstructured: UnstructuredExtra {
                treat_urls_and_pointers_as_images: true,
                treat_urls_and_pointers_as_media: false,
                filter_string_max_length: 200,
            },
            lexical_fields: vec!["title".into()],
            tensor_fields: vec!["title".into()],
            string_array_fields: vec!["tags".into()],
        };
        let sd = render_semi_structured_schema(&common(), &extra, 768, true);
        assert!(sd.contains("marqo__string_array_tags"));
        assert!(sd.contains("field_types"));
        assert!(!sd.contains("field string_array type"));
    }

    #[test]
    fn services_xml_has_one_entry_per_schema() {
        let xml = render_services_xml(&["a".to_string(), "b".to_string()], "default-app");
        assert!(xml.contains("type=\"a\""));
        assert!(xml.contains("type=\"b\""));
    }
}
