//! Embedding (§4.4.4): turns each document's tensor-field content into
//! chunks and vectors, batched through the `Vectoriser` one of three ways.
//!
//! `Vectoriser::embed_batch` is required to be a pure function of each
//! input (see `embedder` module docs), so `PerField`/`PerDocument`/
//! `PerBatch` only change how many RPCs are issued, never the resulting
//! vectors — the grouping is just a fan-out strategy.

use std::collections::HashMap;

use crate::data::{FieldValue, TensorFieldChunks};
use crate::embedder::{EmbedInput, Modality, Vectoriser};
use crate::error::{CoreError, Result};
use crate::index::definition::{FieldType, IndexDefinition};

use super::media::MediaSlot;
use super::validate::{BatchVectorisationMode, ValidatedDoc};
use super::MediaRepo;

/// `doc_id -> field_name -> chunks/embeddings`.
pub type DocumentEmbeddings = HashMap<String, HashMap<String, TensorFieldChunks>>;

struct PendingInput {
    doc_id: String,
    field_name: String,
    chunk_label: String,
    input: EmbedInput,
}

/// Embeds every document's tensor fields. A document whose media or
/// multimodal-combination inputs fail to resolve is dropped from the
/// returned map and reported in the error map instead of failing the whole
/// batch (§4.4 fail isolation).
pub async fn embed_documents(
    vectoriser: &dyn Vectoriser,
    index: &IndexDefinition,
    docs: &[ValidatedDoc],
    media_repo: &MediaRepo,
    mode: BatchVectorisationMode,
) -> Result<(DocumentEmbeddings, HashMap<String, CoreError>)> {
    let mut pending = Vec::new();
    let mut errors: HashMap<String, CoreError> = HashMap::new();
    let mut results: DocumentEmbeddings = HashMap::new();

    for doc in docs {
        for field_name in &doc.tensor_field_names {
            if let Err(err) = collect_inputs(vectoriser, index, doc, field_name, media_repo, &mut pending, &mut results) {
                errors.entry(doc.id.clone()).or_insert(err);
            }
        }
    }

    pending.retain(|p| !errors.contains_key(&p.doc_id));

    for batch in partition(pending, mode) {
        let inputs: Vec<EmbedInput> = batch.iter().map(|p| p.input.clone()).collect();
        let vectors = vectoriser.embed_batch(&inputs).await?;
        for (pending_input, vector) in batch.into_iter().zip(vectors) {
            let per_doc = results.entry(pending_input.doc_id).or_default();
            let chunks = per_doc.entry(pending_input.field_name).or_default();
            chunks.chunks.push(pending_input.chunk_label);
            chunks.embeddings.push(vector);
        }
    }

    for doc_id in errors.keys() {
        results.remove(doc_id);
    }

    combine_multimodal_fields(index, docs, &mut results);

    Ok((results, errors))
}

/// Folds each multimodal combination field's dependents (already embedded
/// above under their own field names) into the combination field's own
/// weighted, L2-normalized vector, then drops the dependents' standalone
/// entries unless they are also independently declared tensor fields.
fn combine_multimodal_fields(index: &IndexDefinition, docs: &[ValidatedDoc], results: &mut DocumentEmbeddings) {
    let IndexDefinition::Structured { common, extra } = index else { return };
    let standalone_tensor_fields: std::collections::HashSet<&str> = extra.tensor_fields.iter().map(|t| t.name.as_str()).collect();

    for doc in docs {
        for field in &extra.fields {
            if field.field_type != FieldType::MultimodalCombination || !doc.tensor_field_names.contains(&field.name) {
                continue;
            }
            let Some(deps) = &field.dependent_fields else { continue };
            let Some(per_doc) = results.get(&doc.id) else { continue };

            let mut combined: Option<Vec<f32>> = None;
            for (dep_name, weight) in deps {
                let Some(chunks) = per_doc.get(dep_name) else { continue };
                let Some(vector) = average_vector(&chunks.embeddings) else { continue };
                let weighted: Vec<f32> = vector.iter().map(|v| v * (*weight as f32)).collect();
                combined = Some(match combined {
                    Some(acc) => acc.iter().zip(weighted.iter()).map(|(a, b)| a + b).collect(),
                    None => weighted,
                });
            }

            if let Some(mut vector) = combined {
                if common.normalize_embeddings {
                    l2_normalize(&mut vector);
                }
                let dep_names: Vec<String> = deps.keys().cloned().collect();
                let per_doc = results.entry(doc.id.clone()).or_default();
                per_doc.insert(field.name.clone(), TensorFieldChunks { chunks: vec![field.name.clone()], embeddings: vec![vector] });
                for dep_name in dep_names {
                    if !standalone_tensor_fields.contains(dep_name.as_str()) {
                        per_doc.remove(&dep_name);
                    }
                }
            }
        }
    }
}

fn average_vector(embeddings: &[Vec<f32>]) -> Option<Vec<f32>> {
    if embeddings.is_empty() {
        return None;
    }
    let dim = embeddings[0].len();
    let mut sum = vec![0.0f32; dim];
    for e in embeddings {
        for (s, v) in sum.iter_mut().zip(e.iter()) {
            *s += v;
        }
    }
    let n = embeddings.len() as f32;
    for s in sum.iter_mut() {
        *s /= n;
    }
    Some(sum)
}

fn collect_inputs(
    vectoriser: &dyn Vectoriser,
    index: &IndexDefinition,
    doc: &ValidatedDoc,
    field_name: &str,
    media_repo: &MediaRepo,
    pending: &mut Vec<PendingInput>,
    literal_results: &mut DocumentEmbeddings,
) -> Result<()> {
    if let IndexDefinition::Structured { extra, .. } = index {
        if let Some(field) = extra.fields.iter().find(|f| f.name == field_name) {
            if field.field_type == FieldType::MultimodalCombination {
                return collect_multimodal_combination(vectoriser, index, doc, field_name, field.dependent_fields.as_ref(), media_repo, pending, literal_results);
            }
        }
    }

    let Some(value) = doc.fields.get(field_name) else { return Ok(()) };
    match value {
        FieldValue::CustomVector { content, vector } => {
            // Custom vectors bypass the vectoriser entirely: the caller already
            // supplied the embedding, so it is stored verbatim (§4.4.4).
            let chunks = literal_results.entry(doc.id.clone()).or_default().entry(field_name.to_string()).or_default();
            chunks.chunks.push(content.clone().unwrap_or_default());
            chunks.embeddings.push(vector.clone());
            Ok(())
        }
        FieldValue::Text(text) => {
            if !vectoriser.supported_modalities().contains(&Modality::Text) {
                return Err(CoreError::UnsupportedModality(format!("field '{}' is text but the model does not support the Text modality", field_name)));
            }
            pending.push(PendingInput {
                doc_id: doc.id.clone(),
                field_name: field_name.to_string(),
                chunk_label: text.clone(),
                input: EmbedInput::Text(prefixed(index, text)),
            });
            Ok(())
        }
        FieldValue::Media(url) => match media_repo.get(url) {
            Some(MediaSlot::Ready { modality, bytes }) => {
                // §4.4.3 step 3: the model's capability set gates the field, not
                // just whether the download itself succeeded.
                if !vectoriser.supported_modalities().contains(modality) {
                    return Err(CoreError::UnsupportedModality(format!("field '{}' resolved to {:?} but the model does not support it", field_name, modality)));
                }
                pending.push(PendingInput {
                    doc_id: doc.id.clone(),
                    field_name: field_name.to_string(),
                    chunk_label: url.clone(),
                    input: EmbedInput::Media(*modality, bytes.clone()),
                });
                Ok(())
            }
            Some(MediaSlot::Error(err)) => Err(err.clone()),
            None => Err(CoreError::MediaDownloadError(format!("no download result for '{}'", url))),
        },
        _ => Ok(()),
    }
}

/// Weighted sum of dependent fields' embeddings, L2-normalized (§4.4.4).
fn collect_multimodal_combination(
    vectoriser: &dyn Vectoriser,
    index: &IndexDefinition,
    doc: &ValidatedDoc,
    field_name: &str,
    dependent_fields: Option<&HashMap<String, f64>>,
    media_repo: &MediaRepo,
    pending: &mut Vec<PendingInput>,
    literal_results: &mut DocumentEmbeddings,
) -> Result<()> {
    let Some(deps) = dependent_fields else {
        return Err(CoreError::InvalidArgument(format!("multimodal combination field '{}' has no dependentFields", field_name)));
    };
    for dep_name in deps.keys() {
        if doc.fields.contains_key(dep_name) {
            collect_inputs(vectoriser, index, doc, dep_name, media_repo, pending, literal_results)?;
        }
    }
    Ok(())
}

fn prefixed(index: &IndexDefinition, text: &str) -> String {
    match &index.common().model.text_chunk_prefix {
        Some(prefix) => format!("{}{}", prefix, text),
        None => text.to_string(),
    }
}

fn partition(pending: Vec<PendingInput>, mode: BatchVectorisationMode) -> Vec<Vec<PendingInput>> {
    match mode {
        BatchVectorisationMode::PerBatch => vec![pending],
        BatchVectorisationMode::PerDocument => {
            let mut by_doc: Vec<(String, Vec<PendingInput>)> = Vec::new();
            for p in pending {
                match by_doc.iter_mut().find(|(id, _)| *id == p.doc_id) {
                    Some((_, v)) => v.push(p),
                    None => by_doc.push((p.doc_id.clone(), vec![p])),
                }
            }
            by_doc.into_iter().map(|(_, v)| v).collect()
        }
        BatchVectorisationMode::PerField => {
            let mut by_field: Vec<(String, Vec<PendingInput>)> = Vec::new();
            for p in pending {
                match by_field.iter_mut().find(|(name, _)| *name == p.field_name) {
                    Some((_, v)) => v.push(p),
                    None => by_field.push((p.field_name.clone(), vec![p])),
                }
            }
            by_field.into_iter().map(|(_, v)| v).collect()
        }
    }
}

/// L2-normalizes a vector in place; a no-op on an all-zero vector (§4.4.4 "normalize_embeddings").
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::definition::*;
    use std::collections::HashMap as Map;

    struct TextOnlyVectoriser;
    #[async_trait::async_trait]
    impl Vectoriser for TextOnlyVectoriser {
        fn supported_modalities(&self) -> &[Modality] {
            &[Modality::Text]
        }
        fn dimension(&self) -> u32 {
            2
        }
        async fn embed_batch(&self, inputs: &[EmbedInput]) -> Result<Vec<Vec<f32>>> {
            Ok(inputs.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

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
                embedding_dim: 2,
                marqo_version: "2.13.0".into(),
                created_at: 0.0,
                updated_at: 0.0,
                version: 1,
            },
            extra: UnstructuredExtra { treat_urls_and_pointers_as_images: true, treat_urls_and_pointers_as_media: false, filter_string_max_length: 200 },
        }
    }

    #[tokio::test]
    async fn media_field_whose_modality_the_model_does_not_support_is_a_per_doc_error() {
        let index = unstructured_index();
        let mut fields = Map::new();
        fields.insert("photo".to_string(), FieldValue::Media("https://example.com/a.jpg".to_string()));
        let doc = ValidatedDoc { id: "1".into(), fields, tensor_field_names: vec!["photo".to_string()], new_lexical_fields: vec![], new_tensor_fields: vec![], new_string_array_fields: vec![] };
        let mut media_repo: MediaRepo = Map::new();
        media_repo.insert("https://example.com/a.jpg".to_string(), MediaSlot::Ready { modality: Modality::Image, bytes: vec![1, 2, 3] });

        let vectoriser = TextOnlyVectoriser;
        let (_, errors) = embed_documents(&vectoriser, &index, &[doc], &media_repo, BatchVectorisationMode::PerBatch).await.unwrap();
        assert!(matches!(errors.get("1"), Some(CoreError::UnsupportedModality(_))));
    }

    #[test]
    fn l2_normalize_scales_to_unit_length() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn l2_normalize_leaves_zero_vector_untouched() {
        let mut v = vec![0.0, 0.0];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0]);
    }
}
