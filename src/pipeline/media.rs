//! Media download fan-out (§4.4.3).
//!
//! Grounded in the teacher's `processing::image`/`processing::detector`
//! pair: infer a modality, then run a bounded worker pool per kind. Here
//! the two teacher pools (images vs. "mixed" audio/video) become two
//! semaphores sized from config, and per-URL results are cached so a URL
//! repeated across documents in the same batch is fetched once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::Semaphore;

use crate::config::CoreConfig;
use crate::data::FieldValue;
use crate::embedder::Modality;
use crate::error::CoreError;
use crate::index::definition::{FieldType, IndexDefinition};

use super::validate::ValidatedDoc;

/// The resolved outcome of downloading one media URL.
#[derive(Debug, Clone)]
pub enum MediaSlot {
    Ready { modality: Modality, bytes: Vec<u8> },
    Error(CoreError),
}

pub struct MediaDownloader {
    http: reqwest::Client,
    image_semaphore: Arc<Semaphore>,
    mixed_semaphore: Arc<Semaphore>,
    timeout: std::time::Duration,
    max_video_audio_bytes: u64,
}

impl MediaDownloader {
    pub fn new(config: &CoreConfig) -> Self {
        MediaDownloader {
            http: reqwest::Client::builder().timeout(config.media_download_timeout).build().expect("failed to build media HTTP client"),
            image_semaphore: Arc::new(Semaphore::new(config.media_download_pool_images)),
            mixed_semaphore: Arc::new(Semaphore::new(config.media_download_pool_mixed)),
            timeout: config.media_download_timeout,
            max_video_audio_bytes: config.max_video_audio_file_size_bytes,
        }
    }

    /// Downloads every distinct media URL referenced by `docs`, deduplicated
    /// across the whole batch (§4.4.3 "identical URLs are fetched once").
    ///
    /// A URL whose Structured-declared pointer type disagrees with its
    /// extension-inferred modality (§4.4.3 step 2) is never downloaded: its
    /// slot is seeded with a `MediaMismatch` error up front.
    pub async fn download_all(
        &self,
        index: &IndexDefinition,
        docs: &[ValidatedDoc],
        headers: Option<&HashMap<String, String>>,
    ) -> HashMap<String, MediaSlot> {
        let mut wanted: HashMap<String, Modality> = HashMap::new();
        let mut mismatched: HashMap<String, CoreError> = HashMap::new();
        let mut seen: HashSet<String> = HashSet::new();
        for doc in docs {
            for (field_name, value) in &doc.fields {
                if let FieldValue::Media(url) = value {
                    if seen.insert(url.clone()) {
                        match structured_modality_check(index, field_name, url) {
                            Ok(modality) => {
                                wanted.insert(url.clone(), modality);
                            }
                            Err(err) => {
                                mismatched.insert(url.clone(), err);
                            }
                        }
                    }
                }
            }
        }

        let headers = headers.cloned().unwrap_or_default();
        let mut results: HashMap<String, MediaSlot> = stream::iter(wanted.into_iter().map(|(url, modality)| {
            let image_sem = self.image_semaphore.clone();
            let mixed_sem = self.mixed_semaphore.clone();
            let headers = headers.clone();
            async move {
                let sem = if modality == Modality::Image { image_sem } else { mixed_sem };
                let _permit = sem.acquire().await.expect("semaphore closed");
                let slot = self.fetch_one(&url, modality, &headers).await;
                (url, slot)
            }
        }))
        .buffer_unordered(usize::MAX)
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect();

        for (url, err) in mismatched {
            results.insert(url, MediaSlot::Error(err));
        }
        results
    }

    async fn fetch_one(&self, url: &str, modality: Modality, headers: &HashMap<String, String>) -> MediaSlot {
        let mut request = self.http.get(url).timeout(self.timeout);
        for (k, v) in headers {
            request = request.header(k, v);
        }
        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return MediaSlot::Error(CoreError::from(e)),
        };
        if !response.status().is_success() {
            return MediaSlot::Error(CoreError::MediaDownloadError(format!("{} returned status {}", url, response.status())));
        }
        if matches!(modality, Modality::Video | Modality::Audio) {
            if let Some(len) = response.content_length() {
                if len > self.max_video_audio_bytes {
                    return MediaSlot::Error(CoreError::MediaExceedsMaxSize(format!(
                        "{} is {} bytes, exceeding the {} byte limit for audio/video",
                        url, len, self.max_video_audio_bytes
                    )));
                }
            }
        }
        match response.bytes().await {
            Ok(bytes) => {
                if matches!(modality, Modality::Video | Modality::Audio) && bytes.len() as u64 > self.max_video_audio_bytes {
                    return MediaSlot::Error(CoreError::MediaExceedsMaxSize(format!(
                        "{} is {} bytes, exceeding the {} byte limit for audio/video",
                        url,
                        bytes.len(),
                        self.max_video_audio_bytes
                    )));
                }
                MediaSlot::Ready { modality, bytes: bytes.to_vec() }
            }
            Err(e) => MediaSlot::Error(CoreError::from(e)),
        }
    }
}

/// Structured indexes declare the pointer type on the field; Unstructured and
/// SemiStructured indexes infer it from the URL extension (§4.4.3 step 1).
/// For Structured fields, a declared type that disagrees with an unambiguous
/// extension-inferred modality is a per-doc `MediaMismatch` (§4.4.3 step 2).
fn structured_modality_check(index: &IndexDefinition, field_name: &str, url: &str) -> Result<Modality, CoreError> {
    if let IndexDefinition::Structured { extra, .. } = index {
        if let Some(field) = extra.fields.iter().find(|f| f.name == field_name) {
            let declared = match field.field_type {
                FieldType::ImagePointer => Some(Modality::Image),
                FieldType::VideoPointer => Some(Modality::Video),
                FieldType::AudioPointer => Some(Modality::Audio),
                _ => None,
            };
            if let Some(declared) = declared {
                if let Some(inferred) = extension_modality(url) {
                    if inferred != declared {
                        return Err(CoreError::MediaMismatch(format!(
                            "field '{}' is declared as {:?} but '{}' looks like {:?}",
                            field_name, declared, url, inferred
                        )));
                    }
                }
                return Ok(declared);
            }
        }
    }
    Ok(modality_from_extension(url))
}

fn modality_from_extension(url: &str) -> Modality {
    extension_modality(url).unwrap_or(Modality::Image)
}

/// `None` when the extension is absent or not recognized (ambiguous: the
/// caller's declared/default modality is trusted rather than flagged).
fn extension_modality(url: &str) -> Option<Modality> {
    let lower = url.to_ascii_lowercase();
    let lower = lower.split(['?', '#']).next().unwrap_or(&lower).to_string();
    if lower.ends_with(".mp4") || lower.ends_with(".mov") || lower.ends_with(".avi") || lower.ends_with(".webm") {
        Some(Modality::Video)
    } else if lower.ends_with(".mp3") || lower.ends_with(".wav") || lower.ends_with(".flac") || lower.ends_with(".ogg") {
        Some(Modality::Audio)
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") || lower.ends_with(".png") || lower.ends_with(".gif") || lower.ends_with(".webp") || lower.ends_with(".bmp") {
        Some(Modality::Image)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_video_from_extension() {
        assert_eq!(modality_from_extension("https://example.com/clip.mp4?sig=abc"), Modality::Video);
    }

    #[test]
    fn infers_audio_from_extension() {
        assert_eq!(modality_from_extension("https://example.com/track.mp3"), Modality::Audio);
    }

    #[test]
    fn defaults_to_image_for_unknown_extension() {
        assert_eq!(modality_from_extension("https://example.com/pic.jpg"), Modality::Image);
    }

    fn structured_index(field_type: FieldType) -> IndexDefinition {
        use crate::index::definition::*;
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
                embedding_dim: 8,
                marqo_version: "2.13.0".into(),
                created_at: 0.0,
                updated_at: 0.0,
                version: 1,
            },
            extra: StructuredExtra {
                fields: vec![Field { name: "pic".into(), field_type, features: vec![], dependent_fields: None }],
                tensor_fields: vec![],
            },
        }
    }

    #[test]
    fn declared_image_pointer_matching_extension_is_accepted() {
        let index = structured_index(FieldType::ImagePointer);
        assert_eq!(structured_modality_check(&index, "pic", "https://example.com/a.jpg").unwrap(), Modality::Image);
    }

    #[test]
    fn declared_image_pointer_disagreeing_with_video_extension_is_a_mismatch() {
        let index = structured_index(FieldType::ImagePointer);
        let err = structured_modality_check(&index, "pic", "https://example.com/a.mp4").unwrap_err();
        assert!(matches!(err, CoreError::MediaMismatch(_)));
    }

    #[test]
    fn declared_pointer_with_unrecognized_extension_trusts_the_declared_type() {
        let index = structured_index(FieldType::VideoPointer);
        assert_eq!(structured_modality_check(&index, "pic", "https://example.com/stream").unwrap(), Modality::Video);
    }
}
