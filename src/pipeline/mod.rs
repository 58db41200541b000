//! Document ingestion pipeline (§4.4): converts user documents into store
//! documents, fans out media downloads and embeddings, feeds the result, and
//! (separately) applies field-granular partial updates.

pub mod assemble;
pub mod embed;
pub mod media;
pub mod partial_update;
pub mod validate;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::CoreConfig;
use crate::embedder::Vectoriser;
use crate::error::{BatchResult, CoreError, Outcome, Result};
use crate::index::definition::IndexDefinition;
use crate::index::manager::IndexManager;
use crate::store::{FeedDoc, StoreClient};

pub use partial_update::PatchDoc;
pub use validate::{AddDocsParams, BatchVectorisationMode};

/// Converts documents to store form and writes them (§4.4), or applies
/// partial updates (§4.4.6). Owns no mutable state of its own; the Index
/// Manager is consulted only to grow a SemiStructured schema mid-ingest.
pub struct DocumentPipeline {
    store: StoreClient,
    vectoriser: Arc<dyn Vectoriser>,
    media: media::MediaDownloader,
    config: CoreConfig,
}

impl DocumentPipeline {
    pub fn new(store: StoreClient, vectoriser: Arc<dyn Vectoriser>, config: CoreConfig) -> Self {
        let media = media::MediaDownloader::new(&config);
        DocumentPipeline { store, vectoriser, media, config }
    }

    /// §4.4 `addDocuments`: validate (fail-isolated), download media,
    /// embed, assemble, feed. `index_manager` is consulted for SemiStructured
    /// schema growth when new fields are introduced (§4.3).
    pub async fn add_documents(
        &self,
        index: &IndexDefinition,
        index_manager: Option<&IndexManager>,
        params: AddDocsParams,
    ) -> Result<BatchResult> {
        if params.docs.is_empty() {
            return Err(CoreError::InvalidArgument("docs must not be empty".to_string()));
        }
        if params.docs.len() > self.config.max_docs_per_batch {
            return Err(CoreError::InvalidArgument(format!(
                "batch of {} documents exceeds the maximum of {}",
                params.docs.len(),
                self.config.max_docs_per_batch
            )));
        }

        let (validated, mut batch) = validate::validate_and_collapse(index, &params, self.config.max_doc_bytes);

        if let (Some(manager), IndexDefinition::SemiStructured { common, .. }) = (index_manager, index) {
            let mut new_lexical = Vec::new();
            let mut new_tensor = Vec::new();
            let mut new_string_array = Vec::new();
            for doc in &validated {
                new_lexical.extend(doc.new_lexical_fields.iter().cloned());
                new_tensor.extend(doc.new_tensor_fields.iter().cloned());
                new_string_array.extend(doc.new_string_array_fields.iter().cloned());
            }
            if !new_lexical.is_empty() || !new_tensor.is_empty() || !new_string_array.is_empty() {
                manager
                    .update_semi_structured_index(&common.schema_name, &new_lexical, &new_tensor, &new_string_array, common.embedding_dim)
                    .await?;
            }
        }

        let media_repo = self.media.download_all(index, &validated, params.media_download_headers.as_ref()).await;

        let (embeddings, embed_errors) = embed::embed_documents(
            self.vectoriser.as_ref(),
            index,
            &validated,
            &media_repo,
            params.batch_vectorisation_mode,
        )
        .await?;

        let mut feed_docs = Vec::new();
        for doc in &validated {
            if let Some(err) = embed_errors.get(&doc.id) {
                batch.push(Outcome::err(&doc.id, err));
                continue;
            }
            match assemble::assemble_document(index, doc, &embeddings, &media_repo) {
                Ok(stored) => feed_docs.push(FeedDoc { id: stored.id.clone(), fields: assemble::stored_document_to_fields(&stored) }),
                Err(err) => batch.push(Outcome::err(&doc.id, &err)),
            }
        }

        if !feed_docs.is_empty() {
            let fed = self.store.feed_batch(feed_docs, &index.common().schema_name, self.config.feed_timeout).await;
            for item in fed.items {
                batch.push(item);
            }
        }

        Ok(batch)
    }

    /// §4.4.6 `partial_update_documents`.
    pub async fn partial_update_documents(&self, index: &IndexDefinition, docs: Vec<PatchDoc>) -> Result<BatchResult> {
        partial_update::run(&self.store, index, docs, Duration::from_millis(self.config.query_timeout_ms).max(self.config.feed_timeout)).await
    }
}

pub(crate) type MediaRepo = HashMap<String, media::MediaSlot>;
