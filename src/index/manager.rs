//! High-level index lifecycle: bootstrap, batch create/delete, in-place
//! schema evolution, distributed-lock gating (§4.3).
//!
//! Grounded in the spec's own description of the lock/convergence/deploy
//! dance; the `Arc<Mutex<...>>`-guarded bundle mirrors the teacher's
//! `ActiveSyncGuard` idiom in `sync/engine.rs` for "hold a resource for the
//! duration of an operation, release on every exit path."

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::index::definition::{IndexDefinition, SemiStructuredExtra};
use crate::index::lock::IndexLock;
use crate::package::{AppBundle, AppPackageManager};
use crate::store::StoreClient;

pub struct IndexManager {
    store: StoreClient,
    package: AppPackageManager,
    lock: IndexLock,
    bundle: Arc<Mutex<AppBundle>>,
    config: CoreConfig,
}

impl IndexManager {
    pub fn new(store: StoreClient, config: CoreConfig) -> Self {
        let package = AppPackageManager::new(store.clone(), config.feed_timeout);
        IndexManager {
            store,
            package,
            lock: IndexLock::new(),
            bundle: Arc::new(Mutex::new(AppBundle::empty())),
            config,
        }
    }

    /// §4.3 steps 1-4, shared by every mutating lifecycle operation:
    /// acquire the cluster lock, probe convergence, run `f`, release on exit.
    async fn with_lock<F, T>(&self, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(
            &'a AppPackageManager,
            &'a mut AppBundle,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<T>> + Send + 'a>>,
    {
        let _guard = self.lock.acquire(self.config.lock_acquire_timeout).await?;
        // Best-effort convergence probe; a transient failure here does not
        // block the operation, it is advisory (§4.3 step 2).
        if let Ok(false) = self.store.check_for_application_convergence().await {
            tracing::event!(tracing::Level::WARN, "proceeding with lifecycle op while store has not converged");
        }
        let mut bundle = self.bundle.lock().await;
        f(&self.package, &mut bundle).await
    }

    /// §4.2/§6.3 `bootstrap()`. Idempotent.
    pub async fn bootstrap(&self) -> Result<bool> {
        let this_version = self.config.this_version.clone();
        self.with_lock(move |package, bundle| Box::pin(async move { package.bootstrap(bundle, &this_version).await }))
            .await
    }

    pub async fn create_index(&self, def: IndexDefinition, dim: u32) -> Result<()> {
        self.batch_create_indexes(vec![(def, dim)]).await
    }

    /// §6.3 `batchCreateIndexes`. All-or-nothing across the batch (§7 propagation policy).
    pub async fn batch_create_indexes(&self, defs: Vec<(IndexDefinition, u32)>) -> Result<()> {
        for (def, _) in &defs {
            def.validate()?;
        }
        self.with_lock(move |package, bundle| {
            Box::pin(async move {
                let entries: Vec<(String, IndexDefinition, u32)> =
                    defs.into_iter().map(|(def, dim)| (def.common().schema_name.clone(), def, dim)).collect();
                package.batch_add_index_setting_and_schema(bundle, &entries).await
            })
        })
        .await
    }

    pub async fn delete_index_by_name(&self, name: &str) -> Result<()> {
        self.batch_delete_indexes_by_name(vec![name.to_string()]).await
    }

    /// §6.3 `batchDeleteIndexesByName`. All-or-nothing.
    pub async fn batch_delete_indexes_by_name(&self, names: Vec<String>) -> Result<()> {
        self.with_lock(move |package, bundle| Box::pin(async move { package.batch_delete_index_setting_and_schema(bundle, &names).await }))
            .await
    }

    /// §6.3 `updateIndex`: deploys caller-supplied settings for an existing
    /// index, subject to the same optimistic version-bump race check as the
    /// SemiStructured growth path.
    pub async fn update_index(&self, def: IndexDefinition, dim: u32) -> Result<()> {
        def.validate()?;
        let schema = def.common().schema_name.clone();
        self.with_lock(move |package, bundle| Box::pin(async move { package.update_index_setting_and_schema(bundle, &schema, def, dim).await }))
            .await
    }

    /// §4.3 "Update path for SemiStructured": computes the union of declared
    /// fields and the document-introduced ones, returning `None` (no-op fast
    /// path) when the union would not change anything.
    pub fn compute_semi_structured_growth(
        current: &SemiStructuredExtra,
        new_lexical: &[String],
        new_tensor: &[String],
        new_string_array: &[String],
    ) -> Option<SemiStructuredExtra> {
        let union = |existing: &[String], additions: &[String]| -> (Vec<String>, bool) {
            let mut set: HashSet<String> = existing.iter().cloned().collect();
            let before_len = set.len();
            for a in additions {
                set.insert(a.clone());
            }
            let grew = set.len() != before_len;
            let mut merged: Vec<String> = set.into_iter().collect();
            merged.sort();
            (merged, grew)
        };

        let (lexical, lexical_grew) = union(&current.lexical_fields, new_lexical);
        let (tensor, tensor_grew) = union(&current.tensor_fields, new_tensor);
        let (string_array, string_array_grew) = union(&current.string_array_fields, new_string_array);

        if !lexical_grew && !tensor_grew && !string_array_grew {
            return None;
        }

        Some(SemiStructuredExtra {
            unstructured: current.unstructured.clone(),
            lexical_fields: lexical,
            tensor_fields: tensor,
            string_array_fields: string_array,
        })
    }

    /// §4.3 "Update path for SemiStructured", dispatched end of ingestion when
    /// a document introduces a new field. Bumps `version` and deploys; a
    /// racing writer surfaces `OperationConflict` for the caller to retry with
    /// fresh state.
    pub async fn update_semi_structured_index(
        &self,
        schema: &str,
        new_lexical: &[String],
        new_tensor: &[String],
        new_string_array: &[String],
        dim: u32,
    ) -> Result<Option<IndexDefinition>> {
        let schema = schema.to_string();
        let new_lexical = new_lexical.to_vec();
        let new_tensor = new_tensor.to_vec();
        let new_string_array = new_string_array.to_vec();
        self.with_lock(move |package, bundle| {
            Box::pin(async move {
                let settings = bundle.settings_map()?;
                let current = settings.get(&schema).ok_or_else(|| CoreError::IndexNotFound(schema.clone()))?;
                let IndexDefinition::SemiStructured { common, extra } = current else {
                    return Err(CoreError::UnsupportedFeature(format!(
                        "index '{}' is not SemiStructured and cannot grow its schema",
                        schema
                    )));
                };
                let Some(grown) = IndexManager::compute_semi_structured_growth(extra, &new_lexical, &new_tensor, &new_string_array) else {
                    return Ok(None);
                };
                let mut new_common = common.clone();
                new_common.version += 1;
                let new_def = IndexDefinition::SemiStructured { common: new_common, extra: grown };
                package.update_index_setting_and_schema(bundle, &schema, new_def.clone(), dim).await?;
                Ok(Some(new_def))
            })
        })
        .await
    }

    pub async fn get_index(&self, name: &str) -> Result<IndexDefinition> {
        let bundle = self.bundle.lock().await;
        bundle
            .settings_map()?
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::IndexNotFound(name.to_string()))
    }

    pub async fn get_all_indexes(&self) -> Result<Vec<IndexDefinition>> {
        let bundle = self.bundle.lock().await;
        let mut defs: Vec<IndexDefinition> = bundle.settings_map()?.into_values().collect();
        defs.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(defs)
    }

    /// §6.3 `rollbackVespa`.
    pub async fn rollback_vespa(&self) -> Result<()> {
        self.with_lock(|package, bundle| {
            Box::pin(async move {
                let current_version = bundle
                    .config_version()
                    .ok_or_else(|| CoreError::InvalidArgument("no deployed version to roll back from".to_string()))?;
                let backup_version = bundle
                    .backup_version()
                    .ok_or_else(|| CoreError::InvalidArgument("no backup archive present".to_string()))?;
                package.rollback(bundle, &current_version, &backup_version).await
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::definition::UnstructuredExtra;

    fn base_extra() -> SemiStructuredExtra {
        SemiStructuredExtra {
            unstructured: UnstructuredExtra {
                treat_urls_and_pointers_as_images: true,
                treat_urls_and_pointers_as_media: false,
                filter_string_max_length: 200,
            },
            lexical_fields: vec!["title".to_string()],
            tensor_fields: vec!["title".to_string()],
            string_array_fields: vec![],
        }
    }

    #[test]
    fn growth_is_none_when_fields_already_declared() {
        let current = base_extra();
        let grown = IndexManager::compute_semi_structured_growth(&current, &["title".to_string()], &["title".to_string()], &[]);
        assert!(grown.is_none());
    }

    #[test]
    fn growth_adds_new_fields_and_keeps_existing() {
        let current = base_extra();
        let grown = IndexManager::compute_semi_structured_growth(&current, &["description".to_string()], &[], &["tags".to_string()]).unwrap();
        assert!(grown.lexical_fields.contains(&"title".to_string()));
        assert!(grown.lexical_fields.contains(&"description".to_string()));
        assert!(grown.string_array_fields.contains(&"tags".to_string()));
    }
}
