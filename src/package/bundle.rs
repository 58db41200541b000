//! Application package session: in-memory file view plus deploy protocol (§4.2).

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::index::definition::IndexDefinition;
use crate::store::client::gzip_tar_bytes;
use crate::store::StoreClient;

use super::schema_gen;

const SETTINGS_PATH: &str = "marqo_index_settings.json";
const SETTINGS_HISTORY_PATH: &str = "marqo_index_settings_history.json";
const CONFIG_PATH: &str = "marqo_config.json";
const SERVICES_XML_PATH: &str = "services.xml";
const BACKUP_PATH: &str = "app_bak.tgz";
const DEFAULT_CLUSTER_ID: &str = "default-app";

/// Pre-migration schema (prior to Marqo 2.13.0) that held one settings
/// document per index directly in the store, before settings moved into
/// `marqo_index_settings.json` inside the bundle (§4.2 `bootstrap`).
const MARQO_SETTINGS_SCHEMA: &str = "marqo__settings";

/// In-memory view of the deployed bundle's files, keyed by path within the bundle (§4.2).
#[derive(Debug, Clone, Default)]
pub struct AppBundle {
    files: HashMap<String, Vec<u8>>,
    /// Paths mutated since the bundle was opened — tracks what the deploy protocol must write.
    dirty: Vec<String>,
    /// Paths removed since the bundle was opened.
    removed: Vec<String>,
}

impl AppBundle {
    pub fn empty() -> Self {
        AppBundle::default()
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(|v| v.as_slice())
    }

    pub fn set(&mut self, path: impl Into<String>, contents: Vec<u8>) {
        let path = path.into();
        self.files.insert(path.clone(), contents);
        self.dirty.push(path);
    }

    pub fn remove(&mut self, path: &str) {
        if self.files.remove(path).is_some() {
            self.removed.push(path.to_string());
        }
    }

    pub fn settings_map(&self) -> Result<HashMap<String, IndexDefinition>> {
        match self.get(SETTINGS_PATH) {
            Some(bytes) => serde_json::from_slice(bytes).map_err(|e| CoreError::Generic(e.to_string())),
            None => Ok(HashMap::new()),
        }
    }

    fn write_settings_map(&mut self, map: &HashMap<String, IndexDefinition>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(map).map_err(|e| CoreError::Generic(e.to_string()))?;
        self.set(SETTINGS_PATH, bytes);
        Ok(())
    }

    fn settings_history(&self) -> Result<HashMap<String, Vec<IndexDefinition>>> {
        match self.get(SETTINGS_HISTORY_PATH) {
            Some(bytes) => serde_json::from_slice(bytes).map_err(|e| CoreError::Generic(e.to_string())),
            None => Ok(HashMap::new()),
        }
    }

    fn write_settings_history(&mut self, history: &HashMap<String, Vec<IndexDefinition>>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(history).map_err(|e| CoreError::Generic(e.to_string()))?;
        self.set(SETTINGS_HISTORY_PATH, bytes);
        Ok(())
    }

    pub fn config_version(&self) -> Option<String> {
        self.get(CONFIG_PATH)
            .and_then(|bytes| serde_json::from_slice::<Value>(bytes).ok())
            .and_then(|v| v.get("version").and_then(|v| v.as_str()).map(|s| s.to_string()))
    }

    /// The version `app_bak.tgz` was taken at, if a backup is present (§4.2 `rollback`).
    pub fn backup_version(&self) -> Option<String> {
        self.get(CONFIG_PATH)
            .and_then(|bytes| serde_json::from_slice::<Value>(bytes).ok())
            .and_then(|v| v.get("backup_version").and_then(|v| v.as_str()).map(|s| s.to_string()))
    }

    fn schema_file_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .files
            .keys()
            .filter_map(|p| p.strip_prefix("schemas/").and_then(|s| s.strip_suffix(".sd")))
            .map(|s| s.to_string())
            .collect();
        names.sort();
        names
    }

    fn drain_dirty_and_removed(&mut self) -> (Vec<(String, Vec<u8>)>, Vec<String>) {
        let dirty = std::mem::take(&mut self.dirty);
        let removed = std::mem::take(&mut self.removed);
        let writes = dirty
            .into_iter()
            .filter_map(|path| self.files.get(&path).map(|bytes| (path.clone(), bytes.clone())))
            .collect();
        (writes, removed)
    }

    /// Builds the gzip-tar payload for a one-shot `prepareandactivate` deploy (bootstrap/rollback).
    pub fn to_gzip_tar(&self) -> Result<Vec<u8>> {
        let files: Vec<(String, Bytes)> = self
            .files
            .iter()
            .map(|(path, contents)| (path.clone(), Bytes::from(contents.clone())))
            .collect();
        gzip_tar_bytes(&files)
    }
}

/// Owns the deployed schema bundle: edit/deploy/activate sessions, schema
/// generation, and rollback (§4.2). Grounded in `indexer/app_package.rs`.
pub struct AppPackageManager {
    store: StoreClient,
    deploy_timeout: Duration,
}

impl AppPackageManager {
    pub fn new(store: StoreClient, deploy_timeout: Duration) -> Self {
        AppPackageManager { store, deploy_timeout }
    }

    /// Runs a session-based deploy: create session, push dirty/removed files, prepare+activate.
    async fn deploy_session(&self, bundle: &mut AppBundle) -> Result<()> {
        let session = self.store.create_deployment_session(self.deploy_timeout).await?;
        let (writes, removed) = bundle.drain_dirty_and_removed();
        for (path, contents) in writes {
            self.store.put_session_file(&session, &path, contents, self.deploy_timeout).await?;
        }
        for path in removed {
            self.store.delete_session_file(&session, &path, self.deploy_timeout).await?;
        }
        self.store.prepare_and_activate(&session, self.deploy_timeout).await
    }

    /// §4.2 `batchAddIndexSettingAndSchema`. All-or-nothing: rejected on any collision.
    pub async fn batch_add_index_setting_and_schema(
        &self,
        bundle: &mut AppBundle,
        indexes: &[(String, IndexDefinition, u32)],
    ) -> Result<()> {
        let mut settings = bundle.settings_map()?;
        for (schema, _def, _dim) in indexes {
            if settings.contains_key(schema) {
                return Err(CoreError::IndexExists(schema.clone()));
            }
        }

        for (schema, def, dim) in indexes {
            let sd = render_schema_file(def, *dim)?;
            bundle.set(format!("schemas/{}.sd", schema), sd.into_bytes());
            settings.insert(schema.clone(), def.clone());
        }
        bundle.write_settings_map(&settings)?;

        let mut names = bundle.schema_file_names();
        names.sort();
        bundle.set(SERVICES_XML_PATH, schema_gen::render_services_xml(&names, DEFAULT_CLUSTER_ID).into_bytes());

        self.deploy_session(bundle).await
    }

    /// §4.2 `batchDeleteIndexSettingAndSchema`. All-or-nothing: rejected if any name is missing.
    pub async fn batch_delete_index_setting_and_schema(&self, bundle: &mut AppBundle, names: &[String]) -> Result<()> {
        let mut settings = bundle.settings_map()?;
        for name in names {
            if !settings.contains_key(name) {
                return Err(CoreError::IndexNotFound(name.clone()));
            }
        }

        let mut history = bundle.settings_history()?;
        for name in names {
            if let Some(removed_def) = settings.remove(name) {
                history.entry(name.clone()).or_default().push(removed_def);
            }
            bundle.remove(&format!("schemas/{}.sd", name));
        }
        bundle.write_settings_map(&settings)?;
        bundle.write_settings_history(&history)?;

        let remaining = bundle.schema_file_names();
        bundle.set(SERVICES_XML_PATH, schema_gen::render_services_xml(&remaining, DEFAULT_CLUSTER_ID).into_bytes());

        self.deploy_session(bundle).await
    }

    /// §4.2 `updateIndexSettingAndSchema`, SemiStructured only.
    pub async fn update_index_setting_and_schema(&self, bundle: &mut AppBundle, schema: &str, def: IndexDefinition, dim: u32) -> Result<()> {
        let mut settings = bundle.settings_map()?;
        let current = settings
            .get(schema)
            .ok_or_else(|| CoreError::IndexNotFound(schema.to_string()))?;
        if def.version() <= current.version() {
            return Err(CoreError::OperationConflict(format!(
                "index '{}' was updated concurrently (target version {} <= current {})",
                schema,
                def.version(),
                current.version()
            )));
        }

        let sd = render_schema_file(&def, dim)?;
        bundle.set(format!("schemas/{}.sd", schema), sd.into_bytes());
        settings.insert(schema.to_string(), def);
        bundle.write_settings_map(&settings)?;

        self.deploy_session(bundle).await
    }

    /// §4.2 `bootstrap`. Idempotent: returns `false` without deploying if already at this version.
    pub async fn bootstrap(&self, bundle: &mut AppBundle, this_version: &str) -> Result<bool> {
        if bundle.config_version().as_deref() == Some(this_version) {
            return Ok(false);
        }

        let is_first_deploy = bundle.get(CONFIG_PATH).is_none();
        let previous_version = bundle.config_version();

        if !is_first_deploy {
            let backup_files: Vec<(String, Bytes)> = bundle
                .files
                .iter()
                .filter(|(p, _)| p.ends_with(".sd") || *p == SERVICES_XML_PATH || p.starts_with("search/query-profiles/"))
                .map(|(p, c)| (p.clone(), Bytes::from(c.clone())))
                .collect();
            let tgz = gzip_tar_bytes(&backup_files)?;
            bundle.set(BACKUP_PATH, tgz);
        }

        if bundle.get(SETTINGS_PATH).is_none() {
            let migrated = if is_first_deploy { HashMap::new() } else { self.migrate_legacy_settings().await? };
            bundle.write_settings_map(&migrated)?;
        }

        let mut config = serde_json::json!({ "version": this_version });
        if let Some(previous) = previous_version {
            config["backup_version"] = Value::String(previous);
        }
        bundle.set(CONFIG_PATH, serde_json::to_vec_pretty(&config).map_err(|e| CoreError::Generic(e.to_string()))?);

        self.deploy_session(bundle).await?;
        Ok(true)
    }

    /// §4.2 `bootstrap`'s legacy-settings migration: a pre-2.13.0 deploy kept
    /// one settings document per index in the `marqo__settings` schema
    /// instead of `marqo_index_settings.json`. Missing schema, unreachable
    /// store, or malformed documents are treated as "nothing to migrate"
    /// rather than a bootstrap failure — they indicate there never was a
    /// legacy settings schema to begin with.
    async fn migrate_legacy_settings(&self) -> Result<HashMap<String, IndexDefinition>> {
        let body = serde_json::json!({ "yql": format!("select * from sources {} where true limit 1000", MARQO_SETTINGS_SCHEMA) });
        let response = match self.store.query(body, self.deploy_timeout).await {
            Ok(v) => v,
            Err(_) => return Ok(HashMap::new()),
        };
        Ok(parse_legacy_settings(&response))
    }

    /// §4.2 `rollback`: restores `app_bak.tgz`, refusing on any of the documented guards.
    pub async fn rollback(&self, bundle: &mut AppBundle, current_version: &str, backup_version: &str) -> Result<()> {
        if backup_version >= current_version {
            return Err(CoreError::InvalidArgument(
                "rollback target version must be older than the current version".to_string(),
            ));
        }
        match bundle.backup_version() {
            Some(recorded) if recorded == backup_version => {}
            Some(recorded) => {
                return Err(CoreError::InvalidArgument(format!(
                    "rollback target '{}' does not match the recorded backup version '{}'",
                    backup_version, recorded
                )))
            }
            None => return Err(CoreError::InvalidArgument("no backup version recorded".to_string())),
        }
        let backup_bytes = bundle
            .get(BACKUP_PATH)
            .ok_or_else(|| CoreError::InvalidArgument("no backup archive present".to_string()))?
            .to_vec();

        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(&backup_bytes[..]));
        let mut restored: HashMap<String, Vec<u8>> = HashMap::new();
        for entry in archive.entries().map_err(|e| CoreError::Generic(e.to_string()))? {
            let mut entry = entry.map_err(|e| CoreError::Generic(e.to_string()))?;
            let path = entry.path().map_err(|e| CoreError::Generic(e.to_string()))?.to_string_lossy().to_string();
            let mut contents = Vec::new();
            std::io::Read::read_to_end(&mut entry, &mut contents)?;
            restored.insert(path, contents);
        }

        let current_schema_names = bundle.schema_file_names();
        let mut backup_schema_names: Vec<String> = restored
            .keys()
            .filter_map(|p| p.strip_prefix("schemas/").and_then(|s| s.strip_suffix(".sd")))
            .map(|s| s.to_string())
            .collect();
        backup_schema_names.sort();
        if current_schema_names != backup_schema_names {
            return Err(CoreError::InvalidArgument(
                "rollback refused: the set of schema files has changed since the backup".to_string(),
            ));
        }

        if let (Some(current_services), Some(backup_services)) =
            (bundle.get(SERVICES_XML_PATH), restored.get(SERVICES_XML_PATH))
        {
            if current_services != backup_services.as_slice() {
                return Err(CoreError::InvalidArgument(
                    "rollback refused: cluster topology has changed since the backup".to_string(),
                ));
            }
        }

        for (path, contents) in restored {
            bundle.set(path, contents);
        }
        bundle.remove(BACKUP_PATH);

        let config = serde_json::json!({ "version": backup_version });
        bundle.set(CONFIG_PATH, serde_json::to_vec_pretty(&config).map_err(|e| CoreError::Generic(e.to_string()))?);

        tracing::event!(
            tracing::Level::INFO,
            from_version = current_version,
            to_version = backup_version,
            "rolled back application package"
        );

        self.deploy_session(bundle).await
    }
}

/// Extracts index settings from a `marqo__settings` query response, forcing
/// every migrated definition to `version = 1` (§4.2 `bootstrap`). Documents
/// that don't carry a parseable `settings` field (e.g. the legacy config
/// document) are skipped rather than treated as an error.
fn parse_legacy_settings(response: &Value) -> HashMap<String, IndexDefinition> {
    let mut migrated = HashMap::new();
    let children = response.get("root").and_then(|r| r.get("children")).and_then(|c| c.as_array()).cloned().unwrap_or_default();
    for child in children {
        let Some(settings_json) = child.get("fields").and_then(|f| f.get("settings")).and_then(|v| v.as_str()) else {
            continue;
        };
        let Ok(mut def) = serde_json::from_str::<IndexDefinition>(settings_json) else {
            continue;
        };
        def.common_mut().version = 1;
        migrated.insert(def.name().to_string(), def);
    }
    migrated
}

fn render_schema_file(def: &IndexDefinition, dim: u32) -> Result<String> {
    match def {
        IndexDefinition::Structured { common, extra } => Ok(schema_gen::render_structured_schema(common, extra, dim)),
        IndexDefinition::SemiStructured { common, extra } => {
            let at_partial_update = true;
            Ok(schema_gen::render_semi_structured_schema(common, extra, dim, at_partial_update))
        }
        IndexDefinition::Unstructured { .. } => Err(CoreError::InvalidArgument(
            "Unstructured indexes do not have a generated schema file".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::definition::*;

    fn sample_structured(version: u32) -> IndexDefinition {
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
                version,
            },
            extra: StructuredExtra { fields: vec![], tensor_fields: vec![] },
        }
    }

    #[test]
    fn bundle_tracks_settings_map_round_trip() {
        let mut bundle = AppBundle::empty();
        let mut map = HashMap::new();
        map.insert("idx".to_string(), sample_structured(1));
        bundle.write_settings_map(&map).unwrap();
        let read_back = bundle.settings_map().unwrap();
        assert_eq!(read_back.get("idx").unwrap().version(), 1);
    }

    #[test]
    fn empty_bundle_has_empty_settings_map() {
        let bundle = AppBundle::empty();
        assert!(bundle.settings_map().unwrap().is_empty());
    }

    #[test]
    fn legacy_settings_query_response_is_migrated_with_version_forced_to_one() {
        let legacy_index = sample_structured(7);
        let response = serde_json::json!({
            "root": {
                "children": [
                    {
                        "fields": {
                            "index_name": "idx",
                            "settings": serde_json::to_string(&legacy_index).unwrap(),
                        }
                    },
                    {
                        // legacy config document: no "settings" shaped as an IndexDefinition
                        "fields": { "settings": "{\"version\": \"2.12.0\"}" }
                    }
                ]
            }
        });

        let migrated = parse_legacy_settings(&response);
        assert_eq!(migrated.len(), 1);
        assert_eq!(migrated.get("idx").unwrap().version(), 1);
    }

    #[test]
    fn legacy_settings_query_response_with_no_children_migrates_nothing() {
        let response = serde_json::json!({ "root": { "children": [] } });
        assert!(parse_legacy_settings(&response).is_empty());
    }
}
