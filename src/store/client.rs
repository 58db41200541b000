//! Typed RPC surface over the external vector store (§4.1, §6.1).
//!
//! Grounded in the teacher's `VespaClient`/`VespaDeployClient`
//! (`vespa/client.rs`): one shared `reqwest::Client`, bounded fan-out via
//! `buffer_unordered`, and the same error-body truncation/logging idiom.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::config::CoreConfig;
use crate::error::{BatchResult, CoreError, Outcome, Result};

use super::session::DeploymentSession;

const MAX_LOGGED_BODY: usize = 2048;

fn truncate_body(body: &str) -> String {
    if body.len() > MAX_LOGGED_BODY {
        format!("{}… [truncated, {} bytes]", &body[..MAX_LOGGED_BODY], body.len())
    } else {
        body.to_string()
    }
}

/// A single document to feed, keyed by id.
#[derive(Debug, Clone)]
pub struct FeedDoc {
    pub id: String,
    pub fields: Value,
}

/// A partial-update document: fields plus the optimistic precondition (§4.1).
#[derive(Debug, Clone)]
pub struct UpdateDoc {
    pub id: String,
    pub fields: Value,
    pub condition: Option<String>,
    /// Whether this update carried any type/timestamp precondition — governs
    /// 412 → 404 vs 412 → 400 translation (§4.1, §6.1).
    pub had_precondition: bool,
}

/// Result of a single GET (§4.1: "404 is a normal per-doc outcome").
#[derive(Debug, Clone)]
pub enum GetOutcome {
    Found(Value),
    NotFound,
    Error(Outcome),
}

#[derive(Clone)]
pub struct StoreClient {
    http: reqwest::Client,
    document_url: String,
    query_url: String,
    config_url: String,
    feed_semaphore: Arc<Semaphore>,
    get_semaphore: Arc<Semaphore>,
    delete_semaphore: Arc<Semaphore>,
    partial_update_semaphore: Arc<Semaphore>,
}

impl StoreClient {
    pub fn new(config: &CoreConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.feed_timeout)
            .build()
            .expect("failed to build store HTTP client");
        StoreClient {
            http,
            document_url: config.store_document_url.clone(),
            query_url: config.store_query_url.clone(),
            config_url: config.store_config_url.clone(),
            feed_semaphore: Arc::new(Semaphore::new(config.feed_pool_size)),
            get_semaphore: Arc::new(Semaphore::new(config.get_pool_size)),
            delete_semaphore: Arc::new(Semaphore::new(config.delete_pool_size)),
            partial_update_semaphore: Arc::new(Semaphore::new(config.partial_update_pool_size)),
        }
    }

    fn document_path(&self, schema: &str, id: &str) -> String {
        format!(
            "{}/document/v1/{}/{}/docid/{}",
            self.document_url,
            schema,
            schema,
            urlencoding::encode(id)
        )
    }

    // ---- Application package deploy/download (§4.1, §6.1) ----

    /// Gzip-streams the bundle directory as a single tar and POSTs it.
    pub async fn deploy_application(&self, dir: &Path, timeout: Duration) -> Result<()> {
        let mut archive_buf = Vec::new();
        {
            let encoder = flate2::write::GzEncoder::new(&mut archive_buf, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder.append_dir_all(".", dir)?;
            builder
                .into_inner()
                .map_err(|e| CoreError::Generic(e.to_string()))?
                .finish()
                .map_err(|e| CoreError::Generic(e.to_string()))?;
        }

        let url = format!("{}/application/v2/tenant/default/prepareandactivate", self.config_url);
        let response = self
            .http
            .post(&url)
            .header("Content-Type", "application/x-gzip")
            .timeout(timeout)
            .body(archive_buf)
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        tracing::event!(
            tracing::Level::WARN,
            http.status = status.as_u16(),
            body.truncated = %truncate_body(&body),
            "application package deploy rejected"
        );
        if status.as_u16() == 409 {
            return Err(CoreError::OperationConflict(
                "activation conflict: another deploy raced ahead".to_string(),
            ));
        }
        Err(CoreError::InvalidApplicationPackage(body))
    }

    pub async fn create_deployment_session(&self, timeout: Duration) -> Result<DeploymentSession> {
        let url = format!(
            "{}/application/v2/tenant/default/session?from={}/application/v2/tenant/default/application/default",
            self.config_url, self.config_url
        );
        let response = self.http.post(&url).timeout(timeout).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CoreError::Status(format!(
                "failed to create deployment session: {} {}",
                status,
                truncate_body(&body)
            )));
        }
        response.json::<DeploymentSession>().await.map_err(CoreError::from)
    }

    /// PUTs a single file's contents against a session's `contentBaseUrl` (§4.2 deploy protocol).
    pub async fn put_session_file(&self, session: &DeploymentSession, path: &str, contents: Vec<u8>, timeout: Duration) -> Result<()> {
        let url = format!("{}/{}", session.content_base_url.trim_end_matches('/'), path.trim_start_matches('/'));
        let response = self.http.put(&url).timeout(timeout).body(contents).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(CoreError::Status(format!("failed to write session file '{}': {} {}", path, status, truncate_body(&body))))
        }
    }

    /// DELETEs a single file from a session's `contentBaseUrl`.
    pub async fn delete_session_file(&self, session: &DeploymentSession, path: &str, timeout: Duration) -> Result<()> {
        let url = format!("{}/{}", session.content_base_url.trim_end_matches('/'), path.trim_start_matches('/'));
        let response = self.http.delete(&url).timeout(timeout).send().await?;
        if response.status().is_success() || response.status().as_u16() == 404 {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(CoreError::Status(format!("failed to delete session file '{}': {} {}", path, status, truncate_body(&body))))
        }
    }

    /// Prepares then activates a session. `ActivationConflict` (409) surfaces as `OperationConflict`
    /// so the caller (Index Manager) can decide whether to retry (§4.2, §4.1 error taxonomy).
    pub async fn prepare_and_activate(&self, session: &DeploymentSession, timeout: Duration) -> Result<()> {
        let prepare_response = self.http.put(&session.prepare_url).timeout(timeout).send().await?;
        if !prepare_response.status().is_success() {
            let status = prepare_response.status();
            let body = prepare_response.text().await.unwrap_or_default();
            return Err(CoreError::InvalidApplicationPackage(format!(
                "prepare failed: {} {}",
                status,
                truncate_body(&body)
            )));
        }
        let prepared: Value = prepare_response.json().await?;
        let activate_url = prepared
            .get("activate")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::Generic("prepare response missing 'activate' url".to_string()))?;

        let activate_response = self.http.put(activate_url).timeout(timeout).send().await?;
        if activate_response.status().is_success() {
            Ok(())
        } else if activate_response.status().as_u16() == 409 {
            Err(CoreError::OperationConflict(
                "activation conflict: another writer activated a newer session first".to_string(),
            ))
        } else {
            let status = activate_response.status();
            let body = activate_response.text().await.unwrap_or_default();
            Err(CoreError::Status(format!("activation failed: {} {}", status, truncate_body(&body))))
        }
    }

    /// Enumerates and fetches every file under the session into `dest_dir`.
    /// Entries whose last path segment has no dot are directories and are skipped.
    pub async fn download_application(&self, session: &DeploymentSession, dest_dir: &Path) -> Result<()> {
        let listing: Value = self.http.get(&session.content_base_url).send().await?.json().await?;
        let entries = listing
            .as_array()
            .cloned()
            .or_else(|| listing.get("children").and_then(|c| c.as_array()).cloned())
            .unwrap_or_default();

        for entry in entries {
            let Some(path) = entry.as_str() else { continue };
            let last_segment = path.rsplit('/').next().unwrap_or(path);
            if !last_segment.contains('.') {
                continue;
            }
            let url = format!("{}/{}", session.content_base_url.trim_end_matches('/'), path);
            let bytes = self.http.get(&url).send().await?.bytes().await?;
            let out_path = dest_dir.join(path);
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut f = std::fs::File::create(out_path)?;
            f.write_all(&bytes)?;
        }
        Ok(())
    }

    /// Single non-blocking convergence probe (§4.3 step 2), as opposed to
    /// `wait_for_application_convergence`'s polling loop used after a deploy.
    pub async fn check_for_application_convergence(&self) -> Result<bool> {
        let url = format!(
            "{}/application/v2/tenant/default/application/default/environment/default/region/default/instance/default/serviceconverge",
            self.config_url
        );
        let body: Value = self.http.get(&url).send().await?.json().await?;
        Ok(body.get("converged").and_then(|v| v.as_bool()).unwrap_or(false))
    }

    /// Polls convergence every second; terminal failure after `timeout` raises `NotConverged`.
    pub async fn wait_for_application_convergence(&self, timeout: Duration) -> Result<()> {
        let url = format!(
            "{}/application/v2/tenant/default/application/default/environment/default/region/default/instance/default/serviceconverge",
            self.config_url
        );
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let poll = self.http.get(&url).send().await;
            if let Ok(response) = poll {
                if let Ok(body) = response.json::<Value>().await {
                    if body.get("converged").and_then(|v| v.as_bool()).unwrap_or(false) {
                        return Ok(());
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CoreError::NotConverged(format!(
                    "store did not converge within {:?}",
                    timeout
                )));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    // ---- Feed / get / update / delete (§4.1) ----

    /// Fans out with bounded concurrency but preserves input order in the
    /// returned `BatchResult` (§5, §8): each task is tagged with its input
    /// index, and results are sorted back into place after the unordered
    /// fan-in completes.
    pub async fn feed_batch(&self, docs: Vec<FeedDoc>, schema: &str, timeout: Duration) -> BatchResult {
        let sem = self.feed_semaphore.clone();
        let mut results = stream::iter(docs.into_iter().enumerate().map(|(i, doc)| {
            let sem = sem.clone();
            let client = self.clone();
            let schema = schema.to_string();
            async move {
                let _permit = sem.acquire().await.expect("semaphore closed");
                (i, client.feed_one(&doc, &schema, timeout).await)
            }
        }))
        .buffer_unordered(usize::MAX)
        .collect::<Vec<_>>()
        .await;

        results.sort_by_key(|(i, _)| *i);
        let mut batch = BatchResult::default();
        for (_, outcome) in results {
            batch.push(outcome);
        }
        batch
    }

    async fn feed_one(&self, doc: &FeedDoc, schema: &str, timeout: Duration) -> Outcome {
        let url = self.document_path(schema, &doc.id);
        let body = serde_json::json!({ "fields": doc.fields });
        match self.http.post(&url).timeout(timeout).json(&body).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    match response.json::<Value>().await {
                        Ok(_) => Outcome::ok(&doc.id),
                        Err(_) => Outcome { id: doc.id.clone(), status: 500, message: Some("store returned a non-JSON 200 body".to_string()) },
                    }
                } else {
                    let body = response.text().await.unwrap_or_default();
                    let (code, message) = translate_store_error(status.as_u16(), &body, true);
                    Outcome { id: doc.id.clone(), status: code, message: Some(message) }
                }
            }
            Err(e) => Outcome {
                id: doc.id.clone(),
                status: 500,
                message: Some(format!("Network Error: {}", e)),
            },
        }
    }

    pub async fn get_batch(
        &self,
        ids: Vec<String>,
        schema: &str,
        fields: Option<Vec<String>>,
        timeout: Duration,
    ) -> Vec<(String, GetOutcome)> {
        let sem = self.get_semaphore.clone();
        let mut results = stream::iter(ids.into_iter().enumerate().map(|(i, id)| {
            let sem = sem.clone();
            let client = self.clone();
            let schema = schema.to_string();
            let fields = fields.clone();
            async move {
                let _permit = sem.acquire().await.expect("semaphore closed");
                let outcome = client.get_one(&id, &schema, fields.as_deref(), timeout).await;
                (i, id, outcome)
            }
        }))
        .buffer_unordered(usize::MAX)
        .collect::<Vec<_>>()
        .await;

        results.sort_by_key(|(i, _, _)| *i);
        results.into_iter().map(|(_, id, outcome)| (id, outcome)).collect()
    }

    async fn get_one(&self, id: &str, schema: &str, fields: Option<&[String]>, timeout: Duration) -> GetOutcome {
        let mut url = self.document_path(schema, id);
        if let Some(fields) = fields {
            if !fields.is_empty() {
                url.push_str(&format!("?fieldSet={}:{}", schema, fields.join(",")));
            }
        }
        match self.http.get(&url).timeout(timeout).send().await {
            Ok(response) => {
                let status = response.status();
                if status.as_u16() == 404 {
                    GetOutcome::NotFound
                } else if status.is_success() {
                    match response.json::<Value>().await {
                        Ok(body) => GetOutcome::Found(body),
                        Err(e) => GetOutcome::Error(Outcome { id: id.to_string(), status: 500, message: Some(e.to_string()) }),
                    }
                } else {
                    let body = response.text().await.unwrap_or_default();
                    let (code, message) = translate_store_error(status.as_u16(), &body, false);
                    GetOutcome::Error(Outcome { id: id.to_string(), status: code, message: Some(message) })
                }
            }
            Err(e) => GetOutcome::Error(Outcome {
                id: id.to_string(),
                status: 500,
                message: Some(format!("Network Error: {}", e)),
            }),
        }
    }

    pub async fn update_documents_batch(&self, docs: Vec<UpdateDoc>, schema: &str, timeout: Duration) -> BatchResult {
        let sem = self.partial_update_semaphore.clone();
        let mut results = stream::iter(docs.into_iter().enumerate().map(|(i, doc)| {
            let sem = sem.clone();
            let client = self.clone();
            let schema = schema.to_string();
            async move {
                let _permit = sem.acquire().await.expect("semaphore closed");
                (i, client.update_one(&doc, &schema, timeout).await)
            }
        }))
        .buffer_unordered(usize::MAX)
        .collect::<Vec<_>>()
        .await;

        results.sort_by_key(|(i, _)| *i);
        let mut batch = BatchResult::default();
        for (_, outcome) in results {
            batch.push(outcome);
        }
        batch
    }

    async fn update_one(&self, doc: &UpdateDoc, schema: &str, timeout: Duration) -> Outcome {
        let url = format!("{}?create=false", self.document_path(schema, &doc.id));
        let mut body = serde_json::json!({ "fields": doc.fields });
        if let Some(condition) = &doc.condition {
            body["condition"] = Value::String(condition.clone());
        }
        match self.http.put(&url).timeout(timeout).json(&body).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    Outcome::ok(&doc.id)
                } else {
                    let body = response.text().await.unwrap_or_default();
                    let (code, message) = translate_store_error(status.as_u16(), &body, doc.had_precondition);
                    Outcome { id: doc.id.clone(), status: code, message: Some(message) }
                }
            }
            Err(e) => Outcome {
                id: doc.id.clone(),
                status: 500,
                message: Some(format!("Network Error: {}", e)),
            },
        }
    }

    pub async fn delete_batch(&self, ids: Vec<String>, schema: &str, timeout: Duration) -> BatchResult {
        let sem = self.delete_semaphore.clone();
        let mut results = stream::iter(ids.into_iter().enumerate().map(|(i, id)| {
            let sem = sem.clone();
            let client = self.clone();
            let schema = schema.to_string();
            async move {
                let _permit = sem.acquire().await.expect("semaphore closed");
                let url = client.document_path(&schema, &id);
                let outcome = match client.http.delete(&url).timeout(timeout).send().await {
                    Ok(response) if response.status().is_success() || response.status().as_u16() == 404 => Outcome::ok(&id),
                    Ok(response) => {
                        let status = response.status();
                        let body = response.text().await.unwrap_or_default();
                        let (code, message) = translate_store_error(status.as_u16(), &body, false);
                        Outcome { id: id.clone(), status: code, message: Some(message) }
                    }
                    Err(e) => Outcome { id: id.clone(), status: 500, message: Some(format!("Network Error: {}", e)) },
                };
                (i, outcome)
            }
        }))
        .buffer_unordered(usize::MAX)
        .collect::<Vec<_>>()
        .await;

        results.sort_by_key(|(i, _)| *i);
        let mut batch = BatchResult::default();
        for (_, outcome) in results {
            batch.push(outcome);
        }
        batch
    }

    pub async fn delete_all_docs(&self, schema: &str, cluster: &str, timeout: Duration) -> Result<()> {
        let url = format!(
            "{}/document/v1/{}/{}/docid/?cluster={}&selection=true",
            self.document_url, schema, schema, cluster
        );
        let response = self.http.delete(&url).timeout(timeout).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let (code, message) = translate_store_error(status.as_u16(), &body, false);
            Err(status_to_error(code, message))
        }
    }

    /// Ordinary single-query RPC (§4.1).
    pub async fn query(&self, body: Value, timeout: Duration) -> Result<Value> {
        let url = format!("{}/search/", self.query_url);
        let response = self.http.post(&url).timeout(timeout).json(&body).send().await;
        match response {
            Ok(response) if response.status().is_success() => response.json::<Value>().await.map_err(CoreError::from),
            Ok(response) => {
                let status = response.status();
                let body = response.json::<Value>().await.unwrap_or(Value::Null);
                Err(translate_query_error(status.as_u16(), &body))
            }
            Err(e) if e.is_timeout() => Err(CoreError::Timeout(e.to_string())),
            Err(e) => Err(CoreError::NetworkError(e.to_string())),
        }
    }

    pub async fn application_version(&self) -> Result<String> {
        let url = format!("{}/state/v1/version", self.config_url);
        let body: Value = self.http.get(&url).send().await?.json().await?;
        body.get("version")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| CoreError::Generic("missing version in store response".to_string()))
    }
}

/// §6.1 error-code translation table.
fn translate_store_error(status: u16, body: &str, had_precondition: bool) -> (u16, String) {
    match status {
        404 => (404, "Document does not exist in the index".to_string()),
        412 => {
            if had_precondition {
                (400, format!(
                    "https://docs.marqo.ai/latest/ Marqo vector store couldn't update the document because it has been modified by another request. {}",
                    truncate_body(body)
                ))
            } else {
                (404, "Document does not exist in the index".to_string())
            }
        }
        429 => (429, "Marqo vector store received too many requests. Please try again later.".to_string()),
        507 => (400, "Marqo vector store is out of memory or disk space".to_string()),
        400 if body.contains("could not parse field") => {
            (400, "The document contains invalid characters in one of the fields.".to_string())
        }
        _ => (500, format!("Marqo vector store returned an unexpected error: {}", truncate_body(body))),
    }
}

/// Translates a failed `query` RPC (§4.1: soft-doom/timeout vs. mixed errors).
fn translate_query_error(status: u16, body: &Value) -> CoreError {
    let errors = body
        .get("root")
        .and_then(|r| r.get("errors"))
        .and_then(|e| e.as_array())
        .cloned()
        .unwrap_or_default();

    if !errors.is_empty() {
        let codes: Vec<i64> = errors.iter().filter_map(|e| e.get("code").and_then(|c| c.as_i64())).collect();
        let all_timeout = !codes.is_empty() && codes.iter().all(|c| *c == 12);
        if all_timeout {
            return CoreError::Timeout("store query timed out".to_string());
        }
        let summary: Vec<String> = errors
            .iter()
            .map(|e| {
                format!(
                    "{}: {}",
                    e.get("code").map(|c| c.to_string()).unwrap_or_default(),
                    e.get("message").and_then(|m| m.as_str()).unwrap_or("")
                )
            })
            .collect();
        return CoreError::Status(format!("store query failed (status {}): {}", status, summary.join("; ")));
    }

    CoreError::Status(format!("store query failed with status {}", status))
}

fn status_to_error(code: u16, message: String) -> CoreError {
    match code {
        404 => CoreError::IndexNotFound(message),
        429 => CoreError::Status(message),
        _ => CoreError::Status(message),
    }
}

/// Serializes a vector of owned bytes into a gzip-compressed tar archive in memory.
/// Exposed for the package manager's `app_bak.tgz` rollback archive (§4.2).
pub fn gzip_tar_bytes(files: &[(String, Bytes)]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    {
        let encoder = flate2::write::GzEncoder::new(&mut out, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, &contents[..])
                .map_err(|e| CoreError::Generic(e.to_string()))?;
        }
        builder
            .into_inner()
            .map_err(|e| CoreError::Generic(e.to_string()))?
            .finish()
            .map_err(|e| CoreError::Generic(e.to_string()))?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_404_directly() {
        let (code, msg) = translate_store_error(404, "", false);
        assert_eq!(code, 404);
        assert!(msg.contains("does not exist"));
    }

    #[test]
    fn translates_412_with_precondition_to_400() {
        let (code, _) = translate_store_error(412, "", true);
        assert_eq!(code, 400);
    }

    #[test]
    fn translates_412_without_precondition_to_404() {
        let (code, _) = translate_store_error(412, "", false);
        assert_eq!(code, 404);
    }

    #[test]
    fn translates_429_passthrough() {
        let (code, _) = translate_store_error(429, "", false);
        assert_eq!(code, 429);
    }

    #[test]
    fn translates_507_to_400() {
        let (code, _) = translate_store_error(507, "", false);
        assert_eq!(code, 400);
    }

    #[test]
    fn translates_parse_field_400() {
        let (code, msg) = translate_store_error(400, "could not parse field 'x'", false);
        assert_eq!(code, 400);
        assert!(msg.contains("invalid characters"));
    }

    #[test]
    fn unknown_status_maps_to_500() {
        let (code, _) = translate_store_error(503, "boom", false);
        assert_eq!(code, 500);
    }

    #[test]
    fn query_all_timeout_errors_map_to_timeout() {
        let body = serde_json::json!({"root": {"errors": [{"code": 12, "message": "timeout"}]}});
        let err = translate_query_error(500, &body);
        assert!(matches!(err, CoreError::Timeout(_)));
    }

    #[test]
    fn query_mixed_errors_map_to_status() {
        let body = serde_json::json!({"root": {"errors": [{"code": 12, "message": "timeout"}, {"code": 1, "message": "boom"}]}});
        let err = translate_query_error(500, &body);
        assert!(matches!(err, CoreError::Status(_)));
    }
}
