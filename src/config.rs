use std::env;
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Process-wide configuration, read once from the environment (§5, §9 "Global state").
///
/// Mirrors the teacher's `Config::from_env` shape: typed fields, sane defaults,
/// nothing required to be set for local development.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub store_document_url: String,
    pub store_query_url: String,
    pub store_config_url: String,

    pub feed_pool_size: usize,
    pub get_pool_size: usize,
    pub delete_pool_size: usize,
    pub partial_update_pool_size: usize,

    pub feed_timeout: Duration,
    pub query_timeout_ms: u64,
    pub lock_acquire_timeout: Duration,
    pub convergence_timeout: Duration,

    pub max_docs_per_batch: usize,
    pub max_doc_bytes: usize,

    pub media_download_pool_images: usize,
    pub media_download_pool_mixed: usize,
    pub media_download_timeout: Duration,
    pub max_video_audio_file_size_bytes: u64,

    pub this_version: String,
}

impl CoreConfig {
    pub fn from_env() -> Self {
        CoreConfig {
            store_document_url: env::var("MARQO_STORE_DOCUMENT_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            store_query_url: env::var("MARQO_STORE_QUERY_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            store_config_url: env::var("MARQO_STORE_CONFIG_URL")
                .unwrap_or_else(|_| "http://localhost:19071".to_string()),

            feed_pool_size: env_or("MARQO_FEED_POOL_SIZE", 10),
            get_pool_size: env_or("MARQO_GET_POOL_SIZE", 10),
            delete_pool_size: env_or("MARQO_DELETE_POOL_SIZE", 10),
            partial_update_pool_size: env_or("MARQO_PARTIAL_UPDATE_POOL_SIZE", 10),

            feed_timeout: Duration::from_secs(env_or("MARQO_FEED_TIMEOUT_SECS", 60)),
            query_timeout_ms: env_or("MARQO_DEFAULT_SEARCH_TIMEOUT_MS", 3000),
            lock_acquire_timeout: Duration::from_millis(env_or("MARQO_LOCK_TIMEOUT_MS", 2000)),
            convergence_timeout: Duration::from_secs(env_or("MARQO_CONVERGENCE_TIMEOUT_SECS", 120)),

            max_docs_per_batch: env_or("MARQO_MAX_DOCS_PER_BATCH", 128),
            max_doc_bytes: env_or("MARQO_MAX_DOC_BYTES", 400_000),

            media_download_pool_images: env_or("MARQO_IMAGE_DOWNLOAD_THREAD_COUNT", 20),
            media_download_pool_mixed: env_or("MARQO_MEDIA_DOWNLOAD_THREAD_COUNT", 5),
            media_download_timeout: Duration::from_secs(env_or("MARQO_MEDIA_DOWNLOAD_TIMEOUT_SECS", 10)),
            max_video_audio_file_size_bytes: env_or(
                "MARQO_MAX_ADD_DOCS_VIDEO_AUDIO_FILE_SIZE",
                400_000_000,
            ),

            this_version: env::var("MARQO_VERSION").unwrap_or_else(|_| "2.13.0".to_string()),
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig::from_env()
    }
}
