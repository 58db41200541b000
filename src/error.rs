use thiserror::Error;

/// The error taxonomy shared by every component (§7).
///
/// Each variant carries its own human-readable message; the status code is
/// derived rather than stored, so translation tables (§6.1) stay in one place.
#[derive(Debug, Error, Clone)]
pub enum CoreError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    UnsupportedFeature(String),

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("index already exists: {0}")]
    IndexExists(String),

    #[error("{0}")]
    OperationConflict(String),

    #[error("store has not converged: {0}")]
    NotConverged(String),

    #[error("{0}")]
    Status(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("document too large: {0}")]
    DocTooLarge(String),

    #[error("media download failed: {0}")]
    MediaDownloadError(String),

    #[error("media exceeds maximum size: {0}")]
    MediaExceedsMaxSize(String),

    #[error("media mismatch: {0}")]
    MediaMismatch(String),

    #[error("unsupported modality: {0}")]
    UnsupportedModality(String),

    #[error("invalid application package: {0}")]
    InvalidApplicationPackage(String),

    #[error("unexpected error: {0}")]
    Generic(String),
}

impl CoreError {
    /// HTTP-shaped status code for callers outside this core (§7).
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::InvalidArgument(_) => 400,
            CoreError::UnsupportedFeature(_) => 400,
            CoreError::IndexNotFound(_) => 404,
            CoreError::IndexExists(_) => 409,
            CoreError::OperationConflict(_) => 409,
            CoreError::NotConverged(_) => 500,
            CoreError::Status(_) => 500,
            CoreError::Timeout(_) => 504,
            CoreError::NetworkError(_) => 500,
            CoreError::DocTooLarge(_) => 400,
            CoreError::MediaDownloadError(_) => 400,
            CoreError::MediaExceedsMaxSize(_) => 400,
            CoreError::MediaMismatch(_) => 400,
            CoreError::UnsupportedModality(_) => 400,
            CoreError::InvalidApplicationPackage(_) => 400,
            CoreError::Generic(_) => 500,
        }
    }

    /// Stable kind token, surfaced alongside the message (§7 "stable error kind token").
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidArgument(_) => "InvalidArgument",
            CoreError::UnsupportedFeature(_) => "UnsupportedFeature",
            CoreError::IndexNotFound(_) => "IndexNotFound",
            CoreError::IndexExists(_) => "IndexExists",
            CoreError::OperationConflict(_) => "OperationConflict",
            CoreError::NotConverged(_) => "NotConverged",
            CoreError::Status(_) => "Status",
            CoreError::Timeout(_) => "Timeout",
            CoreError::NetworkError(_) => "NetworkError",
            CoreError::DocTooLarge(_) => "DocTooLarge",
            CoreError::MediaDownloadError(_) => "MediaDownloadError",
            CoreError::MediaExceedsMaxSize(_) => "MediaExceedsMaxSize",
            CoreError::MediaMismatch(_) => "MediaMismatch",
            CoreError::UnsupportedModality(_) => "UnsupportedModality",
            CoreError::InvalidApplicationPackage(_) => "InvalidApplicationPackage",
            CoreError::Generic(_) => "Generic",
        }
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CoreError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            CoreError::NetworkError(err.to_string())
        } else {
            CoreError::Generic(err.to_string())
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Generic(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// A per-document outcome within a batch response (§4.1, §9 "Result types").
#[derive(Debug, Clone, serde::Serialize)]
pub struct Outcome {
    pub id: String,
    pub status: u16,
    pub message: Option<String>,
}

impl Outcome {
    pub fn ok(id: impl Into<String>) -> Self {
        Outcome { id: id.into(), status: 200, message: None }
    }

    pub fn err(id: impl Into<String>, err: &CoreError) -> Self {
        Outcome { id: id.into(), status: err.status_code(), message: Some(err.to_string()) }
    }
}

/// `{errors: bool, items: [Outcome]}` (§9).
#[derive(Debug, Clone, serde::Serialize, Default)]
pub struct BatchResult {
    pub errors: bool,
    pub items: Vec<Outcome>,
}

impl BatchResult {
    pub fn push(&mut self, outcome: Outcome) {
        if outcome.status >= 400 {
            self.errors = true;
        }
        self.items.push(outcome);
    }
}
