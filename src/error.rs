//! Gateway error types
//!
//! Two layers, mirroring how the rest of the crate is split: `AppError` for
//! infrastructure paths (database, config, IO) and `GatewayError` for the
//! request-dispatch pipeline. The dispatcher is the only place a
//! `GatewayError` is turned into an HTTP-visible shape; upstream bodies are
//! never forwarded verbatim.

use axum::http::StatusCode;

/// Application-wide error for infrastructure operations.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Secret error: {0}")]
    Secret(String),
}

pub type AppResult<T> = Result<T, AppError>;

/// Canonical error kinds with stable string codes.
///
/// Every component in the dispatch path reports failures as one of these;
/// the per-dialect error envelope is rendered from this table alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidKey,
    TokenDisabled,
    TokenExpired,
    TokenExhausted,
    IpNotAllowed,
    ModelNotPermitted,
    QuotaInsufficient,
    UnsupportedRequestFeature,
    BadRequest,
    NoProviderAvailable,
    RateLimited,
    UpstreamTimeout,
    Upstream5xx,
    UpstreamAuthFailed,
    ClientCancelled,
    Internal,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::InvalidKey => "invalid_key",
            ErrorKind::TokenDisabled => "token_disabled",
            ErrorKind::TokenExpired => "token_expired",
            ErrorKind::TokenExhausted => "token_exhausted",
            ErrorKind::IpNotAllowed => "ip_not_allowed",
            ErrorKind::ModelNotPermitted => "model_not_permitted",
            ErrorKind::QuotaInsufficient => "quota_insufficient",
            ErrorKind::UnsupportedRequestFeature => "unsupported_request_feature",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::NoProviderAvailable => "no_provider_available",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::UpstreamTimeout => "upstream_timeout",
            ErrorKind::Upstream5xx => "upstream_5xx",
            ErrorKind::UpstreamAuthFailed => "upstream_auth_failed",
            ErrorKind::ClientCancelled => "client_cancelled",
            ErrorKind::Internal => "internal_error",
        }
    }

    /// HTTP status reported to the caller when this kind is terminal.
    pub fn status(&self) -> StatusCode {
        match self {
            ErrorKind::InvalidKey
            | ErrorKind::TokenDisabled
            | ErrorKind::TokenExpired
            | ErrorKind::TokenExhausted => StatusCode::UNAUTHORIZED,
            ErrorKind::IpNotAllowed
            | ErrorKind::ModelNotPermitted
            | ErrorKind::QuotaInsufficient => StatusCode::FORBIDDEN,
            ErrorKind::UnsupportedRequestFeature | ErrorKind::BadRequest => {
                StatusCode::BAD_REQUEST
            }
            ErrorKind::NoProviderAvailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::UpstreamTimeout
            | ErrorKind::Upstream5xx
            | ErrorKind::UpstreamAuthFailed => StatusCode::BAD_GATEWAY,
            // 499 has no StatusCode constant; the log sink records the raw number.
            ErrorKind::ClientCancelled => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the dispatcher may try another account after this failure,
    /// provided no chunk has reached the client yet.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::UpstreamTimeout
                | ErrorKind::Upstream5xx
                | ErrorKind::UpstreamAuthFailed
                | ErrorKind::RateLimited
        )
    }
}

/// Error carried through the dispatch pipeline.
#[derive(Debug, Clone)]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub message: String,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UnsupportedRequestFeature, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl std::error::Error for GatewayError {}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Request outcome as seen by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RateLimited,
    AuthFailed,
    Upstream5xx,
    Timeout,
    ClientError,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::RateLimited => "rate_limited",
            Outcome::AuthFailed => "auth_failed",
            Outcome::Upstream5xx => "upstream_5xx",
            Outcome::Timeout => "timeout",
            Outcome::ClientError => "client_error",
        }
    }

    /// Classify a dispatch error into the outcome taxonomy.
    pub fn from_error(err: &GatewayError) -> Self {
        match err.kind {
            ErrorKind::RateLimited => Outcome::RateLimited,
            ErrorKind::UpstreamAuthFailed => Outcome::AuthFailed,
            ErrorKind::Upstream5xx => Outcome::Upstream5xx,
            ErrorKind::UpstreamTimeout => Outcome::Timeout,
            _ => Outcome::ClientError,
        }
    }
}
