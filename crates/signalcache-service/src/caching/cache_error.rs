use std::time::Duration;

use thiserror::Error;

use super::rate_limit::RateLimitDenial;
use super::retry::RetryError;
use super::store::StoreError;

/// An error reported by an upstream producer, such as an LLM call or a market snapshot fetch.
///
/// The variants are chosen so that [`is_retryable`](Self::is_retryable) can tell transient
/// failures apart from permanent ones.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    /// The upstream did not answer in time.
    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),
    /// The upstream answered with a 5xx status.
    #[error("upstream server error {status}: {details}")]
    ServerError { status: u16, details: String },
    /// The upstream rejected the call because its own rate limit was reached.
    #[error("upstream rate limited")]
    RateLimited { retry_after: Option<Duration> },
    /// The call failed before getting an answer, e.g. connection loss or DNS resolution.
    #[error("upstream request failed: {0}")]
    RequestFailed(String),
    /// The request or the upstream response is invalid in some way.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The upstream refused the call due to missing credentials or permissions.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

impl UpstreamError {
    /// Classifies an unsuccessful HTTP status code.
    pub fn from_status(status: u16, details: impl Into<String>) -> Self {
        let details = details.into();
        match status {
            429 => Self::RateLimited { retry_after: None },
            401 | 403 => Self::PermissionDenied(details),
            408 => Self::Timeout(Duration::ZERO),
            500..=599 => Self::ServerError { status, details },
            _ => Self::Malformed(details),
        }
    }

    /// Whether repeating the call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_)
            | Self::ServerError { .. }
            | Self::RateLimited { .. }
            | Self::RequestFailed(_) => true,
            Self::Malformed(_) | Self::PermissionDenied(_) => false,
        }
    }

    /// A short name used to tag metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::ServerError { .. } => "server-error",
            Self::RateLimited { .. } => "rate-limited",
            Self::RequestFailed(_) => "request-failed",
            Self::Malformed(_) => "malformed",
            Self::PermissionDenied(_) => "permission-denied",
        }
    }
}

/// The error type of the computation cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The input could not be brought into canonical form.
    #[error("unsupported value: {0}")]
    UnsupportedValue(String),
    /// The producer failed with an error that retrying cannot fix.
    #[error("upstream failed permanently: {0}")]
    NonRetryable(UpstreamError),
    /// The producer failed on every permitted attempt.
    #[error("upstream failed after {attempts} attempts: {cause}")]
    ExhaustedRetries { attempts: u32, cause: UpstreamError },
    /// The computation was aborted before it finished.
    #[error("computation cancelled")]
    Cancelled,
    /// The durable store could not be reached.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    /// The caller exceeded one of its request ceilings.
    #[error("{0}")]
    RateLimited(RateLimitDenial),
    /// No artifact exists and producing one failed.
    #[error("no artifact could be produced")]
    ProducerFailed(#[source] Box<CacheError>),
    /// An unexpected error in the cache itself.
    #[error("internal error")]
    InternalError,
}

impl CacheError {
    /// Whether issuing the same request again later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ExhaustedRetries { .. }
            | Self::StoreUnavailable(_)
            | Self::RateLimited(_)
            | Self::Cancelled => true,
            Self::UnsupportedValue(_) | Self::NonRetryable(_) | Self::InternalError => false,
            Self::ProducerFailed(cause) => cause.is_retryable(),
        }
    }

    /// A short name used to tag metrics.
    pub fn metrics_tag(&self) -> &'static str {
        match self {
            Self::UnsupportedValue(_) => "unsupported-value",
            Self::NonRetryable(_) => "non-retryable",
            Self::ExhaustedRetries { .. } => "exhausted-retries",
            Self::Cancelled => "cancelled",
            Self::StoreUnavailable(_) => "store-unavailable",
            Self::RateLimited(_) => "rate-limited",
            Self::ProducerFailed(_) => "producer-failed",
            Self::InternalError => "internal-error",
        }
    }

    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }
}

impl From<serde_json::Error> for CacheError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<StoreError> for CacheError {
    fn from(err: StoreError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<RetryError<UpstreamError>> for CacheError {
    fn from(err: RetryError<UpstreamError>) -> Self {
        match err {
            RetryError::NonRetryable(cause) => Self::NonRetryable(cause),
            RetryError::ExhaustedRetries { attempts, cause } => {
                Self::ExhaustedRetries { attempts, cause }
            }
            RetryError::Cancelled => Self::Cancelled,
        }
    }
}

impl From<RetryError<StoreError>> for CacheError {
    fn from(err: RetryError<StoreError>) -> Self {
        match err {
            RetryError::NonRetryable(cause) | RetryError::ExhaustedRetries { cause, .. } => {
                cause.into()
            }
            RetryError::Cancelled => Self::Cancelled,
        }
    }
}

/// An entry in a cache, containing either `Ok(T)` or an error denoting the reason why no
/// value could be produced.
pub type CacheEntry<T = ()> = Result<T, CacheError>;
