use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure reported by a platform client for a single remote call.
#[derive(Debug, Clone, Error)]
pub enum PlatformError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("target not found or not permitted: {0}")]
    NotFound(String),
    #[error("rate limited, retry after {retry_after:?} (global={global})")]
    RateLimited { retry_after: Duration, global: bool },
    #[error("transient network failure: {0}")]
    Transient(String),
    #[error("unexpected provider response: {0}")]
    Protocol(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rate limited after {attempts} attempts (last wait {last_wait:?})")]
    RateLimited { attempts: u32, last_wait: Duration },
    #[error("network failure after {attempts} attempts: {message}")]
    TransientNetwork { attempts: u32, message: String },
    #[error("corrupt state in {}: {reason}", path.display())]
    CorruptState { path: PathBuf, reason: String },
    #[error("conversation is locked by another writer: {}", .0.display())]
    Locked(PathBuf),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("provider protocol error: {0}")]
    Protocol(String),
    #[error("internal failure: {0}")]
    Internal(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    pub fn code(&self) -> SyncErrorCode {
        match self {
            Self::Auth(_) => SyncErrorCode::E001Auth,
            Self::NotFound(_) => SyncErrorCode::E002NotFound,
            Self::RateLimited { .. } => SyncErrorCode::E003RateLimited,
            Self::TransientNetwork { .. } => SyncErrorCode::E004Network,
            Self::CorruptState { .. } => SyncErrorCode::E005StateCorrupt,
            Self::Locked(_) => SyncErrorCode::E006Locked,
            Self::InvalidInput(_) | Self::Unsupported(_) => SyncErrorCode::E007Invalid,
            Self::Protocol(_) | Self::Internal(_) | Self::Io(_) | Self::Json(_) => {
                SyncErrorCode::E008Internal
            }
        }
    }

    /// Process exit code for a failure rooted in this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NotFound(_) => 2,
            Self::RateLimited { .. } => 3,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorCode {
    E001Auth,
    E002NotFound,
    E003RateLimited,
    E004Network,
    E005StateCorrupt,
    E006Locked,
    E007Invalid,
    E008Internal,
}

impl SyncErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::E001Auth => "E001_AUTH",
            Self::E002NotFound => "E002_NOT_FOUND",
            Self::E003RateLimited => "E003_RATE_LIMITED",
            Self::E004Network => "E004_NETWORK",
            Self::E005StateCorrupt => "E005_STATE_CORRUPT",
            Self::E006Locked => "E006_LOCKED",
            Self::E007Invalid => "E007_INVALID",
            Self::E008Internal => "E008_INTERNAL",
        }
    }
}

/// Walks an `anyhow` chain and picks the exit code of the first `SyncError`.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<SyncError>())
        .map(SyncError::exit_code)
        .unwrap_or(1)
}
