use thiserror::Error;

use crate::model::MemberId;

/// Canonical error type returned by every engine operation.
#[derive(Debug, Error)]
pub enum ReferralError {
    /// Unknown member, relation, withdrawal or other keyed record.
    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },

    /// Malformed or out-of-range input (amounts, methods, self-referral).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Duplicate identity key, replayed event or stale state transition.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The acting principal may not touch the target.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A batch would break a store invariant (negative balance, dangling row).
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Bonus configuration could not be parsed or is inconsistent.
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding error: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// Coarse classification; the CLI maps it to its exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Validation,
    Conflict,
    PermissionDenied,
    Invariant,
    Internal,
}

impl ReferralError {
    pub fn member_not_found(id: MemberId) -> Self {
        ReferralError::NotFound {
            entity: "member",
            key: id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ReferralError::NotFound { .. } => ErrorKind::NotFound,
            ReferralError::Validation(_) => ErrorKind::Validation,
            ReferralError::Conflict(_) => ErrorKind::Conflict,
            ReferralError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            ReferralError::Invariant(_) => ErrorKind::Invariant,
            ReferralError::Config(_) | ReferralError::Io(_) | ReferralError::Snapshot(_) => {
                ErrorKind::Internal
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ReferralError>;
