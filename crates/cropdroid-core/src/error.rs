//! Error taxonomy shared by every CropDroid crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CropDroidError>;

#[derive(Debug, Error)]
pub enum CropDroidError {
    /// Network failure or non-2xx answer from a device.
    #[error("device {device} unreachable: {reason}")]
    DeviceUnreachable { device: String, reason: String },

    /// Device answered, but not with the documented contract.
    #[error("device {device} protocol error: {reason}")]
    DeviceProtocol { device: String, reason: String },

    #[error("{kind} {id} not found")]
    StoreNotFound { kind: String, id: u64 },

    #[error("store conflict: {0}")]
    StoreConflict(String),

    #[error("replication unavailable: {0}")]
    ReplicationUnavailable(String),

    #[error("schedule {schedule_id} invalid: {reason}")]
    ScheduleInvalid { schedule_id: u64, reason: String },

    #[error("workflow {0} is busy")]
    WorkflowBusy(u64),

    #[error("shutdown in progress")]
    Shutdown,

    #[error("notification queue full")]
    NotificationOverflow,

    #[error("user {user_id} not permitted to {action} on farm {farm_id}")]
    Unauthorized {
        user_id: u64,
        farm_id: u64,
        action: String,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("config error: {0}")]
    Config(String),

    /// Caller input that can never succeed as sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("notification dispatch failed: {0}")]
    Notification(String),

    #[error("security error: {0}")]
    Security(String),

    /// A programmer bug; the only thing allowed to restart a farm supervisor.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Flat classification used for logging and REST mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    DeviceUnreachable,
    DeviceProtocol,
    StoreNotFound,
    StoreConflict,
    ReplicationUnavailable,
    ScheduleInvalid,
    WorkflowBusy,
    Shutdown,
    Overflow,
    Unauthorized,
    Config,
    InvalidRequest,
    Internal,
}

impl CropDroidError {
    pub fn unreachable(device: impl Into<String>, reason: impl ToString) -> Self {
        Self::DeviceUnreachable {
            device: device.into(),
            reason: reason.to_string(),
        }
    }

    pub fn protocol(device: impl Into<String>, reason: impl ToString) -> Self {
        Self::DeviceProtocol {
            device: device.into(),
            reason: reason.to_string(),
        }
    }

    pub fn not_found(kind: impl Into<String>, id: u64) -> Self {
        Self::StoreNotFound {
            kind: kind.into(),
            id,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DeviceUnreachable { .. } => ErrorKind::DeviceUnreachable,
            Self::DeviceProtocol { .. } => ErrorKind::DeviceProtocol,
            Self::StoreNotFound { .. } | Self::NotFound(_) => ErrorKind::StoreNotFound,
            Self::StoreConflict(_) => ErrorKind::StoreConflict,
            Self::ReplicationUnavailable(_) => ErrorKind::ReplicationUnavailable,
            Self::ScheduleInvalid { .. } => ErrorKind::ScheduleInvalid,
            Self::WorkflowBusy(_) => ErrorKind::WorkflowBusy,
            Self::Shutdown => ErrorKind::Shutdown,
            Self::NotificationOverflow => ErrorKind::Overflow,
            Self::Unauthorized { .. } => ErrorKind::Unauthorized,
            Self::Config(_) => ErrorKind::Config,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            _ => ErrorKind::Internal,
        }
    }

    /// Status code the REST collaborator answers with.
    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::StoreNotFound => 404,
            ErrorKind::StoreConflict => 409,
            ErrorKind::WorkflowBusy => 423,
            ErrorKind::Unauthorized => 403,
            ErrorKind::ReplicationUnavailable | ErrorKind::Shutdown | ErrorKind::Overflow => 503,
            ErrorKind::DeviceUnreachable | ErrorKind::DeviceProtocol => 502,
            ErrorKind::ScheduleInvalid | ErrorKind::Config | ErrorKind::InvalidRequest => 400,
            ErrorKind::Internal => 500,
        }
    }

    /// Only idempotent network faults are retried locally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::DeviceUnreachable | ErrorKind::ReplicationUnavailable
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(CropDroidError::not_found("farm", 7).http_status(), 404);
        assert_eq!(CropDroidError::StoreConflict("dup".into()).http_status(), 409);
        assert_eq!(CropDroidError::WorkflowBusy(1).http_status(), 423);
        assert_eq!(CropDroidError::InvalidRequest("state 7".into()).http_status(), 400);
        assert_eq!(CropDroidError::Invariant("x".into()).http_status(), 500);
    }

    #[test]
    fn test_retryable() {
        assert!(CropDroidError::unreachable("room", "timeout").is_retryable());
        assert!(!CropDroidError::protocol("room", "bad json").is_retryable());
        assert!(!CropDroidError::StoreConflict("dup".into()).is_retryable());
    }
}
