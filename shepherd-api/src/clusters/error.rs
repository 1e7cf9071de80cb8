//! Cluster registry error types and ApiError mapping

use std::time::Duration;

use crate::error::ApiError;
use shepherd_common::auth::Action;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    /// The actor lacks the grant for `action` on `scope`
    #[error("permission denied: {resource}, {action}, {scope}")]
    PermissionDenied {
        resource: String,
        action: Action,
        scope: String,
    },

    #[error("cluster '{0}' not found")]
    NotFound(String),

    /// A different entry exists under the same key and upsert was not requested
    #[error("existing cluster spec for '{0}' is different; use upsert flag to force update")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A step of remote RBAC provisioning failed
    #[error("failed to provision RBAC on {server}: {message}")]
    RemoteProvisioningFailed { server: String, message: String },

    /// Reachability check failed; recorded in the entry status only
    #[error("{message}")]
    ProbeFailed { server: String, message: String },

    #[error("failed to connect to {server}: {message}")]
    Connection { server: String, message: String },

    #[error("{operation} timed out after {}s", .after.as_secs_f64())]
    Timeout { operation: String, after: Duration },

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("storage error: {0}")]
    Storage(String),
}

impl ClusterError {
    /// Whether the caller may succeed by retrying the same request
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterError::RemoteProvisioningFailed { .. }
                | ClusterError::Connection { .. }
                | ClusterError::Timeout { .. }
                | ClusterError::Kube(_)
        )
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        ClusterError::Timeout {
            operation: operation.into(),
            after,
        }
    }
}

impl From<shepherd_common::Error> for ClusterError {
    fn from(err: shepherd_common::Error) -> Self {
        match err {
            shepherd_common::Error::InvalidConfig(msg) | shepherd_common::Error::Validation(msg) => {
                ClusterError::InvalidArgument(msg)
            }
            other => ClusterError::Storage(other.to_string()),
        }
    }
}

impl From<ClusterError> for ApiError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::PermissionDenied { .. } => ApiError::PermissionDenied(err.to_string()),
            ClusterError::NotFound(_) => ApiError::NotFound(err.to_string()),
            ClusterError::AlreadyExists(_) => ApiError::AlreadyExists(err.to_string()),
            ClusterError::Conflict(msg) => ApiError::Conflict(msg),
            ClusterError::InvalidArgument(msg) => ApiError::BadRequest(msg),
            ClusterError::RemoteProvisioningFailed { .. }
            | ClusterError::Connection { .. }
            | ClusterError::ProbeFailed { .. }
            | ClusterError::Kube(_) => ApiError::BadGateway(err.to_string()),
            ClusterError::Timeout { .. } => ApiError::GatewayTimeout(err.to_string()),
            ClusterError::Storage(msg) => ApiError::Internal(msg),
        }
    }
}

/// Result type alias for registry operations
pub type ClusterResult<T> = std::result::Result<T, ClusterError>;
