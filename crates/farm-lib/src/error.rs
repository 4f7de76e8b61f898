//! Typed failures surfaced by the controller components
//!
//! Every variant carries the identity of the offending entity and the last
//! state the controller observed for it. "Not ready yet" conditions are not
//! errors; components report them as `Waiting` states instead.

use crate::cluster::ClusterApiError;
use crate::models::BoundState;
use std::time::Duration;
use thiserror::Error;

pub type FarmResult<T> = Result<T, FarmError>;

#[derive(Debug, Clone, Error)]
pub enum FarmError {
    /// The claim never reached `Bound` within the bind timeout
    #[error("volume claim {claim} not bound after {waited:?} (last state: {last_state})")]
    StorageTimeout {
        claim: String,
        last_state: BoundState,
        waited: Duration,
    },

    #[error(transparent)]
    Publish(#[from] PublishError),

    /// A resize kept colliding with another operation on the same pool
    #[error("pool {pool} still busy after {attempts} resize attempts (node count {node_count}, target {target})")]
    ScaleConflict {
        pool: String,
        attempts: u32,
        node_count: u32,
        target: u32,
    },

    /// The workload can never fit the pool; needs an operator fix
    #[error("workload {workload} (revision {revision}) cannot be scheduled on pool {pool}: {reason}")]
    UnschedulableSpec {
        workload: String,
        pool: String,
        revision: String,
        reason: String,
    },

    #[error("{operation} on {entity} exceeded {timeout:?}")]
    OperationTimeout {
        entity: String,
        operation: String,
        timeout: Duration,
    },

    #[error("cluster API call {operation} on {entity} failed: {source}")]
    Cluster {
        entity: String,
        operation: String,
        #[source]
        source: ClusterApiError,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl FarmError {
    /// Short label used for metrics and status output
    pub fn kind(&self) -> &'static str {
        match self {
            FarmError::StorageTimeout { .. } => "storage_timeout",
            FarmError::Publish(_) => "publish",
            FarmError::ScaleConflict { .. } => "scale_conflict",
            FarmError::UnschedulableSpec { .. } => "unschedulable_spec",
            FarmError::OperationTimeout { .. } => "operation_timeout",
            FarmError::Cluster { .. } => "cluster",
            FarmError::InvalidConfig(_) => "invalid_config",
        }
    }

    /// Whether the next reconcile tick may simply try again
    pub fn is_retryable(&self) -> bool {
        match self {
            FarmError::UnschedulableSpec { .. } | FarmError::InvalidConfig(_) => false,
            FarmError::Publish(e) => !matches!(
                e.kind,
                PublishErrorKind::Authentication | PublishErrorKind::InvalidReference
            ),
            _ => true,
        }
    }

    pub(crate) fn cluster(
        entity: impl Into<String>,
        operation: impl Into<String>,
        source: ClusterApiError,
    ) -> Self {
        FarmError::Cluster {
            entity: entity.into(),
            operation: operation.into(),
            source,
        }
    }
}

/// Why a publication failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishErrorKind {
    /// Credentials rejected; never retried
    Authentication,
    /// Network or registry hiccup that outlived the retry budget
    Transient,
    /// Pushed reference did not resolve to the pushed digest
    Verification,
    /// The local build/tag step has no image for the reference
    LocalImage,
    /// The reference itself does not parse
    InvalidReference,
}

impl std::fmt::Display for PublishErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishErrorKind::Authentication => write!(f, "authentication"),
            PublishErrorKind::Transient => write!(f, "transient"),
            PublishErrorKind::Verification => write!(f, "verification"),
            PublishErrorKind::LocalImage => write!(f, "local image"),
            PublishErrorKind::InvalidReference => write!(f, "invalid reference"),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("failed to publish {image} ({kind}) after {attempts} attempt(s): {message}")]
pub struct PublishError {
    pub image: String,
    pub kind: PublishErrorKind,
    pub attempts: u32,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_identity() {
        let err = FarmError::StorageTimeout {
            claim: "jenkins-home".to_string(),
            last_state: BoundState::Pending,
            waited: Duration::from_secs(120),
        };
        let msg = err.to_string();
        assert!(msg.contains("jenkins-home"));
        assert!(msg.contains("pending"));

        let err = FarmError::ScaleConflict {
            pool: "us-central1-a/ci-pool".to_string(),
            attempts: 5,
            node_count: 0,
            target: 1,
        };
        assert!(err.to_string().contains("ci-pool"));
        assert_eq!(err.kind(), "scale_conflict");
    }

    #[test]
    fn test_retryable_classification() {
        let auth: FarmError = PublishError {
            image: "gcr.io/acme/jenkins:lts".to_string(),
            kind: PublishErrorKind::Authentication,
            attempts: 1,
            message: "denied".to_string(),
        }
        .into();
        assert!(!auth.is_retryable());

        let unschedulable = FarmError::UnschedulableSpec {
            workload: "jenkins".to_string(),
            pool: "ci-pool".to_string(),
            revision: "abc".to_string(),
            reason: "too big".to_string(),
        };
        assert!(!unschedulable.is_retryable());

        let timeout = FarmError::OperationTimeout {
            entity: "ci-pool".to_string(),
            operation: "resize_node_pool".to_string(),
            timeout: Duration::from_secs(600),
        };
        assert!(timeout.is_retryable());
    }
}
