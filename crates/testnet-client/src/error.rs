//! Errors returned by network context operations.
//!
//! Each failure keeps its cause as a `source`, so the full chain can be
//! printed with `{:#}` through anyhow. [`ErrorKind`] flattens them for
//! callers that only branch on the broad category.

use thiserror::Error;

use testnet_common::{FilesArtifactId, ServiceId};

use crate::gateway::GatewayError;
use crate::staging::StagingError;
use crate::topology::TopologyError;

/// Errors surfaced by [`crate::NetworkContext`] operations.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("service '{0}' already exists in the network")]
    DuplicateService(ServiceId),
    #[error("no service with ID '{0}' exists in the network")]
    ServiceNotFound(ServiceId),
    #[error("service '{service_id}' is not a {expected}")]
    WrongServiceType {
        service_id: ServiceId,
        expected: &'static str,
    },
    #[error("service '{service_id}' requests files artifact '{artifact_id}', which has no URL")]
    UnknownFilesArtifact {
        service_id: ServiceId,
        artifact_id: FilesArtifactId,
    },
    #[error("invalid topology")]
    InvalidTopology(#[from] TopologyError),
    #[error("partitioning is not enabled for this network")]
    PartitioningDisabled,
    #[error("config factory for service '{service_id}' failed to build the {stage} config")]
    ConfigFactory {
        service_id: ServiceId,
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("could not stage generated files for service '{service_id}'")]
    Staging {
        service_id: ServiceId,
        #[source]
        source: StagingError,
    },
    #[error("{action} failed")]
    Gateway {
        action: String,
        #[source]
        source: GatewayError,
    },
}

/// Coarse classification for callers that only care what went wrong, not where.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input detected locally; nothing was sent.
    Configuration,
    /// The engine could not be reached within the retry budget.
    Unavailable,
    /// The engine answered and refused, or answered with nonsense.
    Remote,
    /// Local I/O on the suite execution volume.
    Io,
}

impl NetworkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetworkError::DuplicateService(_)
            | NetworkError::ServiceNotFound(_)
            | NetworkError::WrongServiceType { .. }
            | NetworkError::UnknownFilesArtifact { .. }
            | NetworkError::InvalidTopology(_)
            | NetworkError::PartitioningDisabled
            | NetworkError::ConfigFactory { .. } => ErrorKind::Configuration,
            NetworkError::Staging { source, .. } => match source {
                StagingError::Io { .. } => ErrorKind::Io,
                _ => ErrorKind::Configuration,
            },
            NetworkError::Gateway { source, .. } if source.is_unavailable() => {
                ErrorKind::Unavailable
            }
            NetworkError::Gateway { source, .. } => match source {
                GatewayError::Encode { .. } => ErrorKind::Configuration,
                _ => ErrorKind::Remote,
            },
        }
    }

    pub(crate) fn gateway(action: impl Into<String>, source: GatewayError) -> Self {
        NetworkError::Gateway {
            action: action.into(),
            source,
        }
    }
}
