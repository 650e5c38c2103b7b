//! Partition topology snapshots.
//!
//! A [`Topology`] is the complete partition layout submitted in one
//! repartition call: which services sit in which partition, which pairs of
//! partitions have an explicit connection, and the connection used for
//! every other pair. Connections are symmetric; `a -> b` and `b -> a` name
//! the same link.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use testnet_common::protocol::{
    PartitionConnectionInfo, PartitionConnections, PartitionServices, RepartitionArgs,
};
use testnet_common::{PartitionId, ServiceId};

pub type PartitionServiceMap = BTreeMap<PartitionId, BTreeSet<ServiceId>>;
pub type PartitionConnectionMap =
    BTreeMap<PartitionId, BTreeMap<PartitionId, PartitionConnectionInfo>>;

/// Why a topology snapshot was refused before being sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("partition '{partition}' lists unknown service '{service}'")]
    UnknownService {
        partition: PartitionId,
        service: ServiceId,
    },
    #[error("service '{service}' is listed in both partition '{first}' and partition '{second}'")]
    DuplicateMembership {
        service: ServiceId,
        first: PartitionId,
        second: PartitionId,
    },
    #[error("connection names undeclared partition '{0}'")]
    UndeclaredPartition(PartitionId),
    #[error("partition '{0}' has a connection to itself")]
    SelfConnection(PartitionId),
    #[error("connection '{a}' <-> '{b}' is given twice with different blocking")]
    ConflictingDirections { a: PartitionId, b: PartitionId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub partition_services: PartitionServiceMap,
    pub partition_connections: PartitionConnectionMap,
    pub default_connection: PartitionConnectionInfo,
}

impl Topology {
    pub fn new(
        partition_services: PartitionServiceMap,
        partition_connections: PartitionConnectionMap,
        default_connection: PartitionConnectionInfo,
    ) -> Self {
        Self {
            partition_services,
            partition_connections,
            default_connection,
        }
    }

    /// Check the snapshot is self-consistent. `is_known` tells whether a
    /// service ID belongs to the network.
    pub fn validate(&self, is_known: impl Fn(&ServiceId) -> bool) -> Result<(), TopologyError> {
        let mut owner: BTreeMap<&ServiceId, &PartitionId> = BTreeMap::new();
        for (partition, services) in &self.partition_services {
            for service in services {
                if !is_known(service) {
                    return Err(TopologyError::UnknownService {
                        partition: partition.clone(),
                        service: service.clone(),
                    });
                }
                if let Some(previous) = owner.insert(service, partition) {
                    return Err(TopologyError::DuplicateMembership {
                        service: service.clone(),
                        first: previous.clone(),
                        second: partition.clone(),
                    });
                }
            }
        }

        let declared = |p: &PartitionId| p.is_default() || self.partition_services.contains_key(p);
        for (a, conns) in &self.partition_connections {
            if !declared(a) {
                return Err(TopologyError::UndeclaredPartition(a.clone()));
            }
            for (b, info) in conns {
                if !declared(b) {
                    return Err(TopologyError::UndeclaredPartition(b.clone()));
                }
                if a == b {
                    return Err(TopologyError::SelfConnection(a.clone()));
                }
                if let Some(reverse) = self.connection_entry(b, a) {
                    if reverse != *info {
                        return Err(TopologyError::ConflictingDirections {
                            a: a.clone(),
                            b: b.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// The effective connection between two partitions.
    pub fn connection(&self, a: &PartitionId, b: &PartitionId) -> PartitionConnectionInfo {
        self.connection_entry(a, b)
            .or_else(|| self.connection_entry(b, a))
            .unwrap_or(self.default_connection)
    }

    fn connection_entry(&self, a: &PartitionId, b: &PartitionId) -> Option<PartitionConnectionInfo> {
        self.partition_connections
            .get(a)
            .and_then(|conns| conns.get(b))
            .copied()
    }

    pub fn to_wire(&self) -> RepartitionArgs {
        RepartitionArgs {
            partition_services: self
                .partition_services
                .iter()
                .map(|(partition, services)| {
                    (
                        partition.clone(),
                        PartitionServices {
                            service_id_set: services.clone(),
                        },
                    )
                })
                .collect(),
            partition_connections: self
                .partition_connections
                .iter()
                .map(|(partition, conns)| {
                    (
                        partition.clone(),
                        PartitionConnections {
                            connection_info: conns.clone(),
                        },
                    )
                })
                .collect(),
            default_connection: self.default_connection,
        }
    }
}
