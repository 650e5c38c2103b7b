//! Client side of a testnet: build a network of service containers through
//! the orchestration engine, stage their generated files and reshape the
//! partition topology while a test runs.

pub mod availability;
pub mod config;
pub mod error;
pub mod gateway;
pub mod network;
pub mod services;
pub mod staging;
pub mod test_util;
pub mod topology;

pub use availability::{AvailabilityChecker, AvailabilityError};
pub use config::ClientConfig;
pub use error::{ErrorKind, NetworkError};
pub use gateway::{Gateway, GatewayError, RetryPolicy};
pub use network::NetworkContext;
pub use services::{
    ContainerConfigFactory, ContainerCreationConfig, ContainerRunConfig, FileInitializer, Service,
    ServiceContext,
};
pub use topology::{Topology, TopologyError};

pub use testnet_common::protocol::PartitionConnectionInfo;
pub use testnet_common::{FilesArtifactId, PartitionId, ServiceId};
