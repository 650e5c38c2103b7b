//! Shared types for testnet.
//!
//! This crate contains:
//! - **Identifiers**: `ServiceId`, `PartitionId`, `FilesArtifactId` and request IDs
//! - **Protocol messages**: request/reply envelopes and the payload of every engine call

pub mod ids;
pub mod protocol;

pub use ids::{FilesArtifactId, PartitionId, ServiceId};
