//! RPC protocol between the test client and the orchestration engine.
//!
//! Every call is one request envelope answered by exactly one reply
//! envelope carrying the same `id`. The reply type is either
//! [`RESULT_TYPE`] (payload = the method's result) or [`ERROR_TYPE`]
//! (payload = [`RpcErrorPayload`]).
//!
//! Payload maps and sets are ordered so identical arguments always encode
//! to identical bytes.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{self, PartitionId, ServiceId};

/// Reply type for a successfully executed call.
pub const RESULT_TYPE: &str = "rpc.result";
/// Reply type for a call the engine rejected.
pub const ERROR_TYPE: &str = "rpc.error";

/// Method names understood by the engine.
pub mod methods {
    pub const REGISTER_TEST_EXECUTION: &str = "engine.register_test_execution";
    pub const REGISTER_SERVICE: &str = "service.register";
    pub const START_SERVICE: &str = "service.start";
    pub const REMOVE_SERVICE: &str = "service.remove";
    pub const EXEC_COMMAND: &str = "service.exec";
    pub const REPARTITION: &str = "network.repartition";
}

// ── Envelope ────────────────────────────────────────────────────────

/// The outer envelope for all engine messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Request ID; replies echo the ID of the request they answer.
    pub id: String,
    /// Method name on requests, [`RESULT_TYPE`] / [`ERROR_TYPE`] on replies.
    #[serde(rename = "type")]
    pub msg_type: String,
    pub ts: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Create a request envelope with a fresh request ID.
    pub fn request(method: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: ids::request_id(),
            msg_type: method.into(),
            ts: Utc::now(),
            payload,
        }
    }

    /// Create a reply to the request with the given ID.
    pub fn reply(request_id: impl Into<String>, msg_type: &str, payload: serde_json::Value) -> Self {
        Self {
            id: request_id.into(),
            msg_type: msg_type.to_string(),
            ts: Utc::now(),
            payload,
        }
    }

    /// Parse the payload into a concrete type.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorPayload {
    pub message: String,
}

// ── Test execution ──────────────────────────────────────────────────

/// Arms a hard timeout on the engine side, independent of the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterTestExecutionArgs {
    pub test_timeout_seconds: u64,
}

// ── Services ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterServiceArgs {
    pub service_id: ServiceId,
    pub partition_id: PartitionId,
    pub files_to_generate: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterServiceResponse {
    pub ip_address: String,
    /// File ID -> path relative to the suite execution volume root.
    #[serde(default)]
    pub generated_files_relative_filepaths: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartServiceArgs {
    pub service_id: ServiceId,
    pub docker_image: String,
    pub used_ports: BTreeSet<String>,
    pub entrypoint_args: Vec<String>,
    pub cmd_args: Vec<String>,
    pub docker_env_vars: BTreeMap<String, String>,
    pub suite_execution_vol_mnt_dirpath: String,
    /// Files artifact URL -> mount dirpath inside the container.
    pub files_artifact_mount_dirpaths: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveServiceArgs {
    pub service_id: ServiceId,
    pub container_stop_timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecCommandArgs {
    pub service_id: ServiceId,
    pub command_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecCommandResponse {
    pub exit_code: i32,
}

// ── Partitioning ────────────────────────────────────────────────────

/// Whether traffic between two partitions is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PartitionConnectionInfo {
    pub is_blocked: bool,
}

impl PartitionConnectionInfo {
    pub fn blocked() -> Self {
        Self { is_blocked: true }
    }

    pub fn unblocked() -> Self {
        Self { is_blocked: false }
    }
}

/// Encoded as the bare set of service IDs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionServices {
    pub service_id_set: BTreeSet<ServiceId>,
}

/// Encoded as the bare map of peer partition to connection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionConnections {
    pub connection_info: BTreeMap<PartitionId, PartitionConnectionInfo>,
}

/// A complete topology. Each repartition replaces the previous one wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepartitionArgs {
    pub partition_services: BTreeMap<PartitionId, PartitionServices>,
    pub partition_connections: BTreeMap<PartitionId, PartitionConnections>,
    pub default_connection: PartitionConnectionInfo,
}
