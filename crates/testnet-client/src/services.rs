//! Service handles and the container config factory seam.
//!
//! A test author implements [`ContainerConfigFactory`] once per kind of
//! service. The factory describes the container, initializes the files it
//! asked to have generated, and wraps the raw [`ServiceContext`] into a
//! domain-specific handle implementing [`Service`].

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;

use testnet_common::protocol::ExecCommandArgs;
use testnet_common::{FilesArtifactId, ServiceId};

use crate::gateway::{Gateway, GatewayError};

/// Writes the initial contents of one generated file.
///
/// The writer is buffered; it is flushed and the file closed by the caller
/// once the initializer returns.
pub type FileInitializer = Box<dyn Fn(&mut dyn Write) -> anyhow::Result<()> + Send + Sync>;

/// Capabilities every service handle exposes.
pub trait Service: Send + Sync + 'static {
    fn service_id(&self) -> &ServiceId;

    fn ip_address(&self) -> &str;

    /// Returns true once the service is ready to take traffic.
    fn is_available(&self) -> BoxFuture<'_, bool>;
}

/// A running service container as seen by the engine.
#[derive(Clone)]
pub struct ServiceContext {
    gateway: Arc<Gateway>,
    service_id: ServiceId,
    ip_address: String,
}

impl ServiceContext {
    pub fn new(gateway: Arc<Gateway>, service_id: ServiceId, ip_address: String) -> Self {
        Self {
            gateway,
            service_id,
            ip_address,
        }
    }

    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    pub fn ip_address(&self) -> &str {
        &self.ip_address
    }

    /// Runs a command inside the service's container and returns its exit code.
    pub async fn exec_command(&self, command: Vec<String>) -> Result<i32, GatewayError> {
        tracing::debug!(service_id = %self.service_id, ?command, "executing command in service");
        let args = ExecCommandArgs {
            service_id: self.service_id.clone(),
            command_args: command,
        };
        self.gateway.exec_command(&args).await
    }
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("service_id", &self.service_id)
            .field("ip_address", &self.ip_address)
            .finish()
    }
}

// ── Container configuration ─────────────────────────────────────────

/// Launch parameters known before the engine assigns an IP.
pub struct ContainerCreationConfig {
    docker_image: String,
    test_volume_mountpoint: PathBuf,
    used_ports: BTreeSet<String>,
    files_artifact_mountpoints: BTreeMap<FilesArtifactId, String>,
    generated_files: BTreeMap<String, FileInitializer>,
}

impl ContainerCreationConfig {
    pub fn builder(
        docker_image: impl Into<String>,
        test_volume_mountpoint: impl Into<PathBuf>,
    ) -> ContainerCreationConfigBuilder {
        ContainerCreationConfigBuilder {
            config: ContainerCreationConfig {
                docker_image: docker_image.into(),
                test_volume_mountpoint: test_volume_mountpoint.into(),
                used_ports: BTreeSet::new(),
                files_artifact_mountpoints: BTreeMap::new(),
                generated_files: BTreeMap::new(),
            },
        }
    }

    pub fn docker_image(&self) -> &str {
        &self.docker_image
    }

    /// Where the suite execution volume is mounted inside the container.
    pub fn test_volume_mountpoint(&self) -> &Path {
        &self.test_volume_mountpoint
    }

    pub fn used_ports(&self) -> &BTreeSet<String> {
        &self.used_ports
    }

    pub fn files_artifact_mountpoints(&self) -> &BTreeMap<FilesArtifactId, String> {
        &self.files_artifact_mountpoints
    }

    pub fn generated_files(&self) -> &BTreeMap<String, FileInitializer> {
        &self.generated_files
    }

    pub fn files_to_generate(&self) -> BTreeSet<String> {
        self.generated_files.keys().cloned().collect()
    }
}

pub struct ContainerCreationConfigBuilder {
    config: ContainerCreationConfig,
}

impl ContainerCreationConfigBuilder {
    /// Ports in Docker notation, e.g. `"8080/tcp"`.
    pub fn with_used_ports<I, S>(mut self, ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.used_ports.extend(ports.into_iter().map(Into::into));
        self
    }

    /// Mount the files artifact with the given ID at `mount_dirpath`.
    pub fn with_files_artifact(
        mut self,
        artifact_id: impl Into<FilesArtifactId>,
        mount_dirpath: impl Into<String>,
    ) -> Self {
        self.config
            .files_artifact_mountpoints
            .insert(artifact_id.into(), mount_dirpath.into());
        self
    }

    /// Ask for a file to be generated on the shared volume before start.
    pub fn with_generated_file<F>(mut self, file_id: impl Into<String>, initializer: F) -> Self
    where
        F: Fn(&mut dyn Write) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.config
            .generated_files
            .insert(file_id.into(), Box::new(initializer));
        self
    }

    pub fn build(self) -> ContainerCreationConfig {
        self.config
    }
}

/// Launch parameters that depend on the assigned IP and generated files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerRunConfig {
    pub entrypoint_override: Vec<String>,
    pub cmd_override: Vec<String>,
    pub env_vars: BTreeMap<String, String>,
}

impl ContainerRunConfig {
    pub fn builder() -> ContainerRunConfigBuilder {
        ContainerRunConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct ContainerRunConfigBuilder {
    config: ContainerRunConfig,
}

impl ContainerRunConfigBuilder {
    pub fn with_entrypoint_override<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.entrypoint_override = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cmd_override<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.cmd_override = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.env_vars.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> ContainerRunConfig {
        self.config
    }
}

/// Describes how to launch one kind of service and how to talk to it.
pub trait ContainerConfigFactory: Send + Sync {
    type Service: Service;

    fn creation_config(&self) -> anyhow::Result<ContainerCreationConfig>;

    /// `generated_files` maps each generated file ID to its path inside the
    /// container.
    fn run_config(
        &self,
        ip_address: &str,
        generated_files: &BTreeMap<String, PathBuf>,
    ) -> anyhow::Result<ContainerRunConfig>;

    fn wrap(&self, service_context: ServiceContext) -> Self::Service;
}
