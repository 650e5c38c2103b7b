//! The network context: registry of services in one test network.
//!
//! Every operation takes the registry lock for its full duration, remote
//! calls included, so at most one operation is in flight per context and
//! staged files are never observed half-written by a concurrent start.

use std::any::{type_name, Any};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use testnet_common::protocol::{
    PartitionConnectionInfo, RegisterServiceArgs, RemoveServiceArgs, StartServiceArgs,
};
use testnet_common::{FilesArtifactId, PartitionId, ServiceId};

use crate::availability::AvailabilityChecker;
use crate::config::ClientConfig;
use crate::error::NetworkError;
use crate::gateway::Gateway;
use crate::services::{ContainerConfigFactory, ContainerCreationConfig, Service, ServiceContext};
use crate::staging::{self, GeneratedFile, Stager};
use crate::topology::{PartitionConnectionMap, PartitionServiceMap, Topology};

struct ServiceRecord {
    context: ServiceContext,
    handle: Arc<dyn Service>,
    typed: Arc<dyn Any + Send + Sync>,
    generated_files: BTreeMap<String, GeneratedFile>,
}

#[derive(Default)]
struct Registry {
    services: BTreeMap<ServiceId, ServiceRecord>,
    topology_version: u64,
}

/// A service the engine has registered but the registry doesn't hold yet.
///
/// Until disarmed it owns the cleanup: its staged files are deleted and the
/// service is removed from the engine. Dropping it armed, as happens when
/// the add future is cancelled, does the removal on a spawned task.
struct PendingRegistration {
    gateway: Arc<Gateway>,
    service_id: ServiceId,
    stop_timeout_secs: u64,
    staged: BTreeMap<String, GeneratedFile>,
    armed: bool,
}

impl PendingRegistration {
    fn remove_args(&self) -> RemoveServiceArgs {
        RemoveServiceArgs {
            service_id: self.service_id.clone(),
            container_stop_timeout_seconds: self.stop_timeout_secs,
        }
    }

    fn disarm(mut self) -> BTreeMap<String, GeneratedFile> {
        self.armed = false;
        std::mem::take(&mut self.staged)
    }

    async fn compensate(mut self) {
        staging::discard(&self.staged);
        self.staged.clear();
        remove_partially_added(&self.gateway, &self.remove_args()).await;
        self.armed = false;
    }
}

impl Drop for PendingRegistration {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        staging::discard(&self.staged);
        let args = self.remove_args();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::warn!(service_id = %self.service_id, "add cancelled, removing the registered service");
                let gateway = self.gateway.clone();
                runtime.spawn(async move { remove_partially_added(&gateway, &args).await });
            }
            Err(_) => tracing::warn!(
                service_id = %self.service_id,
                "add cancelled outside a runtime, the registered service is left in the engine"
            ),
        }
    }
}

async fn remove_partially_added(gateway: &Gateway, args: &RemoveServiceArgs) {
    if let Err(e) = gateway.remove_service(args).await {
        tracing::warn!(
            service_id = %args.service_id,
            error = %e,
            "could not remove partially added service"
        );
    }
}

pub struct NetworkContext {
    gateway: Arc<Gateway>,
    stager: Stager,
    files_artifact_urls: BTreeMap<FilesArtifactId, String>,
    compensating_stop_timeout_secs: u64,
    partitioning_enabled: bool,
    registry: Mutex<Registry>,
}

impl NetworkContext {
    pub fn new(
        gateway: Arc<Gateway>,
        stager: Stager,
        files_artifact_urls: BTreeMap<FilesArtifactId, String>,
    ) -> Self {
        Self {
            gateway,
            stager,
            files_artifact_urls,
            compensating_stop_timeout_secs: 0,
            partitioning_enabled: true,
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn from_config(
        config: &ClientConfig,
        gateway: Arc<Gateway>,
        files_artifact_urls: BTreeMap<FilesArtifactId, String>,
    ) -> Self {
        let mut ctx = Self::new(gateway, Stager::from_config(&config.volume), files_artifact_urls);
        ctx.compensating_stop_timeout_secs = config.compensating_stop_timeout_secs;
        ctx
    }

    /// With partitioning disabled every service lives in the default
    /// partition and repartitioning is refused locally.
    pub fn with_partitioning(mut self, enabled: bool) -> Self {
        self.partitioning_enabled = enabled;
        self
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Adds a service to the default partition.
    pub async fn add_service<F: ContainerConfigFactory>(
        &self,
        service_id: impl Into<ServiceId>,
        factory: &F,
    ) -> Result<(Arc<F::Service>, AvailabilityChecker<F::Service>), NetworkError> {
        self.add_service_to_partition(service_id, PartitionId::default_partition(), factory)
            .await
    }

    /// Registers, stages and starts a service, returning its typed handle and
    /// a checker for waiting on its startup.
    ///
    /// If the engine registered the service but a later step fails, the
    /// service is removed again before the error is returned.
    pub async fn add_service_to_partition<F: ContainerConfigFactory>(
        &self,
        service_id: impl Into<ServiceId>,
        partition_id: impl Into<PartitionId>,
        factory: &F,
    ) -> Result<(Arc<F::Service>, AvailabilityChecker<F::Service>), NetworkError> {
        let service_id = service_id.into();
        let partition_id = partition_id.into();
        if !self.partitioning_enabled && !partition_id.is_default() {
            return Err(NetworkError::PartitioningDisabled);
        }
        let mut registry = self.registry.lock().await;

        if registry.services.contains_key(&service_id) {
            return Err(NetworkError::DuplicateService(service_id));
        }

        let creation = factory
            .creation_config()
            .map_err(|source| NetworkError::ConfigFactory {
                service_id: service_id.clone(),
                stage: "creation",
                source,
            })?;

        tracing::info!(service_id = %service_id, partition_id = %partition_id, "adding service");
        let registration = self
            .gateway
            .register_service(&RegisterServiceArgs {
                service_id: service_id.clone(),
                partition_id: partition_id.clone(),
                files_to_generate: creation.files_to_generate(),
            })
            .await
            .map_err(|e| NetworkError::gateway(format!("registering service '{service_id}'"), e))?;
        tracing::debug!(
            service_id = %service_id,
            ip_address = %registration.ip_address,
            "service registered"
        );

        let mut pending = PendingRegistration {
            gateway: self.gateway.clone(),
            service_id: service_id.clone(),
            stop_timeout_secs: self.compensating_stop_timeout_secs,
            staged: BTreeMap::new(),
            armed: true,
        };
        let launched = self
            .launch(
                &service_id,
                &creation,
                registration.ip_address,
                &registration.generated_files_relative_filepaths,
                factory,
                &mut pending,
            )
            .await;

        match launched {
            Ok((context, typed)) => {
                let generated_files = pending.disarm();
                let record = ServiceRecord {
                    context,
                    handle: typed.clone(),
                    typed: typed.clone(),
                    generated_files,
                };
                registry.services.insert(service_id.clone(), record);
                tracing::info!(service_id = %service_id, "service started");
                Ok((typed.clone(), AvailabilityChecker::new(typed)))
            }
            Err(err) => {
                tracing::warn!(service_id = %service_id, error = %err, "service launch failed, removing it");
                pending.compensate().await;
                Err(err)
            }
        }
    }

    /// Steps after registration: stage files, resolve artifacts, start, wrap.
    async fn launch<F: ContainerConfigFactory>(
        &self,
        service_id: &ServiceId,
        creation: &ContainerCreationConfig,
        ip_address: String,
        engine_paths: &BTreeMap<String, String>,
        factory: &F,
        pending: &mut PendingRegistration,
    ) -> Result<(ServiceContext, Arc<F::Service>), NetworkError> {
        pending.staged = self
            .stager
            .stage(
                service_id,
                creation.generated_files(),
                engine_paths,
                creation.test_volume_mountpoint(),
            )
            .map_err(|source| NetworkError::Staging {
                service_id: service_id.clone(),
                source,
            })?;

        let mut artifact_mounts = BTreeMap::new();
        for (artifact_id, mount_dirpath) in creation.files_artifact_mountpoints() {
            let url = self.files_artifact_urls.get(artifact_id).ok_or_else(|| {
                NetworkError::UnknownFilesArtifact {
                    service_id: service_id.clone(),
                    artifact_id: artifact_id.clone(),
                }
            })?;
            artifact_mounts.insert(url.clone(), mount_dirpath.clone());
        }

        let container_paths: BTreeMap<String, PathBuf> = pending
            .staged
            .iter()
            .map(|(id, file)| (id.clone(), file.container_path.clone()))
            .collect();
        let run = factory
            .run_config(&ip_address, &container_paths)
            .map_err(|source| NetworkError::ConfigFactory {
                service_id: service_id.clone(),
                stage: "run",
                source,
            })?;

        self.gateway
            .start_service(&StartServiceArgs {
                service_id: service_id.clone(),
                docker_image: creation.docker_image().to_string(),
                used_ports: creation.used_ports().clone(),
                entrypoint_args: run.entrypoint_override,
                cmd_args: run.cmd_override,
                docker_env_vars: run.env_vars,
                suite_execution_vol_mnt_dirpath: creation
                    .test_volume_mountpoint()
                    .to_string_lossy()
                    .into_owned(),
                files_artifact_mount_dirpaths: artifact_mounts,
            })
            .await
            .map_err(|e| NetworkError::gateway(format!("starting service '{service_id}'"), e))?;

        let context = ServiceContext::new(self.gateway.clone(), service_id.clone(), ip_address);
        let typed = Arc::new(factory.wrap(context.clone()));
        Ok((context, typed))
    }

    pub async fn get_service(&self, service_id: &ServiceId) -> Result<Arc<dyn Service>, NetworkError> {
        let registry = self.registry.lock().await;
        registry
            .services
            .get(service_id)
            .map(|record| record.handle.clone())
            .ok_or_else(|| NetworkError::ServiceNotFound(service_id.clone()))
    }

    /// Looks up a service handle as the concrete type its factory produced.
    pub async fn get_service_as<S: Service>(&self, service_id: &ServiceId) -> Result<Arc<S>, NetworkError> {
        let registry = self.registry.lock().await;
        let record = registry
            .services
            .get(service_id)
            .ok_or_else(|| NetworkError::ServiceNotFound(service_id.clone()))?;
        record
            .typed
            .clone()
            .downcast::<S>()
            .map_err(|_| NetworkError::WrongServiceType {
                service_id: service_id.clone(),
                expected: type_name::<S>(),
            })
    }

    /// The raw engine-side context of a service.
    pub async fn service_context(&self, service_id: &ServiceId) -> Result<ServiceContext, NetworkError> {
        let registry = self.registry.lock().await;
        registry
            .services
            .get(service_id)
            .map(|record| record.context.clone())
            .ok_or_else(|| NetworkError::ServiceNotFound(service_id.clone()))
    }

    /// Files staged for a service when it was added.
    pub async fn generated_files(
        &self,
        service_id: &ServiceId,
    ) -> Result<BTreeMap<String, GeneratedFile>, NetworkError> {
        let registry = self.registry.lock().await;
        registry
            .services
            .get(service_id)
            .map(|record| record.generated_files.clone())
            .ok_or_else(|| NetworkError::ServiceNotFound(service_id.clone()))
    }

    /// Stops and removes a service. The local record is dropped before the
    /// engine is asked, so it stays dropped even if the engine call fails.
    pub async fn remove_service(
        &self,
        service_id: &ServiceId,
        container_stop_timeout_seconds: u64,
    ) -> Result<(), NetworkError> {
        let mut registry = self.registry.lock().await;
        if registry.services.remove(service_id).is_none() {
            return Err(NetworkError::ServiceNotFound(service_id.clone()));
        }

        tracing::info!(service_id = %service_id, "removing service");
        self.gateway
            .remove_service(&RemoveServiceArgs {
                service_id: service_id.clone(),
                container_stop_timeout_seconds,
            })
            .await
            .map_err(|e| NetworkError::gateway(format!("removing service '{service_id}'"), e))
    }

    /// Replaces the whole partition topology of the network.
    ///
    /// Connections between partitions not listed in `partition_connections`
    /// use `default_connection`.
    pub async fn repartition_network(
        &self,
        partition_services: PartitionServiceMap,
        partition_connections: PartitionConnectionMap,
        default_connection: PartitionConnectionInfo,
    ) -> Result<(), NetworkError> {
        if !self.partitioning_enabled {
            return Err(NetworkError::PartitioningDisabled);
        }
        let mut registry = self.registry.lock().await;
        let topology = Topology::new(partition_services, partition_connections, default_connection);
        topology
            .validate(|id| registry.services.contains_key(id))?;

        let version = registry.topology_version + 1;
        tracing::info!(
            version,
            partitions = topology.partition_services.len(),
            "repartitioning network"
        );
        self.gateway
            .repartition(&topology.to_wire())
            .await
            .map_err(|e| NetworkError::gateway("repartitioning network", e))?;
        registry.topology_version = version;
        Ok(())
    }

    pub async fn service_count(&self) -> usize {
        self.registry.lock().await.services.len()
    }

    pub async fn service_ids(&self) -> BTreeSet<ServiceId> {
        self.registry.lock().await.services.keys().cloned().collect()
    }

    /// Number of repartitions the engine has accepted.
    pub async fn topology_version(&self) -> u64 {
        self.registry.lock().await.topology_version
    }
}

impl std::fmt::Debug for NetworkContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkContext")
            .field("stager", &self.stager)
            .field("files_artifact_urls", &self.files_artifact_urls)
            .field("partitioning_enabled", &self.partitioning_enabled)
            .finish_non_exhaustive()
    }
}
