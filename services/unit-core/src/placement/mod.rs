//! Instance placement and balancing.
//!
//! The balancer owns the runtime picture of every service-manager node:
//! its scheduling priority, labels, resources, and devices with their
//! shared-count accounting. A placement pass deterministically assigns the
//! desired instances to nodes; run requests fan out per node, and the
//! merged run status is emitted once every node replied or the connection
//! timer expired.
//!
//! Device accounting: a device with `shared_count == 0` is present on the
//! node but outside allocation accounting. It satisfies the presence
//! filter and its allocation and release are no-ops, so the
//! `allocated <= shared_count` invariant holds per device at all times.

mod uidpool;

pub use uidpool::{UidPool, UidPoolError};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use convoy_cloudproto::{
    AlertParameter, ErrorInfo, InstanceIdent, InstanceRequest, InstanceRunState, InstanceSpec,
    InstanceStatus, LayerRunInfo, NodeInfo, NodeMonitoringData, NodeUnitConfig, ServiceConfig,
    ServiceDevice, ServiceRunInfo, ServiceStatus, SystemQuotaAlert,
};

use crate::config::Config;
use crate::status::RunInstancesStatus;
use crate::storage::{InstanceRecord, InstanceStore, StoreError};
use crate::update::{InstanceRunner, UpdateError};

const DEFAULT_RUNNER: &str = "crun";
const DEFAULT_RUNNER_FEATURES: &[&str] = &["crun", "runc"];

/// Placement and balancing errors. The per-instance variants become the
/// human-readable failure reasons reported upstream.
#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("no node with runner [{0}]")]
    NoRunner(String),

    #[error("no node with labels {0:?}")]
    NoLabels(Vec<String>),

    #[error("no node with resources {0:?}")]
    NoResources(Vec<String>),

    #[error("no devices for instance")]
    NoDevices,

    #[error("no available device found")]
    DeviceUnavailable,

    #[error("service deleted")]
    ServiceDeleted,

    #[error("{0}")]
    Provider(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Uid(#[from] UidPoolError),
}

impl PlacementError {
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider(message.into())
    }
}

/// A service image as known to the image manager.
#[derive(Debug, Clone, Default)]
pub struct ServiceImage {
    pub id: String,
    pub aos_version: u64,
    pub gid: u32,
    pub url: String,
    pub remote_url: String,
    pub provider_id: String,
    /// Digests of the layers the service depends on.
    pub layers: Vec<String>,
    pub exposed_ports: Vec<String>,
    pub config: ServiceConfig,
    pub cached: bool,
}

/// A layer image as known to the image manager.
#[derive(Debug, Clone, Default)]
pub struct LayerImage {
    pub id: String,
    pub digest: String,
    pub aos_version: u64,
    pub url: String,
    pub remote_url: String,
}

/// Provides installed image information and service rollback.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    async fn service_info(&self, service_id: &str) -> Result<ServiceImage, PlacementError>;
    async fn layer_info(&self, digest: &str) -> Result<LayerImage, PlacementError>;
    async fn revert_service(&self, service_id: &str) -> Result<(), PlacementError>;
}

/// Per-node-type scheduling profile from the unit configuration.
pub trait NodeProfileProvider: Send + Sync {
    fn node_profile(&self, node_type: &str) -> NodeUnitConfig;
}

/// Static registration data for a node.
#[derive(Debug, Clone, Default)]
pub struct RegisteredNode {
    pub info: NodeInfo,
    pub remote: bool,
    pub runner_features: Vec<String>,
}

/// The service-manager fleet, addressed per node.
#[async_trait]
pub trait NodeManager: Send + Sync {
    async fn node_configuration(&self, node_id: &str) -> Result<RegisteredNode, PlacementError>;

    async fn run_instances(
        &self,
        node_id: &str,
        services: &[ServiceRunInfo],
        layers: &[LayerRunInfo],
        instances: &[InstanceSpec],
        force_restart: bool,
    ) -> Result<(), PlacementError>;

    async fn node_monitoring_data(
        &self,
        node_id: &str,
    ) -> Result<NodeMonitoringData, PlacementError>;
}

/// Parameters for provisioning an instance's storage and state dirs.
#[derive(Debug, Clone)]
pub struct StateSetupParams {
    pub ident: InstanceIdent,
    pub uid: u32,
    pub gid: u32,
    pub state_quota: Option<u64>,
    pub storage_quota: Option<u64>,
}

/// Provisions and cleans per-instance storage and state directories.
#[async_trait]
pub trait StorageStateProvider: Send + Sync {
    /// Returns `(storage_path, state_path)`.
    async fn setup(&self, params: StateSetupParams) -> Result<(String, String), PlacementError>;

    async fn cleanup(&self, ident: &InstanceIdent) -> Result<(), PlacementError>;

    fn instance_checksum(&self, ident: &InstanceIdent) -> String;
}

/// Network parameter request for one instance.
#[derive(Debug, Clone, Default)]
pub struct NetworkRequest {
    pub hosts: Vec<String>,
    pub expose_ports: Vec<String>,
    pub allow_connections: Vec<String>,
}

/// Allocates instance network parameters and maintains provider networks.
#[async_trait]
pub trait NetworkProvider: Send + Sync {
    async fn prepare_instance_network(
        &self,
        ident: &InstanceIdent,
        provider_id: &str,
        request: NetworkRequest,
    ) -> Result<convoy_cloudproto::NetworkParameters, PlacementError>;

    async fn remove_instance_network(&self, ident: &InstanceIdent, provider_id: &str);

    fn network_instances(&self) -> Vec<InstanceIdent>;

    async fn update_provider_network(
        &self,
        providers: &[String],
        node_id: &str,
    ) -> Result<(), PlacementError>;

    async fn restart_dns_server(&self) -> Result<(), PlacementError>;
}

/// Run status reported by one node's service manager.
#[derive(Debug, Clone, Default)]
pub struct NodeRunStatus {
    pub node_id: String,
    pub node_type: String,
    pub instances: Vec<InstanceStatus>,
}

/// Balancer configuration.
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    pub node_ids: Vec<String>,
    pub nodes_connection_timeout: Duration,
}

impl From<&Config> for BalancerConfig {
    fn from(config: &Config) -> Self {
        Self {
            node_ids: config.node_ids.clone(),
            nodes_connection_timeout: config.nodes_connection_timeout,
        }
    }
}

#[derive(Debug, Clone)]
struct NodeDevice {
    name: String,
    shared_count: u64,
    allocated: u64,
}

#[derive(Debug, Clone, Default)]
struct RunRequest {
    services: Vec<ServiceRunInfo>,
    layers: Vec<LayerRunInfo>,
    instances: Vec<InstanceSpec>,
}

struct NodeState {
    info: NodeInfo,
    remote: bool,
    runner_features: Vec<String>,
    priority: u32,
    labels: Vec<String>,
    resources: Vec<String>,
    devices: Vec<NodeDevice>,
    received_run_instances: Vec<InstanceStatus>,
    run_request: RunRequest,
    wait_status: bool,
}

impl NodeState {
    fn apply_profile(&mut self, profile: &NodeUnitConfig) {
        self.priority = profile.priority;
        self.labels = profile.labels.clone();
        self.resources = profile.resources.clone();
        self.devices = profile
            .devices
            .iter()
            .map(|device| NodeDevice {
                name: device.name.clone(),
                shared_count: device.shared_count,
                allocated: 0,
            })
            .collect();
    }
}

struct BalancerState {
    nodes: Vec<NodeState>,
    desired: Vec<InstanceRequest>,
    current_run_status: Vec<InstanceStatus>,
    current_error_status: Vec<InstanceStatus>,
    pending_new_services: Vec<String>,
    uid_pool: UidPool,
}

struct BalancerInner {
    config: BalancerConfig,
    store: Arc<dyn InstanceStore>,
    node_manager: Arc<dyn NodeManager>,
    image_provider: Arc<dyn ImageProvider>,
    profiles: Arc<dyn NodeProfileProvider>,
    storage_state: Arc<dyn StorageStateProvider>,
    network: Arc<dyn NetworkProvider>,
    state: tokio::sync::Mutex<BalancerState>,
    run_status_tx: mpsc::Sender<RunInstancesStatus>,
    timer: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    timer_epoch: AtomicU64,
}

/// Decides which node runs which instance; owns device accounting and
/// rebalancing. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct InstanceBalancer {
    inner: Arc<BalancerInner>,
}

impl InstanceBalancer {
    /// Create the balancer, reloading persisted UIDs and the last desired
    /// instance list. The connection timer starts immediately so a fleet
    /// that never reports still produces a (timeout) run status.
    pub fn new(
        config: BalancerConfig,
        store: Arc<dyn InstanceStore>,
        node_manager: Arc<dyn NodeManager>,
        image_provider: Arc<dyn ImageProvider>,
        profiles: Arc<dyn NodeProfileProvider>,
        storage_state: Arc<dyn StorageStateProvider>,
        network: Arc<dyn NetworkProvider>,
    ) -> Result<(Self, mpsc::Receiver<RunInstancesStatus>), PlacementError> {
        let mut uid_pool = UidPool::new();

        for record in store.instances()? {
            if let Err(err) = uid_pool.add(record.uid) {
                error!(uid = record.uid, error = %err, "can't add UID to pool");
            }
        }

        let desired = match store.desired_instances() {
            Ok(desired) => desired,
            Err(err) => {
                error!(error = %err, "can't get desired instances");
                Vec::new()
            }
        };

        let (run_status_tx, run_status_rx) = mpsc::channel(10);

        let balancer = Self {
            inner: Arc::new(BalancerInner {
                config,
                store,
                node_manager,
                image_provider,
                profiles,
                storage_state,
                network,
                state: tokio::sync::Mutex::new(BalancerState {
                    nodes: Vec::new(),
                    desired,
                    current_run_status: Vec::new(),
                    current_error_status: Vec::new(),
                    pending_new_services: Vec::new(),
                    uid_pool,
                }),
                run_status_tx,
                timer: std::sync::Mutex::new(None),
                timer_epoch: AtomicU64::new(0),
            }),
        };

        balancer.reset_connection_timer();

        Ok((balancer, run_status_rx))
    }

    /// Spawn the event loop consuming node run-status reports and system
    /// quota alerts.
    pub fn spawn(
        &self,
        mut run_status_rx: mpsc::Receiver<NodeRunStatus>,
        mut alert_rx: mpsc::Receiver<SystemQuotaAlert>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let balancer = self.clone();

        tokio::spawn(async move {
            let mut alerts_open = true;

            loop {
                tokio::select! {
                    biased;

                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    status = run_status_rx.recv() => match status {
                        Some(status) => balancer.process_node_run_status(status).await,
                        None => break,
                    },
                    alert = alert_rx.recv(), if alerts_open => match alert {
                        Some(alert) => balancer.perform_rebalancing(alert).await,
                        None => alerts_open = false,
                    },
                }
            }

            balancer.stop_connection_timer();
            debug!("instance balancer stopped");
        })
    }

    /// Node registry as seen right now.
    pub async fn registered_nodes(&self) -> Vec<NodeInfo> {
        let state = self.inner.state.lock().await;
        state.nodes.iter().map(|node| node.info.clone()).collect()
    }

    /// Ingest a run-status report from one node.
    async fn process_node_run_status(&self, status: NodeRunStatus) {
        debug!(node_id = %status.node_id, "received node run status");

        let mut state = self.inner.state.lock().await;

        if !state
            .nodes
            .iter()
            .any(|node| node.info.node_id == status.node_id)
        {
            if !self.inner.config.node_ids.contains(&status.node_id) {
                error!(node_id = %status.node_id, "received status for unknown node");
                return;
            }

            let registered = match self.inner.node_manager.node_configuration(&status.node_id).await
            {
                Ok(registered) => registered,
                Err(err) => {
                    error!(node_id = %status.node_id, error = %err, "can't init node");
                    return;
                }
            };

            let profile = self.inner.profiles.node_profile(&status.node_type);

            let mut node = NodeState {
                info: registered.info,
                remote: registered.remote,
                runner_features: registered.runner_features,
                priority: 0,
                labels: Vec::new(),
                resources: Vec::new(),
                devices: Vec::new(),
                received_run_instances: Vec::new(),
                run_request: RunRequest::default(),
                wait_status: false,
            };
            node.apply_profile(&profile);

            state.nodes.push(node);

            if state.nodes.len() == self.inner.config.node_ids.len() {
                debug!("all nodes connected");
            }

            sort_nodes(&mut state.nodes);
        }

        if let Some(node) = state
            .nodes
            .iter_mut()
            .find(|node| node.info.node_id == status.node_id)
        {
            node.received_run_instances = status.instances;
            node.wait_status = false;
        }

        if state.nodes.len() != self.inner.config.node_ids.len() {
            return;
        }

        if state.nodes.iter().any(|node| node.wait_status) {
            return;
        }

        info!("all node statuses received");

        self.stop_connection_timer();
        self.send_current_status(&mut state).await;
    }

    /// Assemble and emit the merged run status. Nodes still waiting get
    /// synthetic failures; a node can't take both paths in one pass since
    /// the waiting flag is cleared as the synthetic entries are written.
    async fn send_current_status(&self, state: &mut BalancerState) {
        let mut run_status = RunInstancesStatus::default();

        for node in &mut state.nodes {
            if node.wait_status {
                node.wait_status = false;

                for spec in &node.run_request.instances {
                    run_status.instances.push(InstanceStatus {
                        ident: spec.ident.clone(),
                        aos_version: 0,
                        run_state: InstanceRunState::Failed,
                        node_id: Some(node.info.node_id.clone()),
                        state_checksum: None,
                        error_info: Some(ErrorInfo::new("wait run status timeout")),
                    });
                }
            } else {
                run_status
                    .instances
                    .extend(node.received_run_instances.iter().cloned());
            }
        }

        let mut error_instances: Vec<InstanceIdent> = Vec::new();

        for instance in &mut run_status.instances {
            if instance.error_info.is_some() {
                error_instances.push(instance.ident.clone());
                continue;
            }

            let checksum = self.inner.storage_state.instance_checksum(&instance.ident);
            if !checksum.is_empty() {
                instance.state_checksum = Some(checksum);
            }
        }

        // A new service with no healthy instance anywhere is rolled back
        // and reported as an error service.
        'new_services: for service_id in std::mem::take(&mut state.pending_new_services) {
            for instance in &run_status.instances {
                if instance.ident.service_id == service_id && instance.error_info.is_none() {
                    continue 'new_services;
                }
            }

            let mut error_service = ServiceStatus {
                id: service_id.clone(),
                aos_version: 0,
                status: convoy_cloudproto::EntityStatus::Error,
                error_info: Some(ErrorInfo::new("can't run any instances")),
            };

            match self.inner.image_provider.service_info(&service_id).await {
                Ok(service) => error_service.aos_version = service.aos_version,
                Err(err) => error_service.error_info = Some(ErrorInfo::new(err.to_string())),
            }

            run_status.error_services.push(error_service);

            if let Err(err) = self.inner.image_provider.revert_service(&service_id).await {
                error!(service_id = %service_id, error = %err, "can't revert service");
            }
        }

        self.process_stopped_instances(state, &run_status.instances, error_instances)
            .await;

        run_status
            .instances
            .extend(state.current_error_status.iter().cloned());

        state.current_run_status = run_status.instances.clone();
        state.current_error_status = Vec::new();

        if self.inner.run_status_tx.send(run_status).await.is_err() {
            warn!("run status receiver dropped");
        }
    }

    /// State-storage cleanup for instances that stopped or started failing
    /// since the previous pass.
    async fn process_stopped_instances(
        &self,
        state: &BalancerState,
        new_status: &[InstanceStatus],
        mut stopped: Vec<InstanceIdent>,
    ) {
        'current: for current in &state.current_run_status {
            for new in new_status {
                if current.ident != new.ident {
                    continue;
                }

                if new.error_info.is_some() && current.error_info.is_none() {
                    stopped.push(current.ident.clone());
                }

                continue 'current;
            }

            if current.error_info.is_none() {
                stopped.push(current.ident.clone());
            }
        }

        for ident in stopped {
            if let Err(err) = self.inner.storage_state.cleanup(&ident).await {
                error!(ident = %ident, error = %err, "can't cleanup state storage for instance");
            }
        }
    }

    /// One-shot migration pass triggered by a node resource quota alert.
    pub async fn perform_rebalancing(&self, alert: SystemQuotaAlert) {
        debug!(node_id = %alert.node_id, parameter = ?alert.parameter, "perform rebalancing");

        let mut state = self.inner.state.lock().await;

        let Some(issue_priority) = state
            .nodes
            .iter()
            .find(|node| node.info.node_id == alert.node_id)
            .map(|node| node.priority)
        else {
            warn!(node_id = %alert.node_id, "quota alert for unknown node");
            return;
        };

        let candidate_ids: Vec<String> = state
            .nodes
            .iter()
            .filter(|node| {
                node.priority <= issue_priority && node.info.node_id != alert.node_id
            })
            .map(|node| node.info.node_id.clone())
            .collect();

        if candidate_ids.is_empty() {
            error!("no nodes with less priority for rebalancing");
            return;
        }

        // Re-derive the baseline assignment before deciding what to move.
        let desired = state.desired.clone();
        let errors = self.perform_placement(&mut state, desired).await;
        state.current_error_status = errors;

        let Some(issue_idx) = state
            .nodes
            .iter()
            .position(|node| node.info.node_id == alert.node_id)
        else {
            return;
        };

        for i in (0..state.nodes[issue_idx].run_request.instances.len()).rev() {
            let spec = state.nodes[issue_idx].run_request.instances[i].clone();

            let service = match self
                .inner
                .image_provider
                .service_info(&spec.ident.service_id)
                .await
            {
                Ok(service) => service,
                Err(err) => {
                    error!(error = %err, "can't get service info");
                    continue;
                }
            };

            let labels = state
                .desired
                .iter()
                .find(|request| {
                    request.service_id == spec.ident.service_id
                        && request.subject_id == spec.ident.subject_id
                })
                .map(|request| request.labels.clone())
                .unwrap_or_default();

            let candidate_indices: Vec<usize> = state
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, node)| candidate_ids.contains(&node.info.node_id))
                .map(|(idx, _)| idx)
                .collect();

            let candidates =
                match filter_static(&state.nodes, candidate_indices, &service, &labels) {
                    Ok(candidates) => candidates,
                    Err(_) => continue,
                };

            let candidates: Vec<usize> = candidates
                .into_iter()
                .filter(|&idx| node_has_devices(&state.nodes[idx], &service.config.devices))
                .collect();

            if candidates.is_empty() {
                continue;
            }

            let ordered = self
                .order_by_free_resource(&state.nodes, candidates, alert.parameter)
                .await;

            let Some(&target_idx) = ordered.first() else {
                continue;
            };

            if let Err(err) =
                allocate_devices(&mut state.nodes[target_idx], &service.config.devices)
            {
                debug!(error = %err, "can't allocate devices on rebalance target");
                continue;
            }

            let layers = match self.layers_for_service(&service).await {
                Ok(layers) => layers,
                Err(err) => {
                    error!(error = %err, "can't get layer info");
                    release_devices(&mut state.nodes[target_idx], &service.config.devices);
                    continue;
                }
            };

            add_run_request(&mut state.nodes[target_idx], &service, &layers, spec.clone());

            release_devices(&mut state.nodes[issue_idx], &service.config.devices);
            state.nodes[issue_idx].run_request.instances.remove(i);

            info!(
                ident = %spec.ident,
                from = %alert.node_id,
                to = %state.nodes[target_idx].info.node_id,
                "instance migrated"
            );

            self.reset_connection_timer();

            if let Err(err) = self.send_run_requests(&mut state, false).await {
                error!(error = %err, "can't send run instances while rebalancing");
            }

            return;
        }

        error!("can't perform rebalancing");
    }

    /// Deterministic placement of the desired instances across nodes.
    async fn perform_placement(
        &self,
        state: &mut BalancerState,
        mut instances: Vec<InstanceRequest>,
    ) -> Vec<InstanceStatus> {
        let mut errors: Vec<InstanceStatus> = Vec::new();

        for node in &mut state.nodes {
            node.run_request = RunRequest::default();
            for device in &mut node.devices {
                device.allocated = 0;
            }
        }

        instances.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.service_id.cmp(&b.service_id))
        });

        self.remove_stale_instances(state, &instances);
        self.remove_stale_networks(&instances).await;

        for request in &instances {
            debug!(
                service_id = %request.service_id,
                subject_id = %request.subject_id,
                num_instances = request.num_instances,
                priority = request.priority,
                "balance instances"
            );

            let service = match self.inner.image_provider.service_info(&request.service_id).await
            {
                Ok(service) => service,
                Err(err) => {
                    warn!(service_id = %request.service_id, error = %err, "can't get service info");
                    errors.push(failed_instance(request, 0, 0, err.to_string()));
                    continue;
                }
            };

            if service.cached {
                warn!(service_id = %request.service_id, "can't start instances: service deleted");
                errors.push(failed_instance(
                    request,
                    0,
                    0,
                    PlacementError::ServiceDeleted.to_string(),
                ));
                continue;
            }

            let layers = match self.layers_for_service(&service).await {
                Ok(layers) => layers,
                Err(err) => {
                    for index in 0..request.num_instances {
                        errors.push(failed_instance(
                            request,
                            index,
                            service.aos_version,
                            err.to_string(),
                        ));
                    }
                    continue;
                }
            };

            let all_indices: Vec<usize> = (0..state.nodes.len()).collect();
            let static_candidates =
                match filter_static(&state.nodes, all_indices, &service, &request.labels) {
                    Ok(candidates) => candidates,
                    Err(err) => {
                        for index in 0..request.num_instances {
                            errors.push(failed_instance(
                                request,
                                index,
                                service.aos_version,
                                err.to_string(),
                            ));
                        }
                        continue;
                    }
                };

            for index in 0..request.num_instances {
                let with_devices: Vec<usize> = static_candidates
                    .iter()
                    .copied()
                    .filter(|&idx| node_has_devices(&state.nodes[idx], &service.config.devices))
                    .collect();

                if with_devices.is_empty() {
                    errors.push(failed_instance(
                        request,
                        index,
                        service.aos_version,
                        PlacementError::NoDevices.to_string(),
                    ));
                    continue;
                }

                // Prefer the freest node (by RAM outside rebalancing), then
                // the highest priority; ties fall back to node id order.
                let ordered = self
                    .order_by_free_resource(&state.nodes, with_devices, AlertParameter::Ram)
                    .await;
                let target_idx = most_priority_node(&state.nodes, &ordered);

                let spec = match self.prepare_instance_spec(state, &service, request, index).await
                {
                    Ok(spec) => spec,
                    Err(err) => {
                        errors.push(failed_instance(
                            request,
                            index,
                            service.aos_version,
                            err.to_string(),
                        ));
                        continue;
                    }
                };

                if let Err(err) =
                    allocate_devices(&mut state.nodes[target_idx], &service.config.devices)
                {
                    errors.push(failed_instance(
                        request,
                        index,
                        service.aos_version,
                        err.to_string(),
                    ));
                    continue;
                }

                add_run_request(&mut state.nodes[target_idx], &service, &layers, spec);
            }
        }

        // Instances exposing ports get their addresses first so published
        // endpoints stay stable across passes.
        let network_errors = self.prepare_network_for_instances(state, true).await;
        errors.extend(network_errors);

        let network_errors = self.prepare_network_for_instances(state, false).await;
        errors.extend(network_errors);

        errors
    }

    async fn prepare_network_for_instances(
        &self,
        state: &mut BalancerState,
        only_exposed_ports: bool,
    ) -> Vec<InstanceStatus> {
        let mut errors = Vec::new();

        for node in &mut state.nodes {
            for spec in &mut node.run_request.instances {
                if !spec.network_parameters.ip.is_empty() {
                    continue;
                }

                let service = match self
                    .inner
                    .image_provider
                    .service_info(&spec.ident.service_id)
                    .await
                {
                    Ok(service) => service,
                    Err(err) => {
                        warn!(service_id = %spec.ident.service_id, error = %err,
                            "can't get service info");
                        errors.push(InstanceStatus {
                            ident: spec.ident.clone(),
                            aos_version: 0,
                            run_state: InstanceRunState::Failed,
                            node_id: None,
                            state_checksum: None,
                            error_info: Some(ErrorInfo::new(err.to_string())),
                        });
                        continue;
                    }
                };

                if only_exposed_ports && service.exposed_ports.is_empty() {
                    continue;
                }

                let request = NetworkRequest {
                    hosts: service.config.hostname.clone().into_iter().collect(),
                    expose_ports: service.exposed_ports.clone(),
                    allow_connections: service.config.allowed_connections.clone(),
                };

                match self
                    .inner
                    .network
                    .prepare_instance_network(&spec.ident, &service.provider_id, request)
                    .await
                {
                    Ok(parameters) => spec.network_parameters = parameters,
                    Err(err) => {
                        warn!(ident = %spec.ident, error = %err, "can't prepare network");
                        errors.push(InstanceStatus {
                            ident: spec.ident.clone(),
                            aos_version: service.aos_version,
                            run_state: InstanceRunState::Failed,
                            node_id: None,
                            state_checksum: None,
                            error_info: Some(ErrorInfo::new(err.to_string())),
                        });
                    }
                }
            }
        }

        errors
    }

    /// Drop persisted instances no longer covered by the desired list,
    /// releasing their UIDs.
    fn remove_stale_instances(&self, state: &mut BalancerState, instances: &[InstanceRequest]) {
        let records = match self.inner.store.instances() {
            Ok(records) => records,
            Err(err) => {
                error!(error = %err, "can't get instances from storage");
                return;
            }
        };

        for record in records {
            if instances.iter().any(|request| request.covers(&record.ident)) {
                continue;
            }

            debug!(ident = %record.ident, "remove instance");

            if let Err(err) = state.uid_pool.release(record.uid) {
                error!(ident = %record.ident, error = %err, "can't remove instance UID");
            }

            if let Err(err) = self.inner.store.remove_instance(&record.ident) {
                error!(ident = %record.ident, error = %err, "can't remove instance from storage");
            }
        }
    }

    /// Release network parameters of instances no longer desired.
    async fn remove_stale_networks(&self, instances: &[InstanceRequest]) {
        'network: for ident in self.inner.network.network_instances() {
            for request in instances {
                if request.covers(&ident) {
                    continue 'network;
                }
            }

            let provider_id = match self.inner.image_provider.service_info(&ident.service_id).await
            {
                Ok(service) => service.provider_id,
                Err(err) => {
                    warn!(service_id = %ident.service_id, error = %err, "can't get service info");
                    continue;
                }
            };

            self.inner
                .network
                .remove_instance_network(&ident, &provider_id)
                .await;
        }
    }

    async fn prepare_instance_spec(
        &self,
        state: &mut BalancerState,
        service: &ServiceImage,
        request: &InstanceRequest,
        index: u64,
    ) -> Result<InstanceSpec, PlacementError> {
        let ident = InstanceIdent {
            service_id: request.service_id.clone(),
            subject_id: request.subject_id.clone(),
            instance: index,
        };

        let uid = match self.inner.store.instance_uid(&ident)? {
            Some(uid) => uid,
            None => {
                let uid = state.uid_pool.acquire()?;

                if let Err(err) = self.inner.store.add_instance(InstanceRecord {
                    ident: ident.clone(),
                    uid,
                }) {
                    error!(error = %err, "can't store instance UID");
                }

                uid
            }
        };

        let params = StateSetupParams {
            ident: ident.clone(),
            uid,
            gid: service.gid,
            state_quota: service.config.quotas.state_limit,
            storage_quota: service.config.quotas.storage_limit,
        };

        let (storage_path, state_path) = match self.inner.storage_state.setup(params).await {
            Ok(paths) => paths,
            Err(err) => {
                let _ = state.uid_pool.release(uid);
                return Err(err);
            }
        };

        Ok(InstanceSpec {
            ident,
            uid,
            priority: request.priority,
            storage_path,
            state_path,
            network_parameters: Default::default(),
        })
    }

    async fn layers_for_service(
        &self,
        service: &ServiceImage,
    ) -> Result<Vec<LayerImage>, PlacementError> {
        let mut layers = Vec::with_capacity(service.layers.len());

        for digest in &service.layers {
            layers.push(self.inner.image_provider.layer_info(digest).await?);
        }

        Ok(layers)
    }

    /// Candidate ordering by free resource on the given axis; stable, so
    /// equal readings keep the (priority desc, node id asc) registry order.
    async fn order_by_free_resource(
        &self,
        nodes: &[NodeState],
        indices: Vec<usize>,
        parameter: AlertParameter,
    ) -> Vec<usize> {
        if indices.len() <= 1 {
            return indices;
        }

        let mut scored = Vec::with_capacity(indices.len());

        for idx in indices {
            let node = &nodes[idx];

            let data = match self
                .inner
                .node_manager
                .node_monitoring_data(&node.info.node_id)
                .await
            {
                Ok(data) => data,
                Err(err) => {
                    warn!(node_id = %node.info.node_id, error = %err,
                        "can't get node monitoring data");
                    NodeMonitoringData::default()
                }
            };

            let free_ram = node.info.total_ram.saturating_sub(data.ram);
            let free_cpu = (node.info.num_cpus * 100).saturating_sub(data.cpu);

            scored.push((idx, free_ram, free_cpu));
        }

        match parameter {
            AlertParameter::Cpu => scored.sort_by(|a, b| b.2.cmp(&a.2)),
            AlertParameter::Ram => scored.sort_by(|a, b| b.1.cmp(&a.1)),
        }

        scored.into_iter().map(|(idx, _, _)| idx).collect()
    }

    async fn send_run_requests(
        &self,
        state: &mut BalancerState,
        force_restart: bool,
    ) -> Result<(), UpdateError> {
        let mut first_error: Option<PlacementError> = None;

        for node in &mut state.nodes {
            node.wait_status = true;

            if let Err(err) = self
                .inner
                .node_manager
                .run_instances(
                    &node.info.node_id,
                    &node.run_request.services,
                    &node.run_request.layers,
                    &node.run_request.instances,
                    force_restart,
                )
                .await
            {
                error!(node_id = %node.info.node_id, error = %err, "can't run instances");

                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(UpdateError::collaborator(err.to_string())),
            None => Ok(()),
        }
    }

    fn reset_connection_timer(&self) {
        let epoch = self.inner.timer_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = self.inner.clone();
        let balancer = self.clone();
        let timeout = self.inner.config.nodes_connection_timeout;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            if inner.timer_epoch.load(Ordering::SeqCst) != epoch {
                return;
            }

            let mut state = inner.state.lock().await;

            // Revalidate after taking the lock: a run-status pass may have
            // completed while this task was waiting.
            if inner.timer_epoch.load(Ordering::SeqCst) != epoch {
                return;
            }

            warn!("nodes connection timeout");
            balancer.send_current_status(&mut state).await;
        });

        let mut slot = match self.inner.timer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    fn stop_connection_timer(&self) {
        self.inner.timer_epoch.fetch_add(1, Ordering::SeqCst);

        let handle = match self.inner.timer.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(handle) = handle {
            handle.abort();
        }
    }

    async fn update_networks(
        &self,
        instances: &[InstanceRequest],
        state: &BalancerState,
    ) -> Result<(), PlacementError> {
        let mut providers = Vec::with_capacity(instances.len());

        for request in instances {
            let service = self.inner.image_provider.service_info(&request.service_id).await?;
            providers.push(service.provider_id);
        }

        for node in &state.nodes {
            self.inner
                .network
                .update_provider_network(&providers, &node.info.node_id)
                .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl InstanceRunner for InstanceBalancer {
    async fn run_instances(
        &self,
        instances: Vec<InstanceRequest>,
        new_services: Vec<String>,
    ) -> Result<(), UpdateError> {
        debug!("run instances");

        let mut state = self.inner.state.lock().await;

        self.reset_connection_timer();

        if let Err(err) = self.inner.store.set_desired_instances(&instances) {
            error!(error = %err, "can't store desired instances");
        }

        if let Err(err) = self.update_networks(&instances, &state).await {
            error!(error = %err, "can't update networks");
        }

        state.desired = instances.clone();
        state.pending_new_services = new_services;

        let errors = self.perform_placement(&mut state, instances).await;
        state.current_error_status = errors;

        if let Err(err) = self.inner.network.restart_dns_server().await {
            error!(error = %err, "can't restart DNS server");
        }

        self.send_run_requests(&mut state, false).await
    }

    async fn restart_instances(&self) -> Result<(), UpdateError> {
        debug!("restart instances");

        let mut state = self.inner.state.lock().await;

        self.reset_connection_timer();

        // Re-read node profiles: a unit config update may have changed
        // priorities, labels, or device counts.
        for node in &mut state.nodes {
            let profile = self.inner.profiles.node_profile(&node.info.node_type);
            node.apply_profile(&profile);
        }
        sort_nodes(&mut state.nodes);

        let desired = state.desired.clone();
        let errors = self.perform_placement(&mut state, desired).await;
        state.current_error_status = errors;

        self.send_run_requests(&mut state, true).await
    }

    async fn nodes_configuration(&self) -> Vec<NodeInfo> {
        self.registered_nodes().await
    }
}

fn sort_nodes(nodes: &mut [NodeState]) {
    nodes.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.info.node_id.cmp(&b.info.node_id))
    });
}

fn failed_instance(
    request: &InstanceRequest,
    index: u64,
    aos_version: u64,
    message: String,
) -> InstanceStatus {
    warn!(
        service_id = %request.service_id,
        subject_id = %request.subject_id,
        instance = index,
        error = %message,
        "can't schedule instance"
    );

    InstanceStatus {
        ident: InstanceIdent {
            service_id: request.service_id.clone(),
            subject_id: request.subject_id.clone(),
            instance: index,
        },
        aos_version,
        run_state: InstanceRunState::Failed,
        node_id: None,
        state_checksum: None,
        error_info: Some(ErrorInfo::new(message)),
    }
}

fn filter_static(
    nodes: &[NodeState],
    indices: Vec<usize>,
    service: &ServiceImage,
    labels: &[String],
) -> Result<Vec<usize>, PlacementError> {
    let runner = if service.config.runner.is_empty() {
        DEFAULT_RUNNER
    } else {
        &service.config.runner
    };

    let by_runner: Vec<usize> = indices
        .into_iter()
        .filter(|&idx| {
            let node = &nodes[idx];
            if node.runner_features.is_empty() {
                DEFAULT_RUNNER_FEATURES.contains(&runner)
            } else {
                node.runner_features.iter().any(|feature| feature == runner)
            }
        })
        .collect();

    if by_runner.is_empty() {
        return Err(PlacementError::NoRunner(runner.to_string()));
    }

    let by_labels: Vec<usize> = if labels.is_empty() {
        by_runner
    } else {
        by_runner
            .into_iter()
            .filter(|&idx| {
                let node = &nodes[idx];
                !node.labels.is_empty()
                    && labels.iter().all(|label| node.labels.contains(label))
            })
            .collect()
    };

    if by_labels.is_empty() {
        return Err(PlacementError::NoLabels(labels.to_vec()));
    }

    let required_resources = &service.config.resources;
    let by_resources: Vec<usize> = if required_resources.is_empty() {
        by_labels
    } else {
        by_labels
            .into_iter()
            .filter(|&idx| {
                let node = &nodes[idx];
                !node.resources.is_empty()
                    && required_resources
                        .iter()
                        .all(|resource| node.resources.contains(resource))
            })
            .collect()
    };

    if by_resources.is_empty() {
        return Err(PlacementError::NoResources(required_resources.clone()));
    }

    Ok(by_resources)
}

/// Presence filter: every required device must exist on the node and be
/// either uncounted (`shared_count == 0`) or not fully allocated.
fn node_has_devices(node: &NodeState, required: &[ServiceDevice]) -> bool {
    'devices: for requirement in required {
        for device in &node.devices {
            if device.name != requirement.name {
                continue;
            }

            if device.shared_count == 0 || device.allocated < device.shared_count {
                continue 'devices;
            }
        }

        return false;
    }

    true
}

fn allocate_devices(node: &mut NodeState, required: &[ServiceDevice]) -> Result<(), PlacementError> {
    'devices: for requirement in required {
        for device in &mut node.devices {
            if device.name != requirement.name {
                continue;
            }

            if device.shared_count == 0 {
                // Present but uncounted.
                continue 'devices;
            }

            if device.allocated >= device.shared_count {
                return Err(PlacementError::DeviceUnavailable);
            }

            device.allocated += 1;
            continue 'devices;
        }

        return Err(PlacementError::DeviceUnavailable);
    }

    Ok(())
}

fn release_devices(node: &mut NodeState, required: &[ServiceDevice]) {
    'devices: for requirement in required {
        for device in &mut node.devices {
            if device.name != requirement.name {
                continue;
            }

            if device.shared_count != 0 && device.allocated > 0 {
                device.allocated -= 1;
            }

            continue 'devices;
        }
    }
}

/// Pick the highest-priority node out of an ordered candidate list; the
/// first occurrence wins on ties, preserving the incoming order.
fn most_priority_node(nodes: &[NodeState], ordered: &[usize]) -> usize {
    let mut best = ordered[0];

    for &idx in &ordered[1..] {
        if nodes[idx].priority > nodes[best].priority {
            best = idx;
        }
    }

    best
}

fn add_run_request(
    node: &mut NodeState,
    service: &ServiceImage,
    layers: &[LayerImage],
    spec: InstanceSpec,
) {
    debug!(ident = %spec.ident, node_id = %node.info.node_id, "schedule instance on node");

    node.run_request.instances.push(spec);

    let service_url = if node.remote {
        service.remote_url.clone()
    } else {
        service.url.clone()
    };

    if !node
        .run_request
        .services
        .iter()
        .any(|existing| existing.id == service.id)
    {
        node.run_request.services.push(ServiceRunInfo {
            id: service.id.clone(),
            aos_version: service.aos_version,
            url: service_url,
            gid: service.gid,
        });
    }

    for layer in layers {
        if node
            .run_request
            .layers
            .iter()
            .any(|existing| existing.digest == layer.digest)
        {
            continue;
        }

        node.run_request.layers.push(LayerRunInfo {
            id: layer.id.clone(),
            digest: layer.digest.clone(),
            aos_version: layer.aos_version,
            url: if node.remote {
                layer.remote_url.clone()
            } else {
                layer.url.clone()
            },
        });
    }
}
