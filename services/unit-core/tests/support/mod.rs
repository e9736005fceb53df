//! Hand-rolled mock collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use convoy_cloudproto::{
    Certificate, CertificateChain, ComponentStatus, DownloadPackage, EntityStatus, ErrorInfo,
    InstanceIdent, InstanceRequest, InstanceSpec, LayerInfo, LayerRunInfo, NetworkParameters,
    NodeInfo, NodeMonitoringData, NodeUnitConfig, ServiceInfo, ServiceRunInfo, UnitConfigStatus,
    UnitStatus,
};
use convoy_unit_core::config::Config;
use convoy_unit_core::downloads::{DownloadError, DownloadHandle, DownloadTarget, Downloader};
use convoy_unit_core::placement::{
    ImageProvider, LayerImage, NetworkProvider, NetworkRequest, NodeManager, NodeProfileProvider,
    PlacementError, RegisteredNode, ServiceImage, StateSetupParams, StorageStateProvider,
};
use convoy_unit_core::status::{CloudSender, StatusError};
use convoy_unit_core::update::{
    ComponentUpdateError, ComponentUpdateRequest, FirmwareUpdater, InstanceRunner, LayerState,
    ServiceState, SoftwareUpdater, UnitConfigUpdater, UpdateError,
};

pub const MAGIC_SUM: &str = "magicSum";

pub fn test_config() -> Config {
    Config {
        working_dir: "/tmp/convoy-test".into(),
        unit_status_send_timeout: Duration::from_millis(100),
        nodes_connection_timeout: Duration::from_secs(1),
        update_ttl: Duration::from_secs(30),
        node_ids: Vec::new(),
        um_clients: Vec::new(),
    }
}

// =============================================================================
// Cloud sender
// =============================================================================

pub struct MockSender {
    status_tx: mpsc::UnboundedSender<UnitStatus>,
    status_rx: Mutex<mpsc::UnboundedReceiver<UnitStatus>>,
}

impl MockSender {
    pub fn new() -> Self {
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        Self {
            status_tx,
            status_rx: Mutex::new(status_rx),
        }
    }

    pub async fn wait_for_status(&self, timeout: Duration) -> Option<UnitStatus> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let received = {
                let mut rx = self.status_rx.lock().unwrap();
                rx.try_recv().ok()
            };

            if received.is_some() {
                return received;
            }

            if tokio::time::Instant::now() >= deadline {
                return None;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until an emitted status satisfies the predicate.
    pub async fn wait_for_matching(
        &self,
        timeout: Duration,
        predicate: impl Fn(&UnitStatus) -> bool,
    ) -> Option<UnitStatus> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }

            if let Some(status) = self.wait_for_status(remaining).await {
                if predicate(&status) {
                    return Some(status);
                }
            } else {
                return None;
            }
        }
    }
}

#[async_trait]
impl CloudSender for MockSender {
    async fn send_unit_status(&self, status: UnitStatus) -> Result<(), StatusError> {
        self.status_tx
            .send(status)
            .map_err(|err| StatusError::Send(err.to_string()))
    }
}

// =============================================================================
// Downloader
// =============================================================================

pub struct MockDownloader {
    pub failures: Mutex<HashMap<String, String>>,
    pub released: Mutex<Vec<DownloadTarget>>,
}

impl MockDownloader {
    pub fn new() -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            released: Mutex::new(Vec::new()),
        }
    }

    pub fn fail(&self, key: &str, message: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(key.to_string(), message.to_string());
    }
}

struct MockHandle {
    file_name: String,
    error: Option<String>,
}

#[async_trait]
impl DownloadHandle for MockHandle {
    fn file_name(&self) -> String {
        self.file_name.clone()
    }

    async fn wait(&mut self) -> Result<(), DownloadError> {
        tokio::time::sleep(Duration::from_millis(2)).await;

        match &self.error {
            Some(message) => Err(DownloadError::Failed(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Downloader for MockDownloader {
    async fn download(
        &self,
        package: DownloadPackage,
        _target: DownloadTarget,
        _cancel: watch::Receiver<bool>,
    ) -> Result<Box<dyn DownloadHandle>, DownloadError> {
        let key = package
            .urls
            .first()
            .and_then(|url| url.rsplit('/').next())
            .unwrap_or_default()
            .to_string();

        Ok(Box::new(MockHandle {
            file_name: format!("/tmp/{key}.dec"),
            error: self.failures.lock().unwrap().get(&key).cloned(),
        }))
    }

    async fn release(&self, _path: &str) -> Result<(), DownloadError> {
        Ok(())
    }

    async fn release_by_type(&self, target: DownloadTarget) -> Result<(), DownloadError> {
        self.released.lock().unwrap().push(target);
        Ok(())
    }
}

// =============================================================================
// Updaters
// =============================================================================

pub struct MockUnitConfigUpdater {
    pub status: Mutex<UnitConfigStatus>,
    pub check_version: Mutex<String>,
    pub error: Mutex<Option<String>>,
}

impl MockUnitConfigUpdater {
    pub fn new(vendor_version: &str) -> Self {
        Self {
            status: Mutex::new(UnitConfigStatus {
                vendor_version: vendor_version.to_string(),
                status: EntityStatus::Installed,
                error_info: None,
            }),
            check_version: Mutex::new(vendor_version.to_string()),
            error: Mutex::new(None),
        }
    }
}

#[async_trait]
impl UnitConfigUpdater for MockUnitConfigUpdater {
    async fn status(&self) -> Result<UnitConfigStatus, UpdateError> {
        Ok(self.status.lock().unwrap().clone())
    }

    async fn check_unit_config(&self, _config: &serde_json::Value) -> Result<String, UpdateError> {
        match self.error.lock().unwrap().clone() {
            Some(message) => Err(UpdateError::Collaborator(message)),
            None => Ok(self.check_version.lock().unwrap().clone()),
        }
    }

    async fn update_unit_config(&self, _config: &serde_json::Value) -> Result<(), UpdateError> {
        match self.error.lock().unwrap().clone() {
            Some(message) => Err(UpdateError::Collaborator(message)),
            None => Ok(()),
        }
    }
}

pub struct MockFirmwareUpdater {
    pub installed: Mutex<Vec<ComponentStatus>>,
    pub update_result: Mutex<Vec<ComponentStatus>>,
    pub update_error: Mutex<Option<String>>,
    pub update_calls: Mutex<u32>,
}

impl MockFirmwareUpdater {
    pub fn new(installed: Vec<ComponentStatus>) -> Self {
        Self {
            installed: Mutex::new(installed),
            update_result: Mutex::new(Vec::new()),
            update_error: Mutex::new(None),
            update_calls: Mutex::new(0),
        }
    }
}

#[async_trait]
impl FirmwareUpdater for MockFirmwareUpdater {
    async fn status(&self) -> Result<Vec<ComponentStatus>, UpdateError> {
        Ok(self.installed.lock().unwrap().clone())
    }

    async fn update_components(
        &self,
        _components: Vec<ComponentUpdateRequest>,
        _chains: Vec<CertificateChain>,
        _certs: Vec<Certificate>,
    ) -> Result<Vec<ComponentStatus>, ComponentUpdateError> {
        *self.update_calls.lock().unwrap() += 1;

        let statuses = self.update_result.lock().unwrap().clone();
        match self.update_error.lock().unwrap().clone() {
            Some(message) => Err(ComponentUpdateError { message, statuses }),
            None => Ok(statuses),
        }
    }
}

pub struct MockSoftwareUpdater {
    pub services: Mutex<Vec<ServiceState>>,
    pub layers: Mutex<Vec<LayerState>>,
    /// Install failures keyed by service id or layer digest.
    pub install_failures: Mutex<HashMap<String, String>>,
}

impl MockSoftwareUpdater {
    pub fn new(services: Vec<ServiceState>, layers: Vec<LayerState>) -> Self {
        Self {
            services: Mutex::new(services),
            layers: Mutex::new(layers),
            install_failures: Mutex::new(HashMap::new()),
        }
    }

    fn failure(&self, key: &str) -> Result<(), UpdateError> {
        match self.install_failures.lock().unwrap().get(key) {
            Some(message) => Err(UpdateError::Collaborator(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SoftwareUpdater for MockSoftwareUpdater {
    async fn services_status(&self) -> Result<Vec<ServiceState>, UpdateError> {
        Ok(self.services.lock().unwrap().clone())
    }

    async fn layers_status(&self) -> Result<Vec<LayerState>, UpdateError> {
        Ok(self.layers.lock().unwrap().clone())
    }

    async fn install_service(
        &self,
        service: &ServiceInfo,
        _file_name: &str,
        _chains: &[CertificateChain],
        _certs: &[Certificate],
    ) -> Result<(), UpdateError> {
        self.failure(&service.id)
    }

    async fn restore_service(&self, _service_id: &str) -> Result<(), UpdateError> {
        Ok(())
    }

    async fn remove_service(&self, _service_id: &str) -> Result<(), UpdateError> {
        Ok(())
    }

    async fn install_layer(
        &self,
        layer: &LayerInfo,
        _file_name: &str,
        _chains: &[CertificateChain],
        _certs: &[Certificate],
    ) -> Result<(), UpdateError> {
        self.failure(&layer.digest)
    }

    async fn restore_layer(&self, _digest: &str) -> Result<(), UpdateError> {
        Ok(())
    }

    async fn remove_layer(&self, _digest: &str) -> Result<(), UpdateError> {
        Ok(())
    }
}

// =============================================================================
// Instance runner
// =============================================================================

pub struct MockInstanceRunner {
    run_tx: mpsc::UnboundedSender<(Vec<InstanceRequest>, Vec<String>)>,
    run_rx: Mutex<mpsc::UnboundedReceiver<(Vec<InstanceRequest>, Vec<String>)>>,
}

impl MockInstanceRunner {
    pub fn new() -> Self {
        let (run_tx, run_rx) = mpsc::unbounded_channel();
        Self {
            run_tx,
            run_rx: Mutex::new(run_rx),
        }
    }

    pub async fn wait_for_run(
        &self,
        timeout: Duration,
    ) -> Option<(Vec<InstanceRequest>, Vec<String>)> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let received = {
                let mut rx = self.run_rx.lock().unwrap();
                rx.try_recv().ok()
            };

            if received.is_some() {
                return received;
            }

            if tokio::time::Instant::now() >= deadline {
                return None;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl InstanceRunner for MockInstanceRunner {
    async fn run_instances(
        &self,
        instances: Vec<InstanceRequest>,
        new_services: Vec<String>,
    ) -> Result<(), UpdateError> {
        let _ = self.run_tx.send((instances, new_services));
        Ok(())
    }

    async fn restart_instances(&self) -> Result<(), UpdateError> {
        Ok(())
    }

    async fn nodes_configuration(&self) -> Vec<NodeInfo> {
        Vec::new()
    }
}

// =============================================================================
// Placement collaborators
// =============================================================================

pub struct MockImageProvider {
    pub services: Mutex<HashMap<String, ServiceImage>>,
    pub layers: Mutex<HashMap<String, LayerImage>>,
    pub reverted: Mutex<Vec<String>>,
}

impl MockImageProvider {
    pub fn new() -> Self {
        Self {
            services: Mutex::new(HashMap::new()),
            layers: Mutex::new(HashMap::new()),
            reverted: Mutex::new(Vec::new()),
        }
    }

    pub fn add_service(&self, service: ServiceImage) {
        self.services
            .lock()
            .unwrap()
            .insert(service.id.clone(), service);
    }
}

#[async_trait]
impl ImageProvider for MockImageProvider {
    async fn service_info(&self, service_id: &str) -> Result<ServiceImage, PlacementError> {
        self.services
            .lock()
            .unwrap()
            .get(service_id)
            .cloned()
            .ok_or_else(|| PlacementError::provider("service doesn't exist"))
    }

    async fn layer_info(&self, digest: &str) -> Result<LayerImage, PlacementError> {
        self.layers
            .lock()
            .unwrap()
            .get(digest)
            .cloned()
            .ok_or_else(|| PlacementError::provider("layer doesn't exist"))
    }

    async fn revert_service(&self, service_id: &str) -> Result<(), PlacementError> {
        self.reverted.lock().unwrap().push(service_id.to_string());
        Ok(())
    }
}

pub struct MockProfiles {
    pub profiles: Mutex<HashMap<String, NodeUnitConfig>>,
}

impl MockProfiles {
    pub fn new() -> Self {
        Self {
            profiles: Mutex::new(HashMap::new()),
        }
    }

    pub fn set(&self, node_type: &str, profile: NodeUnitConfig) {
        self.profiles
            .lock()
            .unwrap()
            .insert(node_type.to_string(), profile);
    }
}

impl NodeProfileProvider for MockProfiles {
    fn node_profile(&self, node_type: &str) -> NodeUnitConfig {
        self.profiles
            .lock()
            .unwrap()
            .get(node_type)
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordedRunRequest {
    pub services: Vec<ServiceRunInfo>,
    pub layers: Vec<LayerRunInfo>,
    pub instances: Vec<InstanceSpec>,
    pub force_restart: bool,
}

pub struct MockNodeManager {
    pub nodes: Mutex<HashMap<String, RegisteredNode>>,
    pub run_requests: Mutex<HashMap<String, RecordedRunRequest>>,
    pub monitoring: Mutex<HashMap<String, NodeMonitoringData>>,
}

impl MockNodeManager {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            run_requests: Mutex::new(HashMap::new()),
            monitoring: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_node(&self, node_id: &str, node_type: &str, remote: bool) {
        self.nodes.lock().unwrap().insert(
            node_id.to_string(),
            RegisteredNode {
                info: NodeInfo {
                    node_id: node_id.to_string(),
                    node_type: node_type.to_string(),
                    total_ram: 1 << 30,
                    num_cpus: 4,
                },
                remote,
                runner_features: vec!["runc".to_string(), "crun".to_string()],
            },
        );
    }

    pub fn run_request(&self, node_id: &str) -> RecordedRunRequest {
        self.run_requests
            .lock()
            .unwrap()
            .get(node_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl NodeManager for MockNodeManager {
    async fn node_configuration(&self, node_id: &str) -> Result<RegisteredNode, PlacementError> {
        self.nodes
            .lock()
            .unwrap()
            .get(node_id)
            .cloned()
            .ok_or_else(|| PlacementError::provider("unknown node"))
    }

    async fn run_instances(
        &self,
        node_id: &str,
        services: &[ServiceRunInfo],
        layers: &[LayerRunInfo],
        instances: &[InstanceSpec],
        force_restart: bool,
    ) -> Result<(), PlacementError> {
        self.run_requests.lock().unwrap().insert(
            node_id.to_string(),
            RecordedRunRequest {
                services: services.to_vec(),
                layers: layers.to_vec(),
                instances: instances.to_vec(),
                force_restart,
            },
        );

        Ok(())
    }

    async fn node_monitoring_data(
        &self,
        node_id: &str,
    ) -> Result<NodeMonitoringData, PlacementError> {
        Ok(self
            .monitoring
            .lock()
            .unwrap()
            .get(node_id)
            .copied()
            .unwrap_or_default())
    }
}

pub struct MockStorageState {
    pub cleaned: Mutex<Vec<InstanceIdent>>,
}

impl MockStorageState {
    pub fn new() -> Self {
        Self {
            cleaned: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl StorageStateProvider for MockStorageState {
    async fn setup(&self, _params: StateSetupParams) -> Result<(String, String), PlacementError> {
        Ok((String::new(), String::new()))
    }

    async fn cleanup(&self, ident: &InstanceIdent) -> Result<(), PlacementError> {
        self.cleaned.lock().unwrap().push(ident.clone());
        Ok(())
    }

    fn instance_checksum(&self, _ident: &InstanceIdent) -> String {
        MAGIC_SUM.to_string()
    }
}

pub struct MockNetwork {
    next_ip: Mutex<u8>,
    pub assigned: Mutex<HashMap<InstanceIdent, String>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self {
            next_ip: Mutex::new(2),
            assigned: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl NetworkProvider for MockNetwork {
    async fn prepare_instance_network(
        &self,
        ident: &InstanceIdent,
        _provider_id: &str,
        _request: NetworkRequest,
    ) -> Result<NetworkParameters, PlacementError> {
        let mut assigned = self.assigned.lock().unwrap();

        let ip = if let Some(ip) = assigned.get(ident) {
            ip.clone()
        } else {
            let mut next = self.next_ip.lock().unwrap();
            let ip = format!("172.17.0.{}", *next);
            *next += 1;
            assigned.insert(ident.clone(), ip.clone());
            ip
        };

        Ok(NetworkParameters {
            ip,
            subnet: "172.17.0.0/16".to_string(),
            dns_servers: vec!["10.10.0.1".to_string()],
            ..Default::default()
        })
    }

    async fn remove_instance_network(&self, ident: &InstanceIdent, _provider_id: &str) {
        self.assigned.lock().unwrap().remove(ident);
    }

    fn network_instances(&self) -> Vec<InstanceIdent> {
        self.assigned.lock().unwrap().keys().cloned().collect()
    }

    async fn update_provider_network(
        &self,
        _providers: &[String],
        _node_id: &str,
    ) -> Result<(), PlacementError> {
        Ok(())
    }

    async fn restart_dns_server(&self) -> Result<(), PlacementError> {
        Ok(())
    }
}

// =============================================================================
// Builders
// =============================================================================

pub fn component(id: &str, version: &str, status: EntityStatus) -> ComponentStatus {
    ComponentStatus {
        id: id.to_string(),
        vendor_version: version.to_string(),
        status,
        error_info: None,
    }
}

pub fn component_error(id: &str, version: &str, message: &str) -> ComponentStatus {
    ComponentStatus {
        id: id.to_string(),
        vendor_version: version.to_string(),
        status: EntityStatus::Error,
        error_info: Some(ErrorInfo::new(message)),
    }
}

pub fn installed_service(id: &str, version: u64, cached: bool) -> ServiceState {
    ServiceState {
        status: convoy_cloudproto::ServiceStatus {
            id: id.to_string(),
            aos_version: version,
            status: EntityStatus::Installed,
            error_info: None,
        },
        cached,
    }
}

pub fn installed_layer(id: &str, digest: &str, version: u64, cached: bool) -> LayerState {
    LayerState {
        status: convoy_cloudproto::LayerStatus {
            id: id.to_string(),
            digest: digest.to_string(),
            aos_version: version,
            status: EntityStatus::Installed,
            error_info: None,
        },
        cached,
    }
}

pub fn desired_component(id: &str, version: &str) -> convoy_cloudproto::ComponentInfo {
    convoy_cloudproto::ComponentInfo {
        id: id.to_string(),
        vendor_version: version.to_string(),
        package: DownloadPackage {
            urls: vec![format!("https://cloud/{id}")],
            sha256: vec![1],
            size: 128,
            ..Default::default()
        },
    }
}

pub fn desired_layer(id: &str, digest: &str, version: u64) -> LayerInfo {
    LayerInfo {
        id: id.to_string(),
        digest: digest.to_string(),
        aos_version: version,
        package: DownloadPackage {
            urls: vec![format!("https://cloud/{digest}")],
            sha256: vec![1],
            size: 128,
            ..Default::default()
        },
    }
}

pub fn desired_service(id: &str, version: u64) -> ServiceInfo {
    ServiceInfo {
        id: id.to_string(),
        aos_version: version,
        package: DownloadPackage {
            urls: vec![format!("https://cloud/{id}")],
            sha256: vec![1],
            size: 128,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Order-insensitive set comparison for status groups.
pub fn same_entries<T: PartialEq + std::fmt::Debug>(actual: &[T], expected: &[T]) -> bool {
    actual.len() == expected.len()
        && expected.iter().all(|entry| actual.contains(entry))
}
