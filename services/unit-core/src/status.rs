//! Unit status aggregation and reporting.
//!
//! [`UnitStatusHandler`] is the engine's front door: it accepts desired
//! statuses from the cloud, routes them into the firmware and software
//! state machines, merges every status delta into a shadow of the last
//! reported [`UnitStatus`], and emits coalesced snapshots upstream.
//!
//! Emission rules:
//!
//! - deltas arm a debounce timer (`unit_status_send_timeout`); bursts
//!   coalesce into one send
//! - nothing is emitted while the cloud is disconnected; the full shadow
//!   flushes on reconnect
//! - the very first emission waits for both the inventory collection and
//!   the first run-status report, so the cloud sees one complete snapshot

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use convoy_cloudproto::{
    ComponentStatus, DesiredStatus, EntityStatus, InstanceStatus, LayerStatus, ServiceStatus,
    UnitConfigStatus, UnitStatus,
};

use crate::config::Config;
use crate::downloads::{Downloader, GroupDownloader};
use crate::storage::UpdatePlanStore;
use crate::sync::UpdateSynchronizer;
use crate::update::firmware::{FirmwareDesired, FirmwareManager};
use crate::update::software::{SoftwareDesired, SoftwareManager};
use crate::update::{
    FirmwareUpdater, InstanceRunner, SoftwareUpdater, UnitConfigUpdater, UpdateError, UpdateStatus,
};

/// Errors from status reporting.
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("send error: {0}")]
    Send(String),

    #[error(transparent)]
    Update(#[from] UpdateError),
}

/// Cloud connectivity notifications from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    CloudConnected,
    CloudDisconnected,
}

/// Outbound half of the cloud transport consumed by the aggregator.
#[async_trait]
pub trait CloudSender: Send + Sync {
    async fn send_unit_status(&self, status: UnitStatus) -> Result<(), StatusError>;
}

/// The merged run state of the whole fleet of nodes, as assembled by the
/// instance balancer after a placement pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunInstancesStatus {
    pub unit_subjects: Vec<String>,
    pub instances: Vec<InstanceStatus>,
    /// Services that could not run anywhere, reported as `error` rows.
    pub error_services: Vec<ServiceStatus>,
}

/// Capability handed to the update managers and the balancer for pushing
/// entity-level status deltas into the aggregator.
pub trait StatusListener: Send + Sync {
    fn update_unit_config_status(&self, status: UnitConfigStatus);
    fn update_component_status(&self, status: ComponentStatus);
    fn update_layer_status(&self, status: LayerStatus);
    fn update_service_status(&self, status: ServiceStatus);
    fn set_instance_status(&self, statuses: Vec<InstanceStatus>);
}

/// Shadow of the last reported unit status plus pending deltas.
#[derive(Debug, Default)]
struct Shadow {
    connected: bool,
    /// Inventory collected (initial handshake step one).
    initialized: bool,
    /// First full snapshot emitted.
    initial_sent: bool,
    unit_subjects: Vec<String>,
    unit_config: Vec<UnitConfigStatus>,
    components: Vec<ComponentStatus>,
    layers: Vec<LayerStatus>,
    services: Vec<ServiceStatus>,
    instances: Vec<InstanceStatus>,
}

impl Shadow {
    fn snapshot(&self) -> UnitStatus {
        UnitStatus {
            unit_subjects: self.unit_subjects.clone(),
            unit_config: self.unit_config.clone(),
            components: self.components.clone(),
            layers: self.layers.clone(),
            services: self.services.clone(),
            instances: self.instances.clone(),
        }
    }
}

struct Shared {
    state: std::sync::Mutex<Shadow>,
    sender: Arc<dyn CloudSender>,
    send_timeout: Duration,
    timer: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Serializes sends so emissions keep wall-clock order.
    send_lock: tokio::sync::Mutex<()>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Shadow> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Arm the debounce timer; an already-armed timer keeps its deadline.
    fn schedule_send(self: &Arc<Self>) {
        let mut timer = match self.timer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if timer.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let shared = self.clone();
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(shared.send_timeout).await;
            shared.flush().await;
        }));
    }

    /// Send the current shadow, unless the cloud is disconnected or the
    /// initial handshake snapshot has not gone out yet.
    async fn flush(self: &Arc<Self>) {
        let _guard = self.send_lock.lock().await;

        let snapshot = {
            let state = self.lock();
            if !state.connected {
                debug!("cloud disconnected, unit status not sent");
                return;
            }
            // Deltas arriving mid-handshake stay in the shadow; the first
            // emission must be the one complete snapshot.
            if !state.initial_sent {
                debug!("initial unit status pending, not sent");
                return;
            }
            state.snapshot()
        };

        if let Err(err) = self.sender.send_unit_status(snapshot).await {
            warn!(error = %err, "can't send unit status");
        }
    }

    fn stop_timer(&self) {
        let timer = match self.timer.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(task) = timer {
            task.abort();
        }
    }
}

/// Listener implementation feeding deltas into the shared shadow.
struct StatusRelay {
    shared: Arc<Shared>,
}

impl StatusListener for StatusRelay {
    fn update_unit_config_status(&self, status: UnitConfigStatus) {
        debug!(version = %status.vendor_version, state = %status.status, "unit config status");

        {
            let mut state = self.shared.lock();
            merge_unit_config(&mut state.unit_config, status);
        }
        self.shared.schedule_send();
    }

    fn update_component_status(&self, status: ComponentStatus) {
        debug!(id = %status.id, version = %status.vendor_version, state = %status.status,
            "component status");

        {
            let mut state = self.shared.lock();
            merge_component(&mut state.components, status);
        }
        self.shared.schedule_send();
    }

    fn update_layer_status(&self, status: LayerStatus) {
        debug!(id = %status.id, digest = %status.digest, state = %status.status, "layer status");

        {
            let mut state = self.shared.lock();
            merge_layer(&mut state.layers, status);
        }
        self.shared.schedule_send();
    }

    fn update_service_status(&self, status: ServiceStatus) {
        debug!(id = %status.id, version = status.aos_version, state = %status.status,
            "service status");

        {
            let mut state = self.shared.lock();
            merge_service(&mut state.services, status);
        }
        self.shared.schedule_send();
    }

    fn set_instance_status(&self, statuses: Vec<InstanceStatus>) {
        {
            let mut state = self.shared.lock();
            for status in statuses {
                merge_instance(&mut state.instances, status);
            }
        }
        self.shared.schedule_send();
    }
}

/// The reconciliation engine's status front door.
pub struct UnitStatusHandler {
    shared: Arc<Shared>,
    fm: FirmwareManager,
    sm: SoftwareManager,
    unit_config_updater: Arc<dyn UnitConfigUpdater>,
    firmware_updater: Arc<dyn FirmwareUpdater>,
    software_updater: Arc<dyn SoftwareUpdater>,
    fota_status_rx: std::sync::Mutex<Option<mpsc::Receiver<UpdateStatus>>>,
    sota_status_rx: std::sync::Mutex<Option<mpsc::Receiver<UpdateStatus>>>,
}

impl UnitStatusHandler {
    /// Wire the aggregator and both update state machines.
    pub fn new(
        config: &Config,
        unit_config_updater: Arc<dyn UnitConfigUpdater>,
        firmware_updater: Arc<dyn FirmwareUpdater>,
        software_updater: Arc<dyn SoftwareUpdater>,
        instance_runner: Arc<dyn InstanceRunner>,
        downloader: Arc<dyn Downloader>,
        store: Arc<dyn UpdatePlanStore>,
        sender: Arc<dyn CloudSender>,
    ) -> Result<Self, UpdateError> {
        let shared = Arc::new(Shared {
            state: std::sync::Mutex::new(Shadow::default()),
            sender,
            send_timeout: config.unit_status_send_timeout,
            timer: std::sync::Mutex::new(None),
            send_lock: tokio::sync::Mutex::new(()),
        });

        let listener: Arc<dyn StatusListener> = Arc::new(StatusRelay {
            shared: shared.clone(),
        });

        let group_downloader = Arc::new(GroupDownloader::new(downloader));
        let synchronizer = UpdateSynchronizer::new();

        let (fm, fota_status_rx) = FirmwareManager::new(
            listener.clone(),
            group_downloader.clone(),
            firmware_updater.clone(),
            unit_config_updater.clone(),
            store.clone(),
            instance_runner.clone(),
            synchronizer.clone(),
            config.update_ttl,
        )?;

        let (sm, sota_status_rx) = SoftwareManager::new(
            listener,
            group_downloader,
            software_updater.clone(),
            instance_runner,
            store,
            synchronizer,
            config.update_ttl,
        )?;

        Ok(Self {
            shared,
            fm,
            sm,
            unit_config_updater,
            firmware_updater,
            software_updater,
            fota_status_rx: std::sync::Mutex::new(Some(fota_status_rx)),
            sota_status_rx: std::sync::Mutex::new(Some(sota_status_rx)),
        })
    }

    /// Route a cloud-desired status into the update managers.
    pub async fn process_desired_status(&self, desired: DesiredStatus) {
        info!(
            components = desired.components.len(),
            layers = desired.layers.len(),
            services = desired.services.len(),
            instances = desired.instances.len(),
            unit_config = desired.unit_config.is_some(),
            "process desired status"
        );

        let firmware = FirmwareDesired {
            unit_config: desired.unit_config.clone(),
            components: desired.components.clone(),
            schedule: desired.fota_schedule.clone(),
            cert_chains: desired.certificate_chains.clone(),
            certificates: desired.certificates.clone(),
        };

        if let Err(err) = self.fm.process_desired_status(firmware).await {
            warn!(error = %err, "can't process desired firmware status");
        }

        let software = SoftwareDesired {
            layers: desired.layers,
            services: desired.services,
            instances: desired.instances,
            schedule: desired.sota_schedule,
            cert_chains: desired.certificate_chains,
            certificates: desired.certificates,
        };

        if let Err(err) = self.sm.process_desired_status(software).await {
            warn!(error = %err, "can't process desired software status");
        }
    }

    /// Ingest the merged run status from the instance balancer.
    pub async fn process_run_status(&self, status: RunInstancesStatus) {
        self.sm.process_run_status().await;

        let send_initial = {
            let mut state = self.shared.lock();

            if !status.unit_subjects.is_empty() {
                state.unit_subjects = status.unit_subjects;
            }

            state.instances = status.instances;

            for service in status.error_services {
                merge_service(&mut state.services, service);
            }

            if state.initialized && !state.initial_sent {
                state.initial_sent = true;
                true
            } else {
                false
            }
        };

        if send_initial {
            self.shared.flush().await;
        } else {
            self.shared.schedule_send();
        }
    }

    /// Per-instance run-state deltas reported by nodes between placement
    /// passes.
    pub async fn process_update_instances_status(&self, statuses: Vec<InstanceStatus>) {
        {
            let mut state = self.shared.lock();
            for status in statuses {
                merge_instance(&mut state.instances, status);
            }
        }
        self.shared.schedule_send();
    }

    /// Collect the current inventory from the updater collaborators.
    ///
    /// Before the first emission this primes the initial snapshot, which
    /// is then completed by the first run-status report. Afterwards it
    /// forces an immediate send of the shadow.
    pub async fn send_unit_status(&self) -> Result<(), StatusError> {
        let unit_config = self.unit_config_updater.status().await?;
        let components = self.firmware_updater.status().await?;
        let services = self.software_updater.services_status().await?;
        let layers = self.software_updater.layers_status().await?;

        let flush_now = {
            let mut state = self.shared.lock();

            state.unit_config = vec![unit_config];
            state.components = components;
            // Cached entries belong to the internal inventory only.
            state.services = services
                .into_iter()
                .filter(|service| !service.cached)
                .map(|service| service.status)
                .collect();
            state.layers = layers
                .into_iter()
                .filter(|layer| !layer.cached)
                .map(|layer| layer.status)
                .collect();

            state.initialized = true;
            state.initial_sent
        };

        if flush_now {
            self.shared.flush().await;
        }

        Ok(())
    }

    /// Feed a connectivity change from the transport.
    pub async fn connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::CloudConnected => {
                info!("cloud connected");

                let flush_now = {
                    let mut state = self.shared.lock();
                    state.connected = true;
                    state.initial_sent
                };

                if flush_now {
                    self.shared.flush().await;
                }
            }
            ConnectionEvent::CloudDisconnected => {
                info!("cloud disconnected");
                self.shared.lock().connected = false;
            }
        }
    }

    /// External trigger for a pending firmware update.
    pub async fn start_fota_update(&self) -> Result<(), UpdateError> {
        self.fm.start_update().await
    }

    /// External trigger for a pending software update.
    pub async fn start_sota_update(&self) -> Result<(), UpdateError> {
        self.sm.start_update().await
    }

    /// Current firmware update phase.
    pub fn fota_status(&self) -> UpdateStatus {
        self.fm.current_status()
    }

    /// Current software update phase.
    pub fn sota_status(&self) -> UpdateStatus {
        self.sm.current_status()
    }

    /// Take the firmware phase-notification channel. Single consumer.
    pub fn take_fota_status_channel(&self) -> Option<mpsc::Receiver<UpdateStatus>> {
        match self.fota_status_rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Take the software phase-notification channel. Single consumer.
    pub fn take_sota_status_channel(&self) -> Option<mpsc::Receiver<UpdateStatus>> {
        match self.sota_status_rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Stop both state machines and the debounce timer.
    pub async fn close(&self) {
        self.fm.close().await;
        self.sm.close().await;
        self.shared.stop_timer();
    }
}

// Merge rules: entries are keyed by entity identity. An `installed` or
// `removed` row supersedes prior installed/removed rows of the same id
// (the old version left the inventory); error and transient rows coexist
// with them so failures stay visible.

fn merge_unit_config(list: &mut Vec<UnitConfigStatus>, status: UnitConfigStatus) {
    if let Some(existing) = list
        .iter_mut()
        .find(|entry| entry.vendor_version == status.vendor_version)
    {
        *existing = status;
        return;
    }

    list.push(status);
}

fn supersedes(status: EntityStatus) -> bool {
    matches!(status, EntityStatus::Installed | EntityStatus::Removed)
}

fn merge_component(list: &mut Vec<ComponentStatus>, status: ComponentStatus) {
    if supersedes(status.status) {
        list.retain(|entry| {
            !(entry.id == status.id
                && entry.vendor_version != status.vendor_version
                && supersedes(entry.status))
        });
    }

    if let Some(existing) = list
        .iter_mut()
        .find(|entry| entry.id == status.id && entry.vendor_version == status.vendor_version)
    {
        *existing = status;
        return;
    }

    list.push(status);
}

fn merge_layer(list: &mut Vec<LayerStatus>, status: LayerStatus) {
    if supersedes(status.status) {
        list.retain(|entry| {
            !(entry.id == status.id && entry.digest != status.digest && supersedes(entry.status))
        });
    }

    if let Some(existing) = list
        .iter_mut()
        .find(|entry| entry.id == status.id && entry.digest == status.digest)
    {
        *existing = status;
        return;
    }

    list.push(status);
}

fn merge_service(list: &mut Vec<ServiceStatus>, status: ServiceStatus) {
    if supersedes(status.status) {
        list.retain(|entry| {
            !(entry.id == status.id
                && entry.aos_version != status.aos_version
                && supersedes(entry.status))
        });
    }

    if let Some(existing) = list
        .iter_mut()
        .find(|entry| entry.id == status.id && entry.aos_version == status.aos_version)
    {
        *existing = status;
        return;
    }

    list.push(status);
}

fn merge_instance(list: &mut Vec<InstanceStatus>, status: InstanceStatus) {
    if let Some(existing) = list.iter_mut().find(|entry| entry.ident == status.ident) {
        *existing = status;
        return;
    }

    list.push(status);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use convoy_cloudproto::{ErrorInfo, InstanceIdent, InstanceRunState};

    /// Listener that drops every delta; for state-machine tests that only
    /// observe the phase channel.
    pub(crate) struct NullListener;

    impl StatusListener for NullListener {
        fn update_unit_config_status(&self, _status: UnitConfigStatus) {}
        fn update_component_status(&self, _status: ComponentStatus) {}
        fn update_layer_status(&self, _status: LayerStatus) {}
        fn update_service_status(&self, _status: ServiceStatus) {}
        fn set_instance_status(&self, _statuses: Vec<InstanceStatus>) {}
    }

    fn component(id: &str, version: &str, status: EntityStatus) -> ComponentStatus {
        ComponentStatus {
            id: id.to_string(),
            vendor_version: version.to_string(),
            status,
            error_info: (status == EntityStatus::Error).then(|| ErrorInfo::new("some error")),
        }
    }

    fn service(id: &str, version: u64, status: EntityStatus) -> ServiceStatus {
        ServiceStatus {
            id: id.to_string(),
            aos_version: version,
            status,
            error_info: (status == EntityStatus::Error).then(|| ErrorInfo::new("some error")),
        }
    }

    #[test]
    fn installed_component_supersedes_prior_version() {
        let mut list = vec![component("comp0", "1.0", EntityStatus::Installed)];

        merge_component(&mut list, component("comp0", "2.0", EntityStatus::Installed));

        assert_eq!(list.len(), 1);
        assert_eq!(list[0].vendor_version, "2.0");
    }

    #[test]
    fn error_component_coexists_with_installed() {
        let mut list = vec![component("comp1", "1.0", EntityStatus::Installed)];

        merge_component(&mut list, component("comp1", "2.0", EntityStatus::Error));

        assert_eq!(list.len(), 2);
        assert!(list
            .iter()
            .any(|c| c.vendor_version == "1.0" && c.status == EntityStatus::Installed));
        assert!(list
            .iter()
            .any(|c| c.vendor_version == "2.0" && c.status == EntityStatus::Error));
    }

    #[test]
    fn same_key_replaces_in_place() {
        let mut list = vec![service("svc", 1, EntityStatus::Installing)];

        merge_service(&mut list, service("svc", 1, EntityStatus::Installed));

        assert_eq!(list.len(), 1);
        assert_eq!(list[0].status, EntityStatus::Installed);
    }

    #[test]
    fn removed_service_replaces_installed_row() {
        let mut list = vec![service("svc", 1, EntityStatus::Installed)];

        merge_service(&mut list, service("svc", 1, EntityStatus::Removed));

        assert_eq!(list.len(), 1);
        assert_eq!(list[0].status, EntityStatus::Removed);
    }

    #[test]
    fn instance_replaces_by_ident() {
        let ident = InstanceIdent {
            service_id: "svc".to_string(),
            subject_id: "subj".to_string(),
            instance: 0,
        };

        let mut list = vec![InstanceStatus {
            ident: ident.clone(),
            aos_version: 1,
            run_state: InstanceRunState::Active,
            node_id: Some("node1".to_string()),
            state_checksum: None,
            error_info: None,
        }];

        merge_instance(
            &mut list,
            InstanceStatus {
                ident: ident.clone(),
                aos_version: 1,
                run_state: InstanceRunState::Failed,
                node_id: Some("node1".to_string()),
                state_checksum: None,
                error_info: Some(ErrorInfo::new("someError")),
            },
        );

        assert_eq!(list.len(), 1);
        assert_eq!(list[0].run_state, InstanceRunState::Failed);
    }
}
