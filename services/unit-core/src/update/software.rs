//! Software (SOTA) update state machine.
//!
//! Converges layers, services, and the desired instance list. The diff
//! against the installed inventory yields three action sets per entity
//! kind:
//!
//! - install: desired version not present (download required)
//! - restore: desired version present but cached (no download)
//! - remove: installed version no longer desired
//!
//! Unlike firmware, downloads continue on error: independent items install
//! even when siblings fail, and the failed ones surface as per-entity
//! `error` rows while the prior installed version stays reported.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use convoy_cloudproto::{
    Certificate, CertificateChain, DownloadPackage, EntityStatus, ErrorInfo, InstanceRequest,
    LayerInfo, LayerStatus, ScheduleRule, ServiceInfo, ServiceStatus, UpdateType,
};

use crate::downloads::{
    first_download_error, is_cancel_error, DownloadNotifier, DownloadResult, DownloadTarget,
    GroupDownloader,
};
use crate::status::StatusListener;
use crate::storage::UpdatePlanStore;
use crate::sync::UpdateSynchronizer;
use crate::update::{
    schedule_ttl, wait_timetable_window, GateOutcome, InstanceRunner, SoftwareUpdater, UpdateError,
    UpdateState, UpdateStatus, PLAN_FORMAT_VERSION,
};

/// The software-relevant slice of a desired status.
#[derive(Debug, Clone, Default)]
pub struct SoftwareDesired {
    pub layers: Vec<LayerInfo>,
    pub services: Vec<ServiceInfo>,
    pub instances: Vec<InstanceRequest>,
    pub schedule: ScheduleRule,
    pub cert_chains: Vec<CertificateChain>,
    pub certificates: Vec<Certificate>,
}

/// Persisted SOTA plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SoftwarePlan {
    version: u32,
    current_state: UpdateState,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_update: Option<SoftwareUpdate>,
    #[serde(default)]
    download_result: HashMap<String, DownloadResult>,
    /// Keyed by layer digest.
    #[serde(default)]
    layer_statuses: HashMap<String, LayerStatus>,
    /// Keyed by service id.
    #[serde(default)]
    service_statuses: HashMap<String, ServiceStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SoftwareUpdate {
    #[serde(default)]
    schedule: ScheduleRule,
    #[serde(default)]
    install_layers: Vec<LayerInfo>,
    #[serde(default)]
    remove_layers: Vec<LayerStatus>,
    #[serde(default)]
    restore_layers: Vec<LayerStatus>,
    #[serde(default)]
    install_services: Vec<ServiceInfo>,
    #[serde(default)]
    remove_services: Vec<ServiceStatus>,
    #[serde(default)]
    restore_services: Vec<ServiceStatus>,
    #[serde(default)]
    run_instances: Vec<InstanceRequest>,
    #[serde(default)]
    cert_chains: Vec<CertificateChain>,
    #[serde(default)]
    certificates: Vec<Certificate>,
}

impl SoftwareUpdate {
    fn has_inventory_work(&self) -> bool {
        !(self.install_layers.is_empty()
            && self.remove_layers.is_empty()
            && self.restore_layers.is_empty()
            && self.install_services.is_empty()
            && self.remove_services.is_empty()
            && self.restore_services.is_empty())
    }
}

enum Command {
    Desired(SoftwareDesired, oneshot::Sender<Result<(), UpdateError>>),
    StartUpdate,
    RunStatusReceived,
    Close(oneshot::Sender<()>),
}

/// Handle to the software update state machine.
pub(crate) struct SoftwareManager {
    cmd_tx: mpsc::Sender<Command>,
    current: Arc<std::sync::Mutex<UpdateStatus>>,
    task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SoftwareManager {
    pub fn new(
        listener: Arc<dyn StatusListener>,
        downloader: Arc<GroupDownloader>,
        updater: Arc<dyn SoftwareUpdater>,
        runner: Arc<dyn InstanceRunner>,
        store: Arc<dyn UpdatePlanStore>,
        synchronizer: UpdateSynchronizer,
        default_ttl: Duration,
    ) -> Result<(Self, mpsc::Receiver<UpdateStatus>), UpdateError> {
        let plan = match store.software_state()? {
            Some(raw) => match serde_json::from_value::<SoftwarePlan>(raw) {
                Ok(plan) => plan,
                Err(err) => {
                    warn!(error = %err, "can't parse persisted software state, starting clean");
                    SoftwarePlan::default()
                }
            },
            None => SoftwarePlan::default(),
        };

        info!(state = %plan.current_state, "software manager created");

        let current = Arc::new(std::sync::Mutex::new(UpdateStatus::new(plan.current_state)));
        let (status_tx, status_rx) = mpsc::channel(16);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let task = SmTask {
            listener,
            downloader,
            updater,
            runner,
            store,
            synchronizer,
            default_ttl,
            plan,
            status_tx,
            current: current.clone(),
            pending: None,
            ready_since: None,
            last_run_instances: None,
        };

        let handle = tokio::spawn(task.run(cmd_rx));

        Ok((
            Self {
                cmd_tx,
                current,
                task: std::sync::Mutex::new(Some(handle)),
            },
            status_rx,
        ))
    }

    pub async fn process_desired_status(&self, desired: SoftwareDesired) -> Result<(), UpdateError> {
        let (ack_tx, ack_rx) = oneshot::channel();

        self.cmd_tx
            .send(Command::Desired(desired, ack_tx))
            .await
            .map_err(|_| UpdateError::Closed)?;

        ack_rx.await.map_err(|_| UpdateError::Closed)?
    }

    pub async fn start_update(&self) -> Result<(), UpdateError> {
        self.cmd_tx
            .send(Command::StartUpdate)
            .await
            .map_err(|_| UpdateError::Closed)
    }

    /// Notify the machine that a run-status report arrived; completes an
    /// update waiting on its instance run.
    pub async fn process_run_status(&self) {
        let _ = self.cmd_tx.send(Command::RunStatusReceived).await;
    }

    pub fn current_status(&self) -> UpdateStatus {
        match self.current.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();

        if self.cmd_tx.send(Command::Close(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }

        let handle = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

enum Flow {
    Continue,
    Shutdown(Option<oneshot::Sender<()>>),
}

struct SmTask {
    listener: Arc<dyn StatusListener>,
    downloader: Arc<GroupDownloader>,
    updater: Arc<dyn SoftwareUpdater>,
    runner: Arc<dyn InstanceRunner>,
    store: Arc<dyn UpdatePlanStore>,
    synchronizer: UpdateSynchronizer,
    default_ttl: Duration,
    plan: SoftwarePlan,
    status_tx: mpsc::Sender<UpdateStatus>,
    current: Arc<std::sync::Mutex<UpdateStatus>>,
    pending: Option<SoftwareDesired>,
    ready_since: Option<Instant>,
    /// Instance list of the last dispatched run, used to skip no-op runs.
    last_run_instances: Option<Vec<InstanceRequest>>,
}

impl SmTask {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        if self.plan.current_state == UpdateState::ReadyToUpdate {
            self.ready_since = Some(Instant::now());
        }

        loop {
            let flow = match self.plan.current_state {
                UpdateState::NoUpdate => self.idle(&mut cmd_rx).await,
                UpdateState::Downloading => self.downloading(&mut cmd_rx).await,
                UpdateState::ReadyToUpdate => self.ready(&mut cmd_rx).await,
                UpdateState::Updating => self.updating(&mut cmd_rx).await,
            };

            match flow {
                Flow::Continue => {}
                Flow::Shutdown(ack) => {
                    self.downloader.release_software().await;

                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }

                    debug!("software manager stopped");
                    return;
                }
            }
        }
    }

    async fn idle(&mut self, cmd_rx: &mut mpsc::Receiver<Command>) -> Flow {
        if let Some(desired) = self.pending.take() {
            self.start_new_update(desired).await;
            return Flow::Continue;
        }

        match cmd_rx.recv().await {
            Some(Command::Desired(desired, ack)) => {
                let result = self.start_new_update(desired).await;
                let _ = ack.send(result);
                Flow::Continue
            }
            Some(Command::StartUpdate) | Some(Command::RunStatusReceived) => Flow::Continue,
            Some(Command::Close(ack)) => Flow::Shutdown(Some(ack)),
            None => Flow::Shutdown(None),
        }
    }

    /// Diff desired services/layers against the inventory and enter
    /// `downloading` when there is anything to converge.
    async fn start_new_update(&mut self, desired: SoftwareDesired) -> Result<(), UpdateError> {
        let update = self.build_update(&desired).await?;

        let instances_changed = self
            .last_run_instances
            .as_ref()
            .is_none_or(|last| *last != desired.instances);

        if !update.has_inventory_work() && !instances_changed {
            debug!("no software update required");
            return Ok(());
        }

        info!(
            install_services = update.install_services.len(),
            remove_services = update.remove_services.len(),
            restore_services = update.restore_services.len(),
            install_layers = update.install_layers.len(),
            remove_layers = update.remove_layers.len(),
            restore_layers = update.restore_layers.len(),
            "start software update"
        );

        self.plan = SoftwarePlan {
            version: PLAN_FORMAT_VERSION,
            current_state: UpdateState::Downloading,
            current_update: Some(update),
            ..Default::default()
        };
        self.persist();
        self.emit(UpdateStatus::new(UpdateState::Downloading)).await;

        Ok(())
    }

    async fn build_update(&self, desired: &SoftwareDesired) -> Result<SoftwareUpdate, UpdateError> {
        let services = self.updater.services_status().await?;
        let layers = self.updater.layers_status().await?;

        let mut update = SoftwareUpdate {
            schedule: desired.schedule.clone(),
            run_instances: desired.instances.clone(),
            cert_chains: desired.cert_chains.clone(),
            certificates: desired.certificates.clone(),
            ..Default::default()
        };

        for target in &desired.services {
            let existing = services.iter().find(|state| {
                state.status.id == target.id
                    && state.status.aos_version == target.aos_version
                    && state.status.status == EntityStatus::Installed
            });

            match existing {
                Some(state) if state.cached => update.restore_services.push(state.status.clone()),
                Some(_) => {}
                None => update.install_services.push(target.clone()),
            }
        }

        for state in &services {
            if state.status.status == EntityStatus::Installed
                && !state.cached
                && !desired.services.iter().any(|d| d.id == state.status.id)
            {
                update.remove_services.push(state.status.clone());
            }
        }

        for target in &desired.layers {
            let existing = layers.iter().find(|state| {
                state.status.digest == target.digest
                    && state.status.status == EntityStatus::Installed
            });

            match existing {
                Some(state) if state.cached => update.restore_layers.push(state.status.clone()),
                Some(_) => {}
                None => update.install_layers.push(target.clone()),
            }
        }

        for state in &layers {
            if state.status.status == EntityStatus::Installed
                && !state.cached
                && !desired.layers.iter().any(|d| d.digest == state.status.digest)
            {
                update.remove_layers.push(state.status.clone());
            }
        }

        Ok(update)
    }

    async fn downloading(&mut self, cmd_rx: &mut mpsc::Receiver<Command>) -> Flow {
        let update = self.plan.current_update.clone().unwrap_or_default();

        // Download keys: digest for layers, id for services.
        let mut request: HashMap<String, DownloadPackage> = HashMap::new();
        for layer in &update.install_layers {
            request.insert(layer.digest.clone(), layer.package.clone());
        }
        for service in &update.install_services {
            request.insert(service.id.clone(), service.package.clone());
        }

        if request.is_empty() {
            self.plan.current_state = UpdateState::ReadyToUpdate;
            self.ready_since = Some(Instant::now());
            self.persist();
            self.emit(UpdateStatus::new(UpdateState::ReadyToUpdate)).await;
            return Flow::Continue;
        }

        let notifier = software_notifier(self.listener.clone(), &update);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        // Keep `self` unborrowed while the download future is pinned.
        let downloader = self.downloader.clone();
        let download =
            downloader.download(request, DownloadTarget::Service, true, notifier, cancel_rx);
        tokio::pin!(download);

        let mut close_ack: Option<oneshot::Sender<()>> = None;
        let mut closing = false;

        let outcome = loop {
            tokio::select! {
                outcome = &mut download => break outcome,
                cmd = cmd_rx.recv(), if !closing => match cmd {
                    Some(Command::Desired(desired, ack)) => {
                        if self.same_update(&desired).await {
                            debug!("identical desired status, ignoring");
                            let _ = ack.send(Ok(()));
                        } else {
                            self.pending = Some(desired);
                            let _ = ack.send(Ok(()));
                            let _ = cancel_tx.send(true);
                        }
                    }
                    Some(Command::StartUpdate) | Some(Command::RunStatusReceived) => {}
                    Some(Command::Close(ack)) => {
                        close_ack = Some(ack);
                        closing = true;
                        let _ = cancel_tx.send(true);
                    }
                    None => {
                        closing = true;
                        let _ = cancel_tx.send(true);
                    }
                },
            }
        };

        if closing {
            return Flow::Shutdown(close_ack);
        }

        let results = match outcome {
            Ok(results) => results,
            Err(err) => {
                self.fail_update(err.to_string()).await;
                return Flow::Continue;
            }
        };

        let expected = update
            .install_layers
            .iter()
            .map(|layer| layer.digest.clone())
            .chain(update.install_services.iter().map(|s| s.id.clone()));

        if let Err(err) = GroupDownloader::check_results(&results, expected) {
            error!(error = %err, "download result lost");
            self.fail_update(err.to_string()).await;
            return Flow::Continue;
        }

        if results.values().all(|result| is_cancel_error(&result.error)) {
            self.cancel_update().await;
            return Flow::Continue;
        }

        self.record_download_statuses(&update, &results);

        // Every single item failed: nothing to install.
        if results.values().all(|result| !result.succeeded()) {
            let error = first_download_error(&results)
                .unwrap_or_else(|| UpdateError::Canceled.to_string());
            self.fail_update(error).await;
            return Flow::Continue;
        }

        let download_error = first_download_error(&results);

        self.plan.download_result = results;
        self.plan.current_state = UpdateState::ReadyToUpdate;
        self.ready_since = Some(Instant::now());
        self.persist();

        match download_error {
            Some(error) => {
                self.emit(UpdateStatus::with_error(UpdateState::ReadyToUpdate, error))
                    .await
            }
            None => self.emit(UpdateStatus::new(UpdateState::ReadyToUpdate)).await,
        }

        Flow::Continue
    }

    fn record_download_statuses(
        &mut self,
        update: &SoftwareUpdate,
        results: &HashMap<String, DownloadResult>,
    ) {
        for layer in &update.install_layers {
            let Some(result) = results.get(&layer.digest) else {
                continue;
            };

            self.plan.layer_statuses.insert(
                layer.digest.clone(),
                LayerStatus {
                    id: layer.id.clone(),
                    digest: layer.digest.clone(),
                    aos_version: layer.aos_version,
                    status: if result.succeeded() {
                        EntityStatus::Downloaded
                    } else {
                        EntityStatus::Error
                    },
                    error_info: (!result.succeeded()).then(|| ErrorInfo::new(result.error.clone())),
                },
            );
        }

        for service in &update.install_services {
            let Some(result) = results.get(&service.id) else {
                continue;
            };

            self.plan.service_statuses.insert(
                service.id.clone(),
                ServiceStatus {
                    id: service.id.clone(),
                    aos_version: service.aos_version,
                    status: if result.succeeded() {
                        EntityStatus::Downloaded
                    } else {
                        EntityStatus::Error
                    },
                    error_info: (!result.succeeded()).then(|| ErrorInfo::new(result.error.clone())),
                },
            );
        }
    }

    async fn ready(&mut self, cmd_rx: &mut mpsc::Receiver<Command>) -> Flow {
        let schedule = self
            .plan
            .current_update
            .as_ref()
            .map(|update| update.schedule.clone())
            .unwrap_or_default();

        let ttl = schedule_ttl(&schedule, self.default_ttl);
        let deadline = self.ready_since.unwrap_or_else(Instant::now) + ttl;

        if schedule.update_type == UpdateType::ForceUpdate {
            self.enter_updating().await;
            return Flow::Continue;
        }

        let wait_trigger = schedule.update_type == UpdateType::TriggerUpdate;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    self.fail_update(UpdateError::Timeout.to_string()).await;
                    return Flow::Continue;
                }
                outcome = wait_timetable_window(&schedule), if !wait_trigger => {
                    match outcome {
                        GateOutcome::Proceed => {
                            self.enter_updating().await;
                            return Flow::Continue;
                        }
                        GateOutcome::Invalid(error) => {
                            self.fail_update(error).await;
                            return Flow::Continue;
                        }
                    }
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Desired(desired, ack)) => {
                        if self.same_update(&desired).await {
                            debug!("identical desired status, ignoring");
                            let _ = ack.send(Ok(()));
                        } else {
                            self.pending = Some(desired);
                            let _ = ack.send(Ok(()));
                            self.cancel_update().await;
                            return Flow::Continue;
                        }
                    }
                    Some(Command::StartUpdate) => {
                        if wait_trigger {
                            self.enter_updating().await;
                            return Flow::Continue;
                        }
                    }
                    Some(Command::RunStatusReceived) => {}
                    Some(Command::Close(ack)) => return Flow::Shutdown(Some(ack)),
                    None => return Flow::Shutdown(None),
                },
            }
        }
    }

    async fn enter_updating(&mut self) {
        self.plan.current_state = UpdateState::Updating;
        self.ready_since = None;
        self.persist();
        self.emit(UpdateStatus::new(UpdateState::Updating)).await;
    }

    async fn updating(&mut self, cmd_rx: &mut mpsc::Receiver<Command>) -> Flow {
        let mut close_ack: Option<oneshot::Sender<()>> = None;
        let mut channel_closed = false;
        let mut deferred: Option<SoftwareDesired> = None;
        let mut run_status_seen = false;

        let error = {
            let update = self.execute_update();
            tokio::pin!(update);

            loop {
                tokio::select! {
                    error = &mut update => break error,
                    cmd = cmd_rx.recv(), if close_ack.is_none() && !channel_closed => match cmd {
                        Some(Command::Desired(desired, ack)) => {
                            let _ = ack.send(Ok(()));
                            deferred = Some(desired);
                        }
                        Some(Command::StartUpdate) => {}
                        Some(Command::RunStatusReceived) => run_status_seen = true,
                        Some(Command::Close(ack)) => close_ack = Some(ack),
                        None => channel_closed = true,
                    },
                }
            }
        };

        // A clean update completes only once the instance run reported
        // back; an errored one terminates immediately.
        if error.is_none() && !run_status_seen && close_ack.is_none() && !channel_closed {
            loop {
                match cmd_rx.recv().await {
                    Some(Command::RunStatusReceived) => break,
                    Some(Command::Desired(desired, ack)) => {
                        let _ = ack.send(Ok(()));
                        deferred = Some(desired);
                    }
                    Some(Command::StartUpdate) => {}
                    Some(Command::Close(ack)) => {
                        close_ack = Some(ack);
                        break;
                    }
                    None => {
                        channel_closed = true;
                        break;
                    }
                }
            }
        }

        self.downloader.release_software().await;

        self.plan = SoftwarePlan {
            version: PLAN_FORMAT_VERSION,
            current_state: UpdateState::NoUpdate,
            ..Default::default()
        };
        self.persist();

        match error {
            Some(error) => {
                self.emit(UpdateStatus::with_error(UpdateState::NoUpdate, error))
                    .await
            }
            None => self.emit(UpdateStatus::new(UpdateState::NoUpdate)).await,
        }

        if close_ack.is_some() || channel_closed {
            return Flow::Shutdown(close_ack);
        }

        self.pending = deferred;
        Flow::Continue
    }

    /// Apply the install/remove/restore sets and dispatch the instance run.
    ///
    /// Layers are installed before the services that reference them;
    /// removals run after installs so nothing is pulled out from under a
    /// still-desired dependent.
    async fn execute_update(&mut self) -> Option<String> {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let synchronizer = self.synchronizer.clone();

        let update = self.plan.current_update.clone().unwrap_or_default();
        let download_result = self.plan.download_result.clone();
        let listener = self.listener.clone();
        let updater = self.updater.clone();
        let runner = self.runner.clone();

        let outcome = synchronizer
            .execute(cancel_rx, || async move {
                let mut overall_error: Option<String> = None;
                let mut layer_statuses: Vec<LayerStatus> = Vec::new();
                let mut service_statuses: Vec<ServiceStatus> = Vec::new();
                let mut new_services: Vec<String> = Vec::new();

                let note_error = |error: &str, overall: &mut Option<String>| {
                    if overall.is_none() {
                        *overall = Some(error.to_string());
                    }
                };

                for layer in &update.install_layers {
                    let downloaded = download_result
                        .get(&layer.digest)
                        .filter(|result| result.succeeded());

                    let Some(result) = downloaded else {
                        // Download already produced the error row.
                        continue;
                    };

                    let status = match updater
                        .install_layer(
                            layer,
                            &result.file_name,
                            &update.cert_chains,
                            &update.certificates,
                        )
                        .await
                    {
                        Ok(()) => layer_status(layer, EntityStatus::Installed, None),
                        Err(err) => {
                            note_error(&err.to_string(), &mut overall_error);
                            layer_status(layer, EntityStatus::Error, Some(err.to_string()))
                        }
                    };

                    listener.update_layer_status(status.clone());
                    layer_statuses.push(status);
                }

                for restored in &update.restore_layers {
                    let status = match updater.restore_layer(&restored.digest).await {
                        Ok(()) => LayerStatus {
                            status: EntityStatus::Installed,
                            error_info: None,
                            ..restored.clone()
                        },
                        Err(err) => {
                            note_error(&err.to_string(), &mut overall_error);
                            LayerStatus {
                                status: EntityStatus::Error,
                                error_info: Some(ErrorInfo::new(err.to_string())),
                                ..restored.clone()
                            }
                        }
                    };

                    listener.update_layer_status(status.clone());
                    layer_statuses.push(status);
                }

                for service in &update.install_services {
                    let downloaded = download_result
                        .get(&service.id)
                        .filter(|result| result.succeeded());

                    let Some(result) = downloaded else {
                        continue;
                    };

                    let status = match updater
                        .install_service(
                            service,
                            &result.file_name,
                            &update.cert_chains,
                            &update.certificates,
                        )
                        .await
                    {
                        Ok(()) => {
                            new_services.push(service.id.clone());
                            service_status(service, EntityStatus::Installed, None)
                        }
                        Err(err) => {
                            note_error(&err.to_string(), &mut overall_error);
                            service_status(service, EntityStatus::Error, Some(err.to_string()))
                        }
                    };

                    listener.update_service_status(status.clone());
                    service_statuses.push(status);
                }

                for restored in &update.restore_services {
                    let status = match updater.restore_service(&restored.id).await {
                        Ok(()) => ServiceStatus {
                            status: EntityStatus::Installed,
                            error_info: None,
                            ..restored.clone()
                        },
                        Err(err) => {
                            note_error(&err.to_string(), &mut overall_error);
                            ServiceStatus {
                                status: EntityStatus::Error,
                                error_info: Some(ErrorInfo::new(err.to_string())),
                                ..restored.clone()
                            }
                        }
                    };

                    listener.update_service_status(status.clone());
                    service_statuses.push(status);
                }

                for removed in &update.remove_services {
                    let status = match updater.remove_service(&removed.id).await {
                        Ok(()) => ServiceStatus {
                            status: EntityStatus::Removed,
                            error_info: None,
                            ..removed.clone()
                        },
                        Err(err) => {
                            note_error(&err.to_string(), &mut overall_error);
                            ServiceStatus {
                                status: EntityStatus::Error,
                                error_info: Some(ErrorInfo::new(err.to_string())),
                                ..removed.clone()
                            }
                        }
                    };

                    listener.update_service_status(status.clone());
                    service_statuses.push(status);
                }

                for removed in &update.remove_layers {
                    let status = match updater.remove_layer(&removed.digest).await {
                        Ok(()) => LayerStatus {
                            status: EntityStatus::Removed,
                            error_info: None,
                            ..removed.clone()
                        },
                        Err(err) => {
                            note_error(&err.to_string(), &mut overall_error);
                            LayerStatus {
                                status: EntityStatus::Error,
                                error_info: Some(ErrorInfo::new(err.to_string())),
                                ..removed.clone()
                            }
                        }
                    };

                    listener.update_layer_status(status.clone());
                    layer_statuses.push(status);
                }

                // Run the recomputed desired instance list regardless of
                // per-item failures; what installed should run.
                new_services.sort();

                if let Err(err) = runner
                    .run_instances(update.run_instances.clone(), new_services)
                    .await
                {
                    note_error(&err.to_string(), &mut overall_error);
                }

                (overall_error, layer_statuses, service_statuses)
            })
            .await;

        match outcome {
            Some((error, layer_statuses, service_statuses)) => {
                for status in layer_statuses {
                    self.plan
                        .layer_statuses
                        .insert(status.digest.clone(), status);
                }
                for status in service_statuses {
                    self.plan
                        .service_statuses
                        .insert(status.id.clone(), status);
                }
                self.last_run_instances = Some(
                    self.plan
                        .current_update
                        .as_ref()
                        .map(|update| update.run_instances.clone())
                        .unwrap_or_default(),
                );
                error
            }
            None => Some(UpdateError::Canceled.to_string()),
        }
    }

    async fn fail_update(&mut self, error: String) {
        warn!(error = %error, "software update failed");

        self.downloader.release_software().await;

        self.plan = SoftwarePlan {
            version: PLAN_FORMAT_VERSION,
            current_state: UpdateState::NoUpdate,
            ..Default::default()
        };
        self.ready_since = None;
        self.persist();
        self.emit(UpdateStatus::with_error(UpdateState::NoUpdate, error))
            .await;
    }

    async fn cancel_update(&mut self) {
        self.fail_update(UpdateError::Canceled.to_string()).await;
    }

    /// True when `desired` would produce the update already in flight.
    ///
    /// The desired lists repeat already-installed entities, so the
    /// comparison re-runs the inventory diff instead of comparing payloads
    /// verbatim.
    async fn same_update(&self, desired: &SoftwareDesired) -> bool {
        let Some(update) = &self.plan.current_update else {
            return false;
        };

        let candidate = match self.build_update(desired).await {
            Ok(candidate) => candidate,
            Err(err) => {
                warn!(error = %err, "can't diff desired software status");
                return false;
            }
        };

        candidate.install_layers == update.install_layers
            && candidate.remove_layers == update.remove_layers
            && candidate.restore_layers == update.restore_layers
            && candidate.install_services == update.install_services
            && candidate.remove_services == update.remove_services
            && candidate.restore_services == update.restore_services
            && candidate.run_instances == update.run_instances
    }

    fn persist(&self) {
        let raw = match serde_json::to_value(&self.plan) {
            Ok(raw) => raw,
            Err(err) => {
                error!(error = %err, "can't serialize software state");
                return;
            }
        };

        if let Err(err) = self.store.set_software_state(raw) {
            error!(error = %err, "can't store software state");
        }
    }

    async fn emit(&self, status: UpdateStatus) {
        debug!(state = %status.state, error = ?status.error, "software state changed");

        if let Ok(mut current) = self.current.lock() {
            *current = status.clone();
        }

        // The channel is informational; a saturated observer must not
        // stall the state machine.
        if let Err(mpsc::error::TrySendError::Full(_)) = self.status_tx.try_send(status) {
            warn!("software status channel full, notification dropped");
        }
    }
}

fn layer_status(layer: &LayerInfo, status: EntityStatus, error: Option<String>) -> LayerStatus {
    LayerStatus {
        id: layer.id.clone(),
        digest: layer.digest.clone(),
        aos_version: layer.aos_version,
        status,
        error_info: error.map(ErrorInfo::new),
    }
}

fn service_status(
    service: &ServiceInfo,
    status: EntityStatus,
    error: Option<String>,
) -> ServiceStatus {
    ServiceStatus {
        id: service.id.clone(),
        aos_version: service.aos_version,
        status,
        error_info: error.map(ErrorInfo::new),
    }
}

/// Download progress callback reporting per-layer and per-service statuses.
fn software_notifier(listener: Arc<dyn StatusListener>, update: &SoftwareUpdate) -> DownloadNotifier {
    let layers: HashMap<String, LayerInfo> = update
        .install_layers
        .iter()
        .map(|layer| (layer.digest.clone(), layer.clone()))
        .collect();

    let services: HashMap<String, ServiceInfo> = update
        .install_services
        .iter()
        .map(|service| (service.id.clone(), service.clone()))
        .collect();

    Arc::new(move |id, status, error| {
        if let Some(layer) = layers.get(id) {
            listener.update_layer_status(layer_status(
                layer,
                status,
                (!error.is_empty()).then(|| error.to_string()),
            ));
        } else if let Some(service) = services.get(id) {
            listener.update_service_status(service_status(
                service,
                status,
                (!error.is_empty()).then(|| error.to_string()),
            ));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::tests::NullListener;
    use crate::storage::SqliteStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestSoftwareUpdater {
        services: Mutex<Vec<crate::update::ServiceState>>,
        layers: Mutex<Vec<crate::update::LayerState>>,
        error: Mutex<Option<String>>,
        installed_services: Mutex<Vec<String>>,
        removed_services: Mutex<Vec<String>>,
        restored_services: Mutex<Vec<String>>,
        installed_layers: Mutex<Vec<String>>,
        removed_layers: Mutex<Vec<String>>,
    }

    impl TestSoftwareUpdater {
        fn fail_with(&self, message: &str) {
            *self.error.lock().unwrap() = Some(message.to_string());
        }

        fn result(&self) -> Result<(), UpdateError> {
            match self.error.lock().unwrap().clone() {
                Some(message) => Err(UpdateError::collaborator(message)),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl SoftwareUpdater for TestSoftwareUpdater {
        async fn services_status(&self) -> Result<Vec<crate::update::ServiceState>, UpdateError> {
            Ok(self.services.lock().unwrap().clone())
        }

        async fn layers_status(&self) -> Result<Vec<crate::update::LayerState>, UpdateError> {
            Ok(self.layers.lock().unwrap().clone())
        }

        async fn install_service(
            &self,
            service: &ServiceInfo,
            _file_name: &str,
            _chains: &[CertificateChain],
            _certs: &[Certificate],
        ) -> Result<(), UpdateError> {
            self.installed_services.lock().unwrap().push(service.id.clone());
            self.result()
        }

        async fn restore_service(&self, service_id: &str) -> Result<(), UpdateError> {
            self.restored_services
                .lock()
                .unwrap()
                .push(service_id.to_string());
            Ok(())
        }

        async fn remove_service(&self, service_id: &str) -> Result<(), UpdateError> {
            self.removed_services
                .lock()
                .unwrap()
                .push(service_id.to_string());
            self.result()
        }

        async fn install_layer(
            &self,
            layer: &LayerInfo,
            _file_name: &str,
            _chains: &[CertificateChain],
            _certs: &[Certificate],
        ) -> Result<(), UpdateError> {
            self.installed_layers.lock().unwrap().push(layer.digest.clone());
            self.result()
        }

        async fn restore_layer(&self, _digest: &str) -> Result<(), UpdateError> {
            Ok(())
        }

        async fn remove_layer(&self, digest: &str) -> Result<(), UpdateError> {
            self.removed_layers.lock().unwrap().push(digest.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestRunner {
        runs: Mutex<Vec<(Vec<InstanceRequest>, Vec<String>)>>,
        notify: Mutex<Option<mpsc::UnboundedSender<()>>>,
    }

    impl TestRunner {
        fn subscribe(&self) -> mpsc::UnboundedReceiver<()> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.notify.lock().unwrap() = Some(tx);
            rx
        }
    }

    #[async_trait]
    impl InstanceRunner for TestRunner {
        async fn run_instances(
            &self,
            instances: Vec<InstanceRequest>,
            new_services: Vec<String>,
        ) -> Result<(), UpdateError> {
            self.runs.lock().unwrap().push((instances, new_services));
            if let Some(tx) = self.notify.lock().unwrap().as_ref() {
                let _ = tx.send(());
            }
            Ok(())
        }

        async fn restart_instances(&self) -> Result<(), UpdateError> {
            Ok(())
        }

        async fn nodes_configuration(&self) -> Vec<convoy_cloudproto::NodeInfo> {
            Vec::new()
        }
    }

    struct InstantDownloader {
        failures: Mutex<HashMap<String, String>>,
    }

    struct InstantHandle {
        file_name: String,
        error: Option<String>,
    }

    #[async_trait]
    impl crate::downloads::DownloadHandle for InstantHandle {
        fn file_name(&self) -> String {
            self.file_name.clone()
        }

        async fn wait(&mut self) -> Result<(), crate::downloads::DownloadError> {
            tokio::time::sleep(Duration::from_millis(2)).await;
            match &self.error {
                Some(message) => Err(crate::downloads::DownloadError::Failed(message.clone())),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl crate::downloads::Downloader for InstantDownloader {
        async fn download(
            &self,
            package: DownloadPackage,
            _target: DownloadTarget,
            _cancel: watch::Receiver<bool>,
        ) -> Result<Box<dyn crate::downloads::DownloadHandle>, crate::downloads::DownloadError>
        {
            let key = package
                .urls
                .first()
                .and_then(|url| url.rsplit('/').next())
                .unwrap_or_default()
                .to_string();

            Ok(Box::new(InstantHandle {
                file_name: format!("/tmp/{key}.dec"),
                error: self.failures.lock().unwrap().get(&key).cloned(),
            }))
        }

        async fn release(&self, _path: &str) -> Result<(), crate::downloads::DownloadError> {
            Ok(())
        }

        async fn release_by_type(
            &self,
            _target: DownloadTarget,
        ) -> Result<(), crate::downloads::DownloadError> {
            Ok(())
        }
    }

    fn layer_info(id: &str, digest: &str, version: u64) -> LayerInfo {
        LayerInfo {
            id: id.to_string(),
            digest: digest.to_string(),
            aos_version: version,
            package: DownloadPackage {
                urls: vec![format!("https://cloud/{digest}")],
                sha256: vec![1],
                ..Default::default()
            },
        }
    }

    fn service_info(id: &str, version: u64) -> ServiceInfo {
        ServiceInfo {
            id: id.to_string(),
            aos_version: version,
            package: DownloadPackage {
                urls: vec![format!("https://cloud/{id}")],
                sha256: vec![1],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn installed_service(id: &str, version: u64, cached: bool) -> crate::update::ServiceState {
        crate::update::ServiceState {
            status: ServiceStatus {
                id: id.to_string(),
                aos_version: version,
                status: EntityStatus::Installed,
                error_info: None,
            },
            cached,
        }
    }

    fn installed_layer(id: &str, digest: &str, cached: bool) -> crate::update::LayerState {
        crate::update::LayerState {
            status: LayerStatus {
                id: id.to_string(),
                digest: digest.to_string(),
                aos_version: 0,
                status: EntityStatus::Installed,
                error_info: None,
            },
            cached,
        }
    }

    struct Fixture {
        updater: Arc<TestSoftwareUpdater>,
        runner: Arc<TestRunner>,
        downloader: Arc<InstantDownloader>,
        store: Arc<SqliteStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                updater: Arc::new(TestSoftwareUpdater::default()),
                runner: Arc::new(TestRunner::default()),
                downloader: Arc::new(InstantDownloader {
                    failures: Mutex::new(HashMap::new()),
                }),
                store: Arc::new(SqliteStore::open_in_memory().unwrap()),
            }
        }

        fn manager(&self) -> (SoftwareManager, mpsc::Receiver<UpdateStatus>) {
            SoftwareManager::new(
                Arc::new(NullListener),
                Arc::new(GroupDownloader::new(self.downloader.clone())),
                self.updater.clone(),
                self.runner.clone(),
                self.store.clone(),
                UpdateSynchronizer::new(),
                Duration::from_secs(30),
            )
            .unwrap()
        }
    }

    async fn expect_status(
        rx: &mut mpsc::Receiver<UpdateStatus>,
        state: UpdateState,
        error: Option<&str>,
    ) {
        let status = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("status timeout")
            .expect("status channel closed");

        assert_eq!(status.state, state, "unexpected status {:?}", status);

        match error {
            Some(expected) => {
                let actual = status.error.expect("expected error");
                assert!(actual.contains(expected), "unexpected error {actual:?}");
            }
            None => assert!(status.error.is_none(), "unexpected error {:?}", status.error),
        }
    }

    #[tokio::test]
    async fn successful_update_runs_new_instances() {
        let fixture = Fixture::new();
        let mut run_rx = fixture.runner.subscribe();

        let (manager, mut status_rx) = fixture.manager();

        manager
            .process_desired_status(SoftwareDesired {
                layers: vec![layer_info("layer1", "digest1", 1), layer_info("layer2", "digest2", 2)],
                services: vec![service_info("service1", 1), service_info("service2", 2)],
                ..Default::default()
            })
            .await
            .unwrap();

        expect_status(&mut status_rx, UpdateState::Downloading, None).await;
        expect_status(&mut status_rx, UpdateState::ReadyToUpdate, None).await;
        expect_status(&mut status_rx, UpdateState::Updating, None).await;

        run_rx.recv().await.unwrap();

        let runs = fixture.runner.runs.lock().unwrap().clone();
        assert_eq!(runs[0].1, vec!["service1".to_string(), "service2".to_string()]);

        manager.process_run_status().await;
        expect_status(&mut status_rx, UpdateState::NoUpdate, None).await;

        // Layers precede services on install.
        let layer_installs = fixture.updater.installed_layers.lock().unwrap().clone();
        assert_eq!(layer_installs, vec!["digest1".to_string(), "digest2".to_string()]);

        manager.close().await;
    }

    #[tokio::test]
    async fn installed_inventory_produces_no_op() {
        let fixture = Fixture::new();
        *fixture.updater.services.lock().unwrap() = vec![installed_service("service1", 1, false)];

        let (manager, mut status_rx) = fixture.manager();

        manager
            .process_desired_status(SoftwareDesired {
                services: vec![service_info("service1", 1)],
                instances: vec![],
                ..Default::default()
            })
            .await
            .unwrap();

        // First desired always dispatches a run (instances unknown yet), so
        // drain through the cycle.
        expect_status(&mut status_rx, UpdateState::Downloading, None).await;
        expect_status(&mut status_rx, UpdateState::ReadyToUpdate, None).await;
        expect_status(&mut status_rx, UpdateState::Updating, None).await;
        manager.process_run_status().await;
        expect_status(&mut status_rx, UpdateState::NoUpdate, None).await;

        // Same desired again: nothing changed, no update.
        manager
            .process_desired_status(SoftwareDesired {
                services: vec![service_info("service1", 1)],
                instances: vec![],
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(
            tokio::time::timeout(Duration::from_millis(200), status_rx.recv())
                .await
                .is_err()
        );

        manager.close().await;
    }

    #[tokio::test]
    async fn cached_service_restores_without_download() {
        let fixture = Fixture::new();
        *fixture.updater.services.lock().unwrap() = vec![installed_service("service1", 1, true)];

        let (manager, mut status_rx) = fixture.manager();

        manager
            .process_desired_status(SoftwareDesired {
                services: vec![service_info("service1", 1)],
                ..Default::default()
            })
            .await
            .unwrap();

        expect_status(&mut status_rx, UpdateState::Downloading, None).await;
        expect_status(&mut status_rx, UpdateState::ReadyToUpdate, None).await;
        expect_status(&mut status_rx, UpdateState::Updating, None).await;
        manager.process_run_status().await;
        expect_status(&mut status_rx, UpdateState::NoUpdate, None).await;

        assert_eq!(
            fixture.updater.restored_services.lock().unwrap().clone(),
            vec!["service1".to_string()]
        );
        assert!(fixture.updater.installed_services.lock().unwrap().is_empty());

        manager.close().await;
    }

    #[tokio::test]
    async fn partial_download_failure_installs_the_rest() {
        let fixture = Fixture::new();
        fixture
            .downloader
            .failures
            .lock()
            .unwrap()
            .insert("digest2".to_string(), "download error".to_string());

        let (manager, mut status_rx) = fixture.manager();

        manager
            .process_desired_status(SoftwareDesired {
                layers: vec![layer_info("layer1", "digest1", 1), layer_info("layer2", "digest2", 2)],
                services: vec![service_info("service1", 1)],
                ..Default::default()
            })
            .await
            .unwrap();

        expect_status(&mut status_rx, UpdateState::Downloading, None).await;
        expect_status(&mut status_rx, UpdateState::ReadyToUpdate, Some("download error")).await;
        expect_status(&mut status_rx, UpdateState::Updating, None).await;
        manager.process_run_status().await;
        expect_status(&mut status_rx, UpdateState::NoUpdate, None).await;

        // The failed layer is skipped; everything else installs.
        let layer_installs = fixture.updater.installed_layers.lock().unwrap().clone();
        assert_eq!(layer_installs, vec!["digest1".to_string()]);

        manager.close().await;
    }

    #[tokio::test]
    async fn all_downloads_failed_skips_install() {
        let fixture = Fixture::new();
        {
            let mut failures = fixture.downloader.failures.lock().unwrap();
            failures.insert("digest1".to_string(), "download error".to_string());
            failures.insert("service1".to_string(), "download error".to_string());
        }

        let (manager, mut status_rx) = fixture.manager();

        manager
            .process_desired_status(SoftwareDesired {
                layers: vec![layer_info("layer1", "digest1", 1)],
                services: vec![service_info("service1", 1)],
                ..Default::default()
            })
            .await
            .unwrap();

        expect_status(&mut status_rx, UpdateState::Downloading, None).await;
        expect_status(&mut status_rx, UpdateState::NoUpdate, Some("download error")).await;

        assert!(fixture.updater.installed_layers.lock().unwrap().is_empty());
        assert!(fixture.updater.installed_services.lock().unwrap().is_empty());

        manager.close().await;
    }

    #[tokio::test]
    async fn install_error_is_reported_and_completes() {
        let fixture = Fixture::new();
        fixture.updater.fail_with("update error");

        let (manager, mut status_rx) = fixture.manager();

        manager
            .process_desired_status(SoftwareDesired {
                services: vec![service_info("service1", 1)],
                ..Default::default()
            })
            .await
            .unwrap();

        expect_status(&mut status_rx, UpdateState::Downloading, None).await;
        expect_status(&mut status_rx, UpdateState::ReadyToUpdate, None).await;
        expect_status(&mut status_rx, UpdateState::Updating, None).await;
        // No run-status gate on an errored update.
        expect_status(&mut status_rx, UpdateState::NoUpdate, Some("update error")).await;

        manager.close().await;
    }

    #[tokio::test]
    async fn removals_follow_desired_set() {
        let fixture = Fixture::new();
        *fixture.updater.services.lock().unwrap() = vec![
            installed_service("service1", 1, false),
            installed_service("service2", 1, false),
        ];
        *fixture.updater.layers.lock().unwrap() = vec![
            installed_layer("layer1", "digest1", false),
            installed_layer("layer2", "digest2", true),
        ];

        let (manager, mut status_rx) = fixture.manager();

        manager
            .process_desired_status(SoftwareDesired {
                services: vec![service_info("service1", 1)],
                ..Default::default()
            })
            .await
            .unwrap();

        expect_status(&mut status_rx, UpdateState::Downloading, None).await;
        expect_status(&mut status_rx, UpdateState::ReadyToUpdate, None).await;
        expect_status(&mut status_rx, UpdateState::Updating, None).await;
        manager.process_run_status().await;
        expect_status(&mut status_rx, UpdateState::NoUpdate, None).await;

        assert_eq!(
            fixture.updater.removed_services.lock().unwrap().clone(),
            vec!["service2".to_string()]
        );
        // Installed non-desired layers are removed, cached ones left alone.
        assert_eq!(
            fixture.updater.removed_layers.lock().unwrap().clone(),
            vec!["digest1".to_string()]
        );

        manager.close().await;
    }

    #[tokio::test]
    async fn resumes_from_ready_to_update_without_redownload() {
        let fixture = Fixture::new();

        fixture
            .store
            .set_software_state(serde_json::json!({
                "version": 1,
                "currentState": "readyToUpdate",
                "currentUpdate": {
                    "installServices": [service_info("service1", 1)],
                },
                "downloadResult": {
                    "service1": {"fileName": "/tmp/service1.dec", "error": ""},
                },
            }))
            .unwrap();

        let (manager, mut status_rx) = fixture.manager();
        assert_eq!(manager.current_status().state, UpdateState::ReadyToUpdate);

        expect_status(&mut status_rx, UpdateState::Updating, None).await;
        manager.process_run_status().await;
        expect_status(&mut status_rx, UpdateState::NoUpdate, None).await;

        assert_eq!(
            fixture.updater.installed_services.lock().unwrap().clone(),
            vec!["service1".to_string()]
        );

        manager.close().await;
    }
}
