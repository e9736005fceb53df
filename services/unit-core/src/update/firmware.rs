//! Firmware (FOTA) update state machine.
//!
//! Converges the unit configuration and the firmware component set toward
//! the cloud's desired versions. The persisted plan fully determines the
//! next step after a restart:
//!
//! | persisted state | action on start                       |
//! |-----------------|---------------------------------------|
//! | noUpdate        | idle                                  |
//! | downloading     | resume downloads for the stored plan  |
//! | readyToUpdate   | await the schedule gate               |
//! | updating        | reattempt the update call             |

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use convoy_cloudproto::{
    Certificate, CertificateChain, ComponentInfo, ComponentStatus, DownloadPackage, EntityStatus,
    ErrorInfo, ScheduleRule, UnitConfigStatus, UpdateType,
};

use crate::downloads::{
    first_download_error, is_cancel_error, DownloadNotifier, DownloadResult, DownloadTarget,
    GroupDownloader,
};
use crate::status::StatusListener;
use crate::storage::UpdatePlanStore;
use crate::sync::UpdateSynchronizer;
use crate::update::{
    schedule_ttl, wait_timetable_window, ComponentUpdateRequest, FirmwareUpdater, GateOutcome,
    InstanceRunner, UnitConfigUpdater, UpdateError, UpdateState, UpdateStatus,
    PLAN_FORMAT_VERSION,
};

/// The firmware-relevant slice of a desired status.
#[derive(Debug, Clone, Default)]
pub struct FirmwareDesired {
    pub unit_config: Option<serde_json::Value>,
    pub components: Vec<ComponentInfo>,
    pub schedule: ScheduleRule,
    pub cert_chains: Vec<CertificateChain>,
    pub certificates: Vec<Certificate>,
}

/// Persisted FOTA plan. Mutated and stored on every state transition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FirmwarePlan {
    version: u32,
    current_state: UpdateState,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_update: Option<FirmwareUpdate>,
    #[serde(default)]
    download_result: HashMap<String, DownloadResult>,
    #[serde(default)]
    component_statuses: HashMap<String, ComponentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_config_status: Option<UnitConfigStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FirmwareUpdate {
    #[serde(default)]
    schedule: ScheduleRule,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_config: Option<serde_json::Value>,
    #[serde(default)]
    components: Vec<ComponentInfo>,
    #[serde(default)]
    cert_chains: Vec<CertificateChain>,
    #[serde(default)]
    certificates: Vec<Certificate>,
}

enum Command {
    Desired(FirmwareDesired, oneshot::Sender<Result<(), UpdateError>>),
    StartUpdate,
    Close(oneshot::Sender<()>),
}

/// Handle to the firmware update state machine.
pub(crate) struct FirmwareManager {
    cmd_tx: mpsc::Sender<Command>,
    current: Arc<std::sync::Mutex<UpdateStatus>>,
    task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl FirmwareManager {
    /// Create the manager, resuming from the persisted plan if one exists.
    ///
    /// Returns the handle and the status channel emitting one entry per
    /// state transition.
    pub fn new(
        listener: Arc<dyn StatusListener>,
        downloader: Arc<GroupDownloader>,
        updater: Arc<dyn FirmwareUpdater>,
        unit_config_updater: Arc<dyn UnitConfigUpdater>,
        store: Arc<dyn UpdatePlanStore>,
        runner: Arc<dyn InstanceRunner>,
        synchronizer: UpdateSynchronizer,
        default_ttl: Duration,
    ) -> Result<(Self, mpsc::Receiver<UpdateStatus>), UpdateError> {
        let plan = match store.firmware_state()? {
            Some(raw) => match serde_json::from_value::<FirmwarePlan>(raw) {
                Ok(plan) => plan,
                Err(err) => {
                    warn!(error = %err, "can't parse persisted firmware state, starting clean");
                    FirmwarePlan::default()
                }
            },
            None => FirmwarePlan::default(),
        };

        info!(state = %plan.current_state, "firmware manager created");

        let current = Arc::new(std::sync::Mutex::new(UpdateStatus::new(plan.current_state)));
        let (status_tx, status_rx) = mpsc::channel(16);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let task = FmTask {
            listener,
            downloader,
            updater,
            unit_config_updater,
            store,
            runner,
            synchronizer,
            default_ttl,
            plan,
            status_tx,
            current: current.clone(),
            pending: None,
            ready_since: None,
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

    /// Feed a new desired status into the machine.
    pub async fn process_desired_status(&self, desired: FirmwareDesired) -> Result<(), UpdateError> {
        let (ack_tx, ack_rx) = oneshot::channel();

        self.cmd_tx
            .send(Command::Desired(desired, ack_tx))
            .await
            .map_err(|_| UpdateError::Closed)?;

        ack_rx.await.map_err(|_| UpdateError::Closed)?
    }

    /// External trigger for `triggerUpdate`-gated plans.
    pub async fn start_update(&self) -> Result<(), UpdateError> {
        self.cmd_tx
            .send(Command::StartUpdate)
            .await
            .map_err(|_| UpdateError::Closed)
    }

    /// Phase and error of the machine right now.
    pub fn current_status(&self) -> UpdateStatus {
        match self.current.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Stop the machine, waiting for in-flight downloads to drain.
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

struct FmTask {
    listener: Arc<dyn StatusListener>,
    downloader: Arc<GroupDownloader>,
    updater: Arc<dyn FirmwareUpdater>,
    unit_config_updater: Arc<dyn UnitConfigUpdater>,
    store: Arc<dyn UpdatePlanStore>,
    runner: Arc<dyn InstanceRunner>,
    synchronizer: UpdateSynchronizer,
    default_ttl: Duration,
    plan: FirmwarePlan,
    status_tx: mpsc::Sender<UpdateStatus>,
    current: Arc<std::sync::Mutex<UpdateStatus>>,
    pending: Option<FirmwareDesired>,
    ready_since: Option<Instant>,
}

impl FmTask {
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
                    self.downloader.release_firmware().await;

                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }

                    debug!("firmware manager stopped");
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
            Some(Command::StartUpdate) => Flow::Continue,
            Some(Command::Close(ack)) => Flow::Shutdown(Some(ack)),
            None => Flow::Shutdown(None),
        }
    }

    /// Diff the desired firmware set against the installed inventory and
    /// enter `downloading` if there is anything to do.
    async fn start_new_update(&mut self, desired: FirmwareDesired) -> Result<(), UpdateError> {
        let installed = self.updater.status().await?;

        let components: Vec<ComponentInfo> = desired
            .components
            .into_iter()
            .filter(|target| {
                !installed.iter().any(|current| {
                    current.id == target.id
                        && current.vendor_version == target.vendor_version
                        && current.status == EntityStatus::Installed
                })
            })
            .collect();

        if components.is_empty() && desired.unit_config.is_none() {
            debug!("no firmware update required");
            return Ok(());
        }

        info!(
            components = components.len(),
            unit_config = desired.unit_config.is_some(),
            "start firmware update"
        );

        self.plan = FirmwarePlan {
            version: PLAN_FORMAT_VERSION,
            current_state: UpdateState::Downloading,
            current_update: Some(FirmwareUpdate {
                schedule: desired.schedule,
                unit_config: desired.unit_config,
                components,
                cert_chains: desired.cert_chains,
                certificates: desired.certificates,
            }),
            ..Default::default()
        };
        self.persist();
        self.emit(UpdateStatus::new(UpdateState::Downloading)).await;

        Ok(())
    }

    async fn downloading(&mut self, cmd_rx: &mut mpsc::Receiver<Command>) -> Flow {
        let update = self.plan.current_update.clone().unwrap_or_default();

        let request: HashMap<String, DownloadPackage> = update
            .components
            .iter()
            .map(|component| (component.id.clone(), component.package.clone()))
            .collect();

        let versions: HashMap<String, String> = update
            .components
            .iter()
            .map(|component| (component.id.clone(), component.vendor_version.clone()))
            .collect();

        let notifier = component_notifier(self.listener.clone(), versions);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        // Keep `self` unborrowed while the download future is pinned.
        let downloader = self.downloader.clone();
        let download = downloader.download(
            request,
            DownloadTarget::Component,
            false,
            notifier,
            cancel_rx,
        );
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
                    Some(Command::StartUpdate) => {}
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

        if let Err(err) =
            GroupDownloader::check_results(&results, update.components.iter().map(|c| &c.id))
        {
            error!(error = %err, "download result lost");
            self.fail_update(err.to_string()).await;
            return Flow::Continue;
        }

        for component in &update.components {
            let result = &results[&component.id];
            let status = if result.succeeded() {
                ComponentStatus {
                    id: component.id.clone(),
                    vendor_version: component.vendor_version.clone(),
                    status: EntityStatus::Downloaded,
                    error_info: None,
                }
            } else {
                ComponentStatus {
                    id: component.id.clone(),
                    vendor_version: component.vendor_version.clone(),
                    status: EntityStatus::Error,
                    error_info: Some(ErrorInfo::new(result.error.clone())),
                }
            };

            self.plan
                .component_statuses
                .insert(component.id.clone(), status);
        }

        if let Some(error) = first_download_error(&results) {
            self.fail_update(error).await;
            return Flow::Continue;
        }

        if results.values().any(|result| is_cancel_error(&result.error)) {
            self.cancel_update().await;
            return Flow::Continue;
        }

        // The unit config blob needs no download, only pre-validation.
        if let Some(config) = &update.unit_config {
            match self.unit_config_updater.check_unit_config(config).await {
                Ok(version) => {
                    self.plan.unit_config_status = Some(UnitConfigStatus {
                        vendor_version: version,
                        status: EntityStatus::Pending,
                        error_info: None,
                    });
                }
                Err(err) => {
                    self.fail_update(err.to_string()).await;
                    return Flow::Continue;
                }
            }
        }

        self.plan.download_result = results;
        self.plan.current_state = UpdateState::ReadyToUpdate;
        self.ready_since = Some(Instant::now());
        self.persist();
        self.emit(UpdateStatus::new(UpdateState::ReadyToUpdate)).await;

        Flow::Continue
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
        let mut deferred: Option<FirmwareDesired> = None;

        let error = {
            let update = self.execute_update();
            tokio::pin!(update);

            loop {
                tokio::select! {
                    error = &mut update => break error,
                    cmd = cmd_rx.recv(), if close_ack.is_none() && !channel_closed => match cmd {
                        Some(Command::Desired(desired, ack)) => {
                            // Applied once the in-flight update completes.
                            let _ = ack.send(Ok(()));
                            deferred = Some(desired);
                        }
                        Some(Command::StartUpdate) => {}
                        Some(Command::Close(ack)) => close_ack = Some(ack),
                        None => channel_closed = true,
                    },
                }
            }
        };

        self.downloader.release_firmware().await;

        self.plan = FirmwarePlan {
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

    /// The atomic update step, serialized against other update flows.
    async fn execute_update(&mut self) -> Option<String> {
        // The slot is never revoked mid-update; cancellation is observed at
        // the next phase boundary.
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let synchronizer = self.synchronizer.clone();

        let update = self.plan.current_update.clone().unwrap_or_default();

        let listener = self.listener.clone();
        let unit_config_updater = self.unit_config_updater.clone();
        let updater = self.updater.clone();
        let runner = self.runner.clone();
        let download_result = self.plan.download_result.clone();
        let mut unit_config_status = self.plan.unit_config_status.clone();

        let outcome = synchronizer
            .execute(cancel_rx, || async move {
                let mut overall_error: Option<String> = None;
                let mut statuses: Vec<ComponentStatus> = Vec::new();

                if let Some(config) = &update.unit_config {
                    let version = unit_config_status
                        .as_ref()
                        .map(|status| status.vendor_version.clone())
                        .unwrap_or_default();

                    info!(version = %version, "update unit config");

                    let status = match unit_config_updater.update_unit_config(config).await {
                        Ok(()) => {
                            // Node profiles may have changed with the config.
                            if let Err(err) = runner.restart_instances().await {
                                warn!(error = %err, "can't restart instances");
                            }

                            UnitConfigStatus {
                                vendor_version: version,
                                status: EntityStatus::Installed,
                                error_info: None,
                            }
                        }
                        Err(err) => {
                            overall_error = Some(err.to_string());
                            UnitConfigStatus {
                                vendor_version: version,
                                status: EntityStatus::Error,
                                error_info: Some(ErrorInfo::new(err.to_string())),
                            }
                        }
                    };

                    listener.update_unit_config_status(status.clone());
                    unit_config_status = Some(status);
                }

                if !update.components.is_empty() && overall_error.is_none() {
                    let requests: Vec<ComponentUpdateRequest> = update
                        .components
                        .iter()
                        .map(|component| ComponentUpdateRequest {
                            id: component.id.clone(),
                            vendor_version: component.vendor_version.clone(),
                            url: download_result
                                .get(&component.id)
                                .map(|result| result.file_name.clone())
                                .unwrap_or_default(),
                            sha256: component.package.sha256.clone(),
                            size: component.package.size,
                        })
                        .collect();

                    info!(components = requests.len(), "update components");

                    for component in &update.components {
                        listener.update_component_status(ComponentStatus {
                            id: component.id.clone(),
                            vendor_version: component.vendor_version.clone(),
                            status: EntityStatus::Installing,
                            error_info: None,
                        });
                    }

                    match updater
                        .update_components(
                            requests,
                            update.cert_chains.clone(),
                            update.certificates.clone(),
                        )
                        .await
                    {
                        Ok(updated) => statuses = updated,
                        Err(err) => {
                            overall_error = Some(err.message.clone());
                            statuses = err.statuses;
                        }
                    }

                    for status in &statuses {
                        listener.update_component_status(status.clone());
                    }
                }

                (overall_error, statuses, unit_config_status)
            })
            .await;

        match outcome {
            Some((error, statuses, unit_config_status)) => {
                for status in statuses {
                    self.plan
                        .component_statuses
                        .insert(status.id.clone(), status);
                }
                self.plan.unit_config_status = unit_config_status;
                error
            }
            None => Some(UpdateError::Canceled.to_string()),
        }
    }

    /// Terminate the current update with an error.
    async fn fail_update(&mut self, error: String) {
        warn!(error = %error, "firmware update failed");

        self.downloader.release_firmware().await;

        self.plan = FirmwarePlan {
            version: PLAN_FORMAT_VERSION,
            current_state: UpdateState::NoUpdate,
            ..Default::default()
        };
        self.ready_since = None;
        self.persist();
        self.emit(UpdateStatus::with_error(UpdateState::NoUpdate, error))
            .await;
    }

    /// Abandon the current update in favor of a superseding one.
    async fn cancel_update(&mut self) {
        self.fail_update(UpdateError::Canceled.to_string()).await;
    }

    /// True when `desired` would produce the update already in flight.
    ///
    /// The desired list may repeat already-installed components, so the
    /// comparison re-runs the inventory diff instead of comparing payloads
    /// verbatim.
    async fn same_update(&self, desired: &FirmwareDesired) -> bool {
        let Some(update) = &self.plan.current_update else {
            return false;
        };

        if update.unit_config != desired.unit_config {
            return false;
        }

        let installed = match self.updater.status().await {
            Ok(installed) => installed,
            Err(err) => {
                warn!(error = %err, "can't get component statuses");
                return false;
            }
        };

        let candidate: Vec<&ComponentInfo> = desired
            .components
            .iter()
            .filter(|target| {
                !installed.iter().any(|current| {
                    current.id == target.id
                        && current.vendor_version == target.vendor_version
                        && current.status == EntityStatus::Installed
                })
            })
            .collect();

        candidate.len() == update.components.len()
            && candidate
                .iter()
                .zip(update.components.iter())
                .all(|(a, b)| **a == *b)
    }

    fn persist(&self) {
        let raw = match serde_json::to_value(&self.plan) {
            Ok(raw) => raw,
            Err(err) => {
                error!(error = %err, "can't serialize firmware state");
                return;
            }
        };

        if let Err(err) = self.store.set_firmware_state(raw) {
            error!(error = %err, "can't store firmware state");
        }
    }

    async fn emit(&self, status: UpdateStatus) {
        debug!(state = %status.state, error = ?status.error, "firmware state changed");

        if let Ok(mut current) = self.current.lock() {
            *current = status.clone();
        }

        // The channel is informational; a saturated observer must not
        // stall the state machine.
        if let Err(mpsc::error::TrySendError::Full(_)) = self.status_tx.try_send(status) {
            warn!("firmware status channel full, notification dropped");
        }
    }
}

/// Download progress callback reporting per-component statuses.
fn component_notifier(
    listener: Arc<dyn StatusListener>,
    versions: HashMap<String, String>,
) -> DownloadNotifier {
    Arc::new(move |id, status, error| {
        let Some(vendor_version) = versions.get(id) else {
            return;
        };

        listener.update_component_status(ComponentStatus {
            id: id.to_string(),
            vendor_version: vendor_version.clone(),
            status,
            error_info: (!error.is_empty()).then(|| ErrorInfo::new(error)),
        });
    })
}
