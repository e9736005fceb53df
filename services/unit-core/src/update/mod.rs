//! The update coordinator: two cooperating state machines.
//!
//! [`firmware::FirmwareManager`] converges UnitConfig and firmware
//! components; [`software::SoftwareManager`] converges layers, services,
//! and the desired instance list. Both share the same skeleton:
//!
//! ```text
//! noUpdate -> downloading -> readyToUpdate -> updating -> noUpdate
//! ```
//!
//! Every transition is persisted before the machine acts on it, so a crash
//! between any two transitions resumes without repeating observable work.

pub mod firmware;
pub mod software;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use convoy_cloudproto::{
    Certificate, CertificateChain, ComponentStatus, LayerStatus, ScheduleRule, ServiceInfo,
    ServiceStatus, UnitConfigStatus, UpdateType,
};

use crate::downloads::CANCEL_ERROR;
use crate::storage::StoreError;

/// Version stamp written into persisted plan blobs.
pub(crate) const PLAN_FORMAT_VERSION: u32 = 1;

/// Phase of an update state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdateState {
    #[default]
    NoUpdate,
    Downloading,
    ReadyToUpdate,
    Updating,
}

impl UpdateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoUpdate => "noUpdate",
            Self::Downloading => "downloading",
            Self::ReadyToUpdate => "readyToUpdate",
            Self::Updating => "updating",
        }
    }
}

impl std::fmt::Display for UpdateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase notification emitted on a manager's status channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateStatus {
    pub state: UpdateState,
    pub error: Option<String>,
}

impl UpdateStatus {
    pub(crate) fn new(state: UpdateState) -> Self {
        Self { state, error: None }
    }

    pub(crate) fn with_error(state: UpdateState, error: impl Into<String>) -> Self {
        Self {
            state,
            error: Some(error.into()),
        }
    }
}

/// Errors from the update managers and their collaborators.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("{0}")]
    Collaborator(String),

    #[error("update timeout")]
    Timeout,

    #[error("{}", CANCEL_ERROR)]
    Canceled,

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("manager is closed")]
    Closed,
}

impl UpdateError {
    pub fn collaborator(message: impl Into<String>) -> Self {
        Self::Collaborator(message.into())
    }
}

/// A component handed to the firmware updater: target version plus the
/// locally downloaded artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentUpdateRequest {
    pub id: String,
    pub vendor_version: String,
    /// Local path of the downloaded artifact.
    pub url: String,
    #[serde(default)]
    pub sha256: Vec<u8>,
    #[serde(default)]
    pub size: u64,
}

/// A failed component update, carrying whatever per-component statuses the
/// updater produced before failing.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ComponentUpdateError {
    pub message: String,
    pub statuses: Vec<ComponentStatus>,
}

/// Applies the opaque unit configuration blob.
#[async_trait]
pub trait UnitConfigUpdater: Send + Sync {
    async fn status(&self) -> Result<UnitConfigStatus, UpdateError>;

    /// Pre-validate a blob and return the version it carries.
    async fn check_unit_config(&self, config: &serde_json::Value) -> Result<String, UpdateError>;

    async fn update_unit_config(&self, config: &serde_json::Value) -> Result<(), UpdateError>;
}

/// Applies firmware component updates.
#[async_trait]
pub trait FirmwareUpdater: Send + Sync {
    async fn status(&self) -> Result<Vec<ComponentStatus>, UpdateError>;

    async fn update_components(
        &self,
        components: Vec<ComponentUpdateRequest>,
        chains: Vec<CertificateChain>,
        certs: Vec<Certificate>,
    ) -> Result<Vec<ComponentStatus>, ComponentUpdateError>;
}

/// A service as known to the software inventory. `cached` marks entities
/// retained on disk but outside the active inventory; the flag never
/// reaches the cloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceState {
    pub status: ServiceStatus,
    pub cached: bool,
}

/// A layer as known to the software inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerState {
    pub status: LayerStatus,
    pub cached: bool,
}

/// Installs, removes, and restores services and layers.
#[async_trait]
pub trait SoftwareUpdater: Send + Sync {
    async fn services_status(&self) -> Result<Vec<ServiceState>, UpdateError>;
    async fn layers_status(&self) -> Result<Vec<LayerState>, UpdateError>;

    async fn install_service(
        &self,
        service: &ServiceInfo,
        file_name: &str,
        chains: &[CertificateChain],
        certs: &[Certificate],
    ) -> Result<(), UpdateError>;
    async fn restore_service(&self, service_id: &str) -> Result<(), UpdateError>;
    async fn remove_service(&self, service_id: &str) -> Result<(), UpdateError>;

    async fn install_layer(
        &self,
        layer: &convoy_cloudproto::LayerInfo,
        file_name: &str,
        chains: &[CertificateChain],
        certs: &[Certificate],
    ) -> Result<(), UpdateError>;
    async fn restore_layer(&self, digest: &str) -> Result<(), UpdateError>;
    async fn remove_layer(&self, digest: &str) -> Result<(), UpdateError>;
}

/// Drives the desired instance set after a software update.
#[async_trait]
pub trait InstanceRunner: Send + Sync {
    async fn run_instances(
        &self,
        instances: Vec<convoy_cloudproto::InstanceRequest>,
        new_services: Vec<String>,
    ) -> Result<(), UpdateError>;

    async fn restart_instances(&self) -> Result<(), UpdateError>;

    async fn nodes_configuration(&self) -> Vec<convoy_cloudproto::NodeInfo>;
}

/// How a schedule gate resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum GateOutcome {
    /// The window is open; run the update.
    Proceed,
    /// The timetable was rejected.
    Invalid(String),
}

/// Evaluate the schedule rule's gate without consuming external events.
///
/// `triggerUpdate` gating is handled by the manager loops themselves (they
/// must keep serving commands while blocked); this helper covers the
/// timetable sleep used by `timetableUpdate`.
pub(crate) async fn wait_timetable_window(schedule: &ScheduleRule) -> GateOutcome {
    debug_assert_eq!(schedule.update_type, UpdateType::TimetableUpdate);

    let now = chrono::Local::now().naive_local();

    match convoy_scheduling::available_time(now, &schedule.timetable) {
        Ok(wait) if wait.is_zero() => GateOutcome::Proceed,
        Ok(wait) => {
            tokio::time::sleep(wait).await;
            GateOutcome::Proceed
        }
        Err(err) => GateOutcome::Invalid(err.to_string()),
    }
}

/// TTL of a schedule, falling back to the configured default.
pub(crate) fn schedule_ttl(
    schedule: &ScheduleRule,
    default_ttl: std::time::Duration,
) -> std::time::Duration {
    schedule
        .ttl_seconds
        .map(std::time::Duration::from_secs)
        .unwrap_or(default_ttl)
}
