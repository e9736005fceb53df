//! Reconciliation engine for a convoy fleet-edge unit.
//!
//! The unit core converges a device toward the cloud-declared desired
//! state: unit configuration, firmware components, container layers and
//! services, and the set of service instances to run. It is transport- and
//! crypto-agnostic; every outside concern (message transport, byte
//! downloads, image management, per-node service managers, update
//! managers, state storage) enters through a trait defined next to its
//! consumer.
//!
//! ## Architecture
//!
//! ```text
//! cloud transport ─▶ UnitStatusHandler ─▶ FirmwareManager ─▶ UmCoordinator ─▶ UMs
//!        ▲                   │           SoftwareManager ─▶ InstanceBalancer ─▶ nodes
//!        │                   ▼                  │                  │
//!        └────────── unit status shadow ◀───────┴── run statuses ◀─┘
//! ```
//!
//! - `status`: aggregates every delta into the reported unit status
//! - `update`: the FOTA and SOTA state machines with persisted plans
//! - `downloads`: grouped artifact downloading over the byte downloader
//! - `placement`: instance placement, device accounting, rebalancing
//! - `umcoord`: two-phase coordination across update managers
//! - `storage`: SQLite persistence for plans, UIDs, desired instances
//! - `sync`: the process-wide update serializer

pub mod config;
pub mod downloads;
pub mod placement;
pub mod status;
pub mod storage;
pub mod sync;
pub mod umcoord;
pub mod update;

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use convoy_cloudproto::{DesiredStatus, InstanceStatus, SystemQuotaAlert};

use crate::config::Config;
use crate::downloads::Downloader;
use crate::placement::{
    BalancerConfig, ImageProvider, InstanceBalancer, NetworkProvider, NodeManager, NodeProfileProvider,
    NodeRunStatus, PlacementError, StorageStateProvider,
};
use crate::status::{CloudSender, ConnectionEvent, StatusError, UnitStatusHandler};
use crate::storage::SqliteStore;
use crate::umcoord::{UmConnection, UmCoordError, UmCoordinator, UrlTranslator};
use crate::update::{SoftwareUpdater, UnitConfigUpdater, UpdateError};

/// Engine construction and shutdown errors.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Store(#[from] crate::storage::StoreError),

    #[error(transparent)]
    Update(#[from] UpdateError),

    #[error(transparent)]
    Placement(#[from] PlacementError),

    #[error(transparent)]
    UmCoord(#[from] UmCoordError),
}

/// External collaborators the engine is built on.
pub struct UnitCoreDeps {
    pub sender: Arc<dyn CloudSender>,
    pub downloader: Arc<dyn Downloader>,
    pub unit_config_updater: Arc<dyn UnitConfigUpdater>,
    pub software_updater: Arc<dyn SoftwareUpdater>,
    pub image_provider: Arc<dyn ImageProvider>,
    pub node_manager: Arc<dyn NodeManager>,
    pub node_profiles: Arc<dyn NodeProfileProvider>,
    pub storage_state: Arc<dyn StorageStateProvider>,
    pub network: Arc<dyn NetworkProvider>,
    pub url_translator: Arc<dyn UrlTranslator>,
}

/// Inbound event channels fed by the node transport.
pub struct UnitCoreChannels {
    /// Run-status reports from per-node service managers.
    pub node_run_status: mpsc::Receiver<NodeRunStatus>,
    /// System resource quota alerts from nodes.
    pub quota_alerts: mpsc::Receiver<SystemQuotaAlert>,
    /// Per-instance run-state deltas between placement passes.
    pub instance_updates: mpsc::Receiver<Vec<InstanceStatus>>,
}

/// The assembled reconciliation engine.
pub struct UnitCore {
    handler: Arc<UnitStatusHandler>,
    balancer: InstanceBalancer,
    um_coordinator: UmCoordinator,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl UnitCore {
    /// Wire the engine together and spawn its background tasks.
    pub fn new(
        config: &Config,
        store: Arc<SqliteStore>,
        deps: UnitCoreDeps,
        channels: UnitCoreChannels,
    ) -> Result<Self, CoreError> {
        info!(working_dir = %config.working_dir.display(), "create unit core");

        let um_coordinator = UmCoordinator::new(
            config.um_clients.clone(),
            store.clone(),
            deps.url_translator,
        )?;

        let (balancer, mut run_status_rx) = InstanceBalancer::new(
            BalancerConfig::from(config),
            store.clone(),
            deps.node_manager,
            deps.image_provider,
            deps.node_profiles,
            deps.storage_state,
            deps.network,
        )?;

        let handler = Arc::new(UnitStatusHandler::new(
            config,
            deps.unit_config_updater,
            Arc::new(um_coordinator.clone()),
            deps.software_updater,
            Arc::new(balancer.clone()),
            deps.downloader,
            store,
            deps.sender,
        )?);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        tasks.push(balancer.spawn(
            channels.node_run_status,
            channels.quota_alerts,
            shutdown_rx.clone(),
        ));

        // Merged run statuses feed the aggregator and the SOTA run gate.
        tasks.push({
            let handler = handler.clone();
            let mut shutdown = shutdown_rx.clone();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;

                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                        status = run_status_rx.recv() => match status {
                            Some(status) => handler.process_run_status(status).await,
                            None => break,
                        },
                    }
                }

                debug!("run status pump stopped");
            })
        });

        tasks.push({
            let handler = handler.clone();
            let mut shutdown = shutdown_rx;
            let mut instance_updates = channels.instance_updates;

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;

                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                        statuses = instance_updates.recv() => match statuses {
                            Some(statuses) => {
                                handler.process_update_instances_status(statuses).await;
                            }
                            None => break,
                        },
                    }
                }

                debug!("instance update pump stopped");
            })
        });

        Ok(Self {
            handler,
            balancer,
            um_coordinator,
            shutdown_tx,
            tasks,
        })
    }

    /// The status front door, for wiring to the cloud transport.
    pub fn status_handler(&self) -> Arc<UnitStatusHandler> {
        self.handler.clone()
    }

    /// The placer/balancer handle.
    pub fn balancer(&self) -> &InstanceBalancer {
        &self.balancer
    }

    /// Attach an update manager session accepted by the UM transport.
    pub async fn register_um(&self, connection: Box<dyn UmConnection>) -> Result<(), UmCoordError> {
        self.um_coordinator.register(connection).await
    }

    /// Forward a cloud-desired status into the engine.
    pub async fn process_desired_status(&self, desired: DesiredStatus) {
        self.handler.process_desired_status(desired).await;
    }

    /// Forward a cloud connectivity change.
    pub async fn connection_event(&self, event: ConnectionEvent) {
        self.handler.connection_event(event).await;
    }

    /// Force collection and emission of the full unit status.
    pub async fn send_unit_status(&self) -> Result<(), StatusError> {
        self.handler.send_unit_status().await
    }

    /// Stop every child task, draining in-flight downloads and node calls.
    pub async fn close(mut self) {
        info!("close unit core");

        let _ = self.shutdown_tx.send(true);

        self.handler.close().await;
        self.um_coordinator.close().await;

        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}
