//! Update manager coordination.
//!
//! Several update managers (UMs) each own a subset of the unit's firmware
//! components. A component update is a globally ordered two-phase flow:
//!
//! ```text
//! idle -> prepare -> update -> apply -> idle        (success)
//! any  -> revert  -> idle                           (failure)
//! ```
//!
//! No UM advances past a phase until every UM reached it. Within a phase,
//! UMs are driven in ascending priority order with a stable um-id
//! tie-break. The intended phase and the per-UM component assignments are
//! persisted before each phase begins; a disconnect mid-phase is treated
//! as a reboot and the phase command is re-issued when the UM returns.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use convoy_cloudproto::{Certificate, CertificateChain, ComponentStatus, EntityStatus};

use crate::config::UmClientConfig;
use crate::storage::UpdatePlanStore;
use crate::update::{ComponentUpdateError, ComponentUpdateRequest, FirmwareUpdater, UpdateError};

/// Coordination errors.
#[derive(Debug, Error)]
pub enum UmCoordError {
    #[error("unknown update manager {0}")]
    UnknownUm(String),

    #[error("component {0} not owned by any update manager")]
    UnknownComponent(String),

    #[error("update already in progress")]
    Busy,

    #[error("update manager connection lost")]
    ConnectionLost,

    #[error("coordinator is closed")]
    Closed,

    #[error("{0}")]
    Internal(String),
}

/// Per-UM protocol state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UmState {
    #[default]
    Idle,
    Prepared,
    Updated,
    Failed,
}

/// Command sent to an update manager.
#[derive(Debug, Clone, PartialEq)]
pub enum UmRequest {
    Prepare(Vec<ComponentUpdateRequest>),
    StartUpdate,
    ApplyUpdate,
    RevertUpdate,
}

/// Status report received from an update manager. The first report of a
/// session registers the UM and announces its component inventory.
#[derive(Debug, Clone)]
pub struct UmStatusReport {
    pub um_id: String,
    pub state: UmState,
    pub components: Vec<ComponentStatus>,
    pub error: Option<String>,
}

/// One UM's bidirectional session, abstracted over the wire protocol.
#[async_trait]
pub trait UmConnection: Send + 'static {
    async fn send(&mut self, request: UmRequest) -> Result<(), UmCoordError>;

    /// Next status report; `None` means the session ended.
    async fn next_status(&mut self) -> Option<UmStatusReport>;
}

/// Rewrites artifact locations into URLs each UM can fetch.
pub trait UrlTranslator: Send + Sync {
    fn translate(&self, url: &str) -> Result<String, UmCoordError>;
}

/// Translator for deployments where UMs share the unit's filesystem.
pub struct IdentityTranslator;

impl UrlTranslator for IdentityTranslator {
    fn translate(&self, url: &str) -> Result<String, UmCoordError> {
        Ok(url.to_string())
    }
}

/// Global phase of an active update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
enum UpdatePhase {
    Prepare,
    Update,
    Apply,
    Revert,
}

impl UpdatePhase {
    fn target_state(&self) -> UmState {
        match self {
            Self::Prepare => UmState::Prepared,
            Self::Update => UmState::Updated,
            Self::Apply | Self::Revert => UmState::Idle,
        }
    }

    fn request(&self, assignment: &[ComponentUpdateRequest]) -> UmRequest {
        match self {
            Self::Prepare => UmRequest::Prepare(assignment.to_vec()),
            Self::Update => UmRequest::StartUpdate,
            Self::Apply => UmRequest::ApplyUpdate,
            Self::Revert => UmRequest::RevertUpdate,
        }
    }
}

/// Persisted coordinator plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedPlan {
    version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    phase: Option<UpdatePhase>,
    #[serde(default)]
    assignments: HashMap<String, Vec<ComponentUpdateRequest>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

type UpdateResponse = oneshot::Sender<Result<Vec<ComponentStatus>, ComponentUpdateError>>;
type StatusResponse = oneshot::Sender<Result<Vec<ComponentStatus>, UmCoordError>>;

enum CoordCommand {
    Register(Box<dyn UmConnection>),
    Update {
        components: Vec<ComponentUpdateRequest>,
        resp: UpdateResponse,
    },
    Status {
        resp: StatusResponse,
    },
    Close(oneshot::Sender<()>),
}

enum Event {
    Connected {
        um_id: String,
        state: UmState,
        components: Vec<ComponentStatus>,
        cmd_tx: mpsc::Sender<UmRequest>,
    },
    Status(UmStatusReport),
    Disconnected {
        um_id: String,
    },
}

struct UmEntry {
    priority: u32,
    state: UmState,
    components: Vec<ComponentStatus>,
    cmd_tx: Option<mpsc::Sender<UmRequest>>,
}

struct ActiveUpdate {
    phase: UpdatePhase,
    /// UMs with assignments, ascending (priority, um_id).
    order: Vec<String>,
    assignments: HashMap<String, Vec<ComponentUpdateRequest>>,
    /// Next UM in `order` to reach the phase's target state.
    current: usize,
    /// UMs already commanded in the current phase.
    commanded: HashSet<String>,
    /// UMs that received any command during this update.
    touched: HashSet<String>,
    error: Option<String>,
    resp: Option<UpdateResponse>,
}

/// Handle to the UM coordination actor. Clones share the actor.
#[derive(Clone)]
pub struct UmCoordinator {
    cmd_tx: mpsc::Sender<CoordCommand>,
}

impl UmCoordinator {
    pub fn new(
        clients: Vec<UmClientConfig>,
        store: Arc<dyn UpdatePlanStore>,
        translator: Arc<dyn UrlTranslator>,
    ) -> Result<Self, UmCoordError> {
        let persisted = match store.um_state() {
            Ok(Some(raw)) => match serde_json::from_value::<PersistedPlan>(raw) {
                Ok(plan) => plan.phase.map(|phase| (phase, plan.assignments, plan.error)),
                Err(err) => {
                    warn!(error = %err, "can't parse persisted UM state, starting clean");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => return Err(UmCoordError::Internal(err.to_string())),
        };

        info!(
            clients = clients.len(),
            resuming = persisted.is_some(),
            "UM coordinator created"
        );

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(64);

        let actor = Coordinator {
            clients,
            store,
            translator,
            ums: HashMap::new(),
            active: None,
            resumed: persisted,
            pending_status: Vec::new(),
            queued_update: None,
        };

        tokio::spawn(actor.run(cmd_rx, event_rx, event_tx));

        Ok(Self { cmd_tx })
    }

    /// Attach a freshly accepted UM session. The session registers itself
    /// with its first status report.
    pub async fn register(&self, connection: Box<dyn UmConnection>) -> Result<(), UmCoordError> {
        self.cmd_tx
            .send(CoordCommand::Register(connection))
            .await
            .map_err(|_| UmCoordError::Closed)
    }

    /// Aggregated component inventory. Waits until every configured UM has
    /// connected at least once.
    pub async fn component_statuses(&self) -> Result<Vec<ComponentStatus>, UmCoordError> {
        let (resp_tx, resp_rx) = oneshot::channel();

        self.cmd_tx
            .send(CoordCommand::Status { resp: resp_tx })
            .await
            .map_err(|_| UmCoordError::Closed)?;

        resp_rx.await.map_err(|_| UmCoordError::Closed)?
    }

    /// Run the two-phase update for the given components.
    pub async fn run_component_update(
        &self,
        components: Vec<ComponentUpdateRequest>,
    ) -> Result<Vec<ComponentStatus>, ComponentUpdateError> {
        let (resp_tx, resp_rx) = oneshot::channel();

        self.cmd_tx
            .send(CoordCommand::Update {
                components,
                resp: resp_tx,
            })
            .await
            .map_err(|_| ComponentUpdateError {
                message: UmCoordError::Closed.to_string(),
                statuses: Vec::new(),
            })?;

        resp_rx.await.map_err(|_| ComponentUpdateError {
            message: UmCoordError::Closed.to_string(),
            statuses: Vec::new(),
        })?
    }

    pub async fn close(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();

        if self.cmd_tx.send(CoordCommand::Close(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

#[async_trait]
impl FirmwareUpdater for UmCoordinator {
    async fn status(&self) -> Result<Vec<ComponentStatus>, UpdateError> {
        self.component_statuses()
            .await
            .map_err(|err| UpdateError::collaborator(err.to_string()))
    }

    async fn update_components(
        &self,
        components: Vec<ComponentUpdateRequest>,
        _chains: Vec<CertificateChain>,
        _certs: Vec<Certificate>,
    ) -> Result<Vec<ComponentStatus>, ComponentUpdateError> {
        self.run_component_update(components).await
    }
}

struct Coordinator {
    clients: Vec<UmClientConfig>,
    store: Arc<dyn UpdatePlanStore>,
    translator: Arc<dyn UrlTranslator>,
    ums: HashMap<String, UmEntry>,
    active: Option<ActiveUpdate>,
    /// Phase, assignments, and error recovered from storage on startup.
    resumed: Option<(
        UpdatePhase,
        HashMap<String, Vec<ComponentUpdateRequest>>,
        Option<String>,
    )>,
    pending_status: Vec<StatusResponse>,
    queued_update: Option<(Vec<ComponentUpdateRequest>, UpdateResponse)>,
}

impl Coordinator {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<CoordCommand>,
        mut event_rx: mpsc::Receiver<Event>,
        event_tx: mpsc::Sender<Event>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(CoordCommand::Register(connection)) => {
                        let event_tx = event_tx.clone();
                        tokio::spawn(run_session(connection, event_tx));
                    }
                    Some(CoordCommand::Update { components, resp }) => {
                        self.handle_update_request(components, resp).await;
                    }
                    Some(CoordCommand::Status { resp }) => {
                        if self.all_connected() {
                            let _ = resp.send(Ok(self.inventory()));
                        } else {
                            self.pending_status.push(resp);
                        }
                    }
                    Some(CoordCommand::Close(ack)) => {
                        let _ = ack.send(());
                        break;
                    }
                    None => break,
                },
                event = event_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }

        debug!("UM coordinator stopped");
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Connected {
                um_id,
                state,
                components,
                cmd_tx,
            } => {
                let Some(client) = self.clients.iter().find(|client| client.um_id == um_id)
                else {
                    error!(um_id = %um_id, "status from unknown update manager");
                    return;
                };

                info!(um_id = %um_id, state = ?state, "update manager connected");

                let entry = self.ums.entry(um_id.clone()).or_insert(UmEntry {
                    priority: client.priority,
                    state,
                    components: Vec::new(),
                    cmd_tx: None,
                });
                entry.state = state;
                entry.components = components;
                entry.cmd_tx = Some(cmd_tx);

                if self.all_connected() {
                    let inventory = self.inventory();
                    for resp in self.pending_status.drain(..) {
                        let _ = resp.send(Ok(inventory.clone()));
                    }

                    if let Some((components, resp)) = self.queued_update.take() {
                        self.start_update(components, resp).await;
                    }
                }

                if let Some(active) = &mut self.active {
                    // The UM rebooted mid-phase; command it again unless it
                    // already reached the target state.
                    active.commanded.remove(&um_id);
                }

                self.advance().await;
            }
            Event::Status(report) => {
                let Some(entry) = self.ums.get_mut(&report.um_id) else {
                    return;
                };

                debug!(um_id = %report.um_id, state = ?report.state, "update manager status");

                entry.state = report.state;
                if !report.components.is_empty() {
                    entry.components = report.components.clone();
                }

                if report.state == UmState::Failed {
                    self.begin_revert(
                        report
                            .error
                            .unwrap_or_else(|| "update manager failed".to_string()),
                    )
                    .await;
                }

                self.advance().await;
            }
            Event::Disconnected { um_id } => {
                // A reconnect may have superseded this session already; only
                // a closed command channel marks the current one as gone.
                let current_session_gone = self
                    .ums
                    .get(&um_id)
                    .and_then(|entry| entry.cmd_tx.as_ref())
                    .is_none_or(|cmd_tx| cmd_tx.is_closed());

                if !current_session_gone {
                    return;
                }

                warn!(um_id = %um_id, "update manager disconnected");

                if let Some(entry) = self.ums.get_mut(&um_id) {
                    entry.cmd_tx = None;
                }

                if let Some(active) = &mut self.active {
                    // Treated as a reboot: the phase command is re-sent once
                    // the UM reconnects.
                    active.commanded.remove(&um_id);
                }
            }
        }
    }

    async fn handle_update_request(
        &mut self,
        components: Vec<ComponentUpdateRequest>,
        resp: UpdateResponse,
    ) {
        if self.active.is_some() || self.queued_update.is_some() {
            let _ = resp.send(Err(ComponentUpdateError {
                message: UmCoordError::Busy.to_string(),
                statuses: Vec::new(),
            }));
            return;
        }

        if !self.all_connected() {
            debug!("queueing component update until all update managers connect");
            self.queued_update = Some((components, resp));
            return;
        }

        self.start_update(components, resp).await;
    }

    async fn start_update(&mut self, components: Vec<ComponentUpdateRequest>, resp: UpdateResponse) {
        let mut translated = Vec::with_capacity(components.len());

        for mut component in components {
            match self.translator.translate(&component.url) {
                Ok(url) => component.url = url,
                Err(err) => {
                    let _ = resp.send(Err(ComponentUpdateError {
                        message: err.to_string(),
                        statuses: Vec::new(),
                    }));
                    return;
                }
            }
            translated.push(component);
        }

        let mut assignments: HashMap<String, Vec<ComponentUpdateRequest>> = HashMap::new();

        for component in translated {
            let owner = self.ums.iter().find_map(|(um_id, entry)| {
                entry
                    .components
                    .iter()
                    .any(|known| known.id == component.id)
                    .then(|| um_id.clone())
            });

            match owner {
                Some(um_id) => assignments.entry(um_id).or_default().push(component),
                None => {
                    let _ = resp.send(Err(ComponentUpdateError {
                        message: UmCoordError::UnknownComponent(component.id).to_string(),
                        statuses: Vec::new(),
                    }));
                    return;
                }
            }
        }

        if assignments.is_empty() {
            let _ = resp.send(Ok(self.inventory()));
            return;
        }

        let mut order: Vec<String> = assignments.keys().cloned().collect();
        order.sort_by(|a, b| {
            let pa = self.ums.get(a).map(|entry| entry.priority).unwrap_or(0);
            let pb = self.ums.get(b).map(|entry| entry.priority).unwrap_or(0);
            pa.cmp(&pb).then_with(|| a.cmp(b))
        });

        // A plan persisted before a restart resumes at its recorded phase;
        // anything else starts from prepare.
        let (phase, error) = match self.resumed.take() {
            Some((phase, persisted_assignments, error))
                if persisted_assignments == assignments =>
            {
                info!(phase = ?phase, "resuming persisted component update");
                (phase, error)
            }
            _ => (UpdatePhase::Prepare, None),
        };

        info!(ums = order.len(), phase = ?phase, "start component update");

        self.active = Some(ActiveUpdate {
            phase,
            order,
            assignments,
            current: 0,
            commanded: HashSet::new(),
            touched: HashSet::new(),
            error,
            resp: Some(resp),
        });

        self.persist();
        self.advance().await;
    }

    /// Drive the active update forward as far as the reported UM states
    /// allow: command the next pending UM, hop phases when every UM has
    /// reached the current target, finish or fail at the end.
    async fn advance(&mut self) {
        loop {
            let Some(active) = &mut self.active else {
                return;
            };

            let target = active.phase.target_state();

            // Skip UMs that already reached the target state.
            while active.current < active.order.len() {
                let um_id = &active.order[active.current];
                let reached = self
                    .ums
                    .get(um_id)
                    .is_some_and(|entry| entry.state == target);

                if !reached {
                    break;
                }

                active.current += 1;
            }

            if active.current >= active.order.len() {
                self.finish_phase().await;
                continue;
            }

            let um_id = active.order[active.current].clone();

            if active.commanded.contains(&um_id) {
                // Waiting on this UM's report (or its reconnect).
                return;
            }

            let Some(entry) = self.ums.get(&um_id) else {
                error!(um_id = %um_id, "assigned update manager vanished");
                return;
            };

            let Some(cmd_tx) = entry.cmd_tx.clone() else {
                // Disconnected; resumed on reconnect.
                return;
            };

            let assignment = active.assignments.get(&um_id).cloned().unwrap_or_default();
            let request = active.phase.request(&assignment);

            debug!(um_id = %um_id, phase = ?active.phase, "send phase command");

            active.commanded.insert(um_id.clone());
            active.touched.insert(um_id.clone());

            if cmd_tx.send(request).await.is_err() {
                warn!(um_id = %um_id, "can't send phase command, session gone");
                if let Some(active) = &mut self.active {
                    active.commanded.remove(&um_id);
                }
            }

            return;
        }
    }

    async fn finish_phase(&mut self) {
        let Some(active) = &mut self.active else {
            return;
        };

        match active.phase {
            UpdatePhase::Prepare => {
                active.phase = UpdatePhase::Update;
                active.current = 0;
                active.commanded.clear();
                self.persist();
            }
            UpdatePhase::Update => {
                active.phase = UpdatePhase::Apply;
                active.current = 0;
                active.commanded.clear();
                self.persist();
            }
            UpdatePhase::Apply => {
                info!("component update complete");

                let resp = active.resp.take();
                self.active = None;
                self.persist();

                if let Some(resp) = resp {
                    let _ = resp.send(Ok(self.inventory()));
                }
            }
            UpdatePhase::Revert => {
                let message = active
                    .error
                    .clone()
                    .unwrap_or_else(|| "update manager failed".to_string());

                warn!(error = %message, "component update reverted");

                let resp = active.resp.take();
                self.active = None;
                self.persist();

                if let Some(resp) = resp {
                    let _ = resp.send(Err(ComponentUpdateError {
                        message,
                        statuses: self.error_statuses(),
                    }));
                }
            }
        }
    }

    /// Switch the active update to the revert phase, rolling back every UM
    /// that was touched.
    async fn begin_revert(&mut self, error: String) {
        let Some(active) = &mut self.active else {
            return;
        };

        if active.phase == UpdatePhase::Revert {
            return;
        }

        warn!(error = %error, "reverting component update");

        active.error = Some(error);
        active.phase = UpdatePhase::Revert;
        active.current = 0;
        active.commanded.clear();
        active.order = active
            .order
            .iter()
            .filter(|um_id| active.touched.contains(*um_id))
            .cloned()
            .collect();

        self.persist();
    }

    fn all_connected(&self) -> bool {
        self.clients.iter().all(|client| {
            self.ums
                .get(&client.um_id)
                .is_some_and(|entry| entry.cmd_tx.is_some())
        })
    }

    /// Flattened component inventory across every UM, ordered by id.
    fn inventory(&self) -> Vec<ComponentStatus> {
        let mut statuses: Vec<ComponentStatus> = self
            .ums
            .values()
            .flat_map(|entry| entry.components.iter().cloned())
            .collect();

        statuses.sort_by(|a, b| {
            a.id.cmp(&b.id)
                .then_with(|| a.vendor_version.cmp(&b.vendor_version))
        });

        statuses
    }

    fn error_statuses(&self) -> Vec<ComponentStatus> {
        self.ums
            .values()
            .flat_map(|entry| entry.components.iter().cloned())
            .filter(|status| status.status == EntityStatus::Error)
            .collect()
    }

    fn persist(&self) {
        let plan = match &self.active {
            Some(active) => PersistedPlan {
                version: crate::update::PLAN_FORMAT_VERSION,
                phase: Some(active.phase),
                assignments: active.assignments.clone(),
                error: active.error.clone(),
            },
            None => PersistedPlan {
                version: crate::update::PLAN_FORMAT_VERSION,
                phase: None,
                assignments: HashMap::new(),
                error: None,
            },
        };

        match serde_json::to_value(&plan) {
            Ok(raw) => {
                if let Err(err) = self.store.set_um_state(raw) {
                    error!(error = %err, "can't store UM coordinator state");
                }
            }
            Err(err) => error!(error = %err, "can't serialize UM coordinator state"),
        }
    }
}

/// Pump one UM session: forward phase commands out, status reports in.
async fn run_session(mut connection: Box<dyn UmConnection>, event_tx: mpsc::Sender<Event>) {
    let Some(first) = connection.next_status().await else {
        return;
    };

    let um_id = first.um_id.clone();
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<UmRequest>(8);

    if event_tx
        .send(Event::Connected {
            um_id: um_id.clone(),
            state: first.state,
            components: first.components,
            cmd_tx,
        })
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            request = cmd_rx.recv() => match request {
                Some(request) => {
                    if connection.send(request).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            report = connection.next_status() => match report {
                Some(report) => {
                    if event_tx.send(Event::Status(report)).await.is_err() {
                        return;
                    }
                }
                None => break,
            },
        }
    }

    let _ = event_tx.send(Event::Disconnected { um_id }).await;
}
