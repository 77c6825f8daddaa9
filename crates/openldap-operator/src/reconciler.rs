//! # Reconciler
//!
//! Maps config, relation state and leadership to a unit status and, when all
//! gates pass, a pod spec handed to the workload.

use crate::config::CharmConfig;
use crate::error::{OperatorError, Result};
use crate::events::{
    ActionRequest, ActionResult, Disposition, HandleOutcome, MasterChanged, RelationJoined,
    Trigger, ADMIN_PASSWORD_UNSET,
};
use crate::password::{pwgen, ADMIN_PASSWORD_LENGTH};
use crate::podspec::PodSpec;
use crate::state::{LeaderData, MemoryStore, StateStore, UnitState};
use crate::status::{StatusHistory, StatusReporter, UnitStatus};
use crate::workload::{ApplyOutcome, MemoryWorkload, Workload};
use crate::{DATABASE_NAME, WORKLOAD_NAME};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

pub const WAITING_FOR_DATABASE: &str = "Waiting for database relation";
pub const WAITING_FOR_WORKLOAD: &str = "waiting for Pebble in workload container";
pub const ASSEMBLING: &str = "Assembling pod spec";
pub const SETTING: &str = "Setting pod spec";
pub const UNKNOWN_LEADERSHIP: &str = "Unable to determine leadership";
pub const UNREADABLE_LEADER_DATA: &str = "Unable to read leader data";

/// Whether this unit currently holds leadership
#[async_trait]
pub trait Leadership: Send + Sync {
    async fn is_leader(&self) -> Result<bool>;
}

/// Leadership flag set by the host
#[derive(Debug, Default)]
pub struct StaticLeadership {
    leader: AtomicBool,
}

impl StaticLeadership {
    pub fn new(leader: bool) -> Self {
        Self {
            leader: AtomicBool::new(leader),
        }
    }

    pub fn set(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }
}

#[async_trait]
impl Leadership for StaticLeadership {
    async fn is_leader(&self) -> Result<bool> {
        Ok(self.leader.load(Ordering::SeqCst))
    }
}

/// Our side of the database relation
#[async_trait]
pub trait DatabaseRelation: Send + Sync {
    /// Ask the database provider for a logical database
    async fn request_database(&self, name: &str) -> Result<()>;
}

/// Records database requests in memory
#[derive(Debug, Default)]
pub struct RecordedRelation {
    requested: Mutex<Option<String>>,
}

impl RecordedRelation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requested(&self) -> Option<String> {
        self.requested.lock().ok().and_then(|r| r.clone())
    }
}

#[async_trait]
impl DatabaseRelation for RecordedRelation {
    async fn request_database(&self, name: &str) -> Result<()> {
        if let Ok(mut requested) = self.requested.lock() {
            *requested = Some(name.to_string());
        }
        Ok(())
    }
}

/// Outcome of one reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub status: UnitStatus,
    pub disposition: Disposition,

    /// The spec that reached the workload, if any
    pub applied: Option<PodSpec>,
}

impl ReconcileOutcome {
    fn done(status: UnitStatus) -> Self {
        Self {
            status,
            disposition: Disposition::Done,
            applied: None,
        }
    }

    fn retry(status: UnitStatus) -> Self {
        Self {
            status,
            disposition: Disposition::Retry,
            applied: None,
        }
    }
}

/// The operator: reconciliation plus relation and action handlers
pub struct Reconciler {
    config: RwLock<CharmConfig>,
    unit_state: UnitState,
    leader_data: LeaderData,
    leadership: Arc<dyn Leadership>,
    relation: Arc<dyn DatabaseRelation>,
    workload: Arc<dyn Workload>,
    status: Arc<dyn StatusReporter>,
}

impl Reconciler {
    pub fn builder() -> ReconcilerBuilder {
        ReconcilerBuilder::new()
    }

    pub async fn config(&self) -> CharmConfig {
        self.config.read().await.clone()
    }

    pub async fn set_config(&self, config: CharmConfig) {
        *self.config.write().await = config;
    }

    pub fn unit_state(&self) -> &UnitState {
        &self.unit_state
    }

    pub fn current_status(&self) -> Option<UnitStatus> {
        self.status.current()
    }

    fn set_status(&self, status: UnitStatus) {
        self.status.set_status(status);
    }

    async fn is_leader(&self) -> bool {
        match self.leadership.is_leader().await {
            Ok(leader) => leader,
            Err(e) => {
                warn!("Leadership check failed, acting as follower: {}", e);
                false
            }
        }
    }

    /// Route a trigger to its handler
    pub async fn handle(&self, trigger: &Trigger) -> HandleOutcome {
        debug!("Handling {}", trigger);
        match trigger {
            Trigger::DatabaseRelationJoined(event) => self.on_database_relation_joined(event).await,
            Trigger::MasterChanged(event) => self.on_master_changed(event).await,
            Trigger::DatabaseRelationBroken => self.on_database_relation_broken().await,
            Trigger::Action { name } => {
                HandleOutcome::done().with_action(self.run_action(*name).await)
            }
            Trigger::Start
            | Trigger::ConfigChanged
            | Trigger::LeaderElected
            | Trigger::Upgrade
            | Trigger::DbMasterAvailable => match self.reconcile().await.disposition {
                Disposition::Done => HandleOutcome::done(),
                Disposition::Retry => HandleOutcome::retry(),
            },
        }
    }

    /// Run the gates in order and apply the pod spec when they all pass
    pub async fn reconcile(&self) -> ReconcileOutcome {
        let database = match self.unit_state.database().await {
            Ok(Some(database)) => database,
            Ok(None) => {
                let status = UnitStatus::waiting(WAITING_FOR_DATABASE);
                self.set_status(status.clone());
                return ReconcileOutcome::retry(status);
            }
            Err(e) => {
                error!("Failed to read unit state: {}", e);
                let status = UnitStatus::waiting("Unable to read unit state");
                self.set_status(status.clone());
                return ReconcileOutcome::retry(status);
            }
        };

        match self.leadership.is_leader().await {
            Ok(true) => {}
            Ok(false) => {
                self.set_status(UnitStatus::Active);
                return ReconcileOutcome::done(UnitStatus::Active);
            }
            Err(e) => {
                error!("Failed to determine leadership: {}", e);
                let status = UnitStatus::waiting(UNKNOWN_LEADERSHIP);
                self.set_status(status.clone());
                return ReconcileOutcome::retry(status);
            }
        }

        let config = self.config().await;
        let password_resolvable = match config.admin_password() {
            Some(_) => true,
            None => match self.leader_data.admin_password().await {
                Ok(stored) => stored.is_some(),
                Err(e) => {
                    error!("Failed to read leader data: {}", e);
                    let status = UnitStatus::waiting(UNREADABLE_LEADER_DATA);
                    self.set_status(status.clone());
                    return ReconcileOutcome::retry(status);
                }
            },
        };
        let missing = config.missing_settings(password_resolvable);
        if !missing.is_empty() {
            let missing: Vec<_> = missing.into_iter().collect();
            let status = UnitStatus::blocked(format!(
                "required setting(s) empty: {}",
                missing.join(", ")
            ));
            self.set_status(status.clone());
            return ReconcileOutcome::done(status);
        }

        self.set_status(UnitStatus::maintenance(ASSEMBLING));
        let admin_password = self.resolve_admin_password(&config).await;
        let spec = PodSpec::assemble(WORKLOAD_NAME, &config, &database, &admin_password);

        self.set_status(UnitStatus::maintenance(SETTING));
        match self.workload.apply(&spec).await {
            Ok(outcome) => {
                match outcome {
                    ApplyOutcome::Applied => info!("Pod spec applied"),
                    ApplyOutcome::Unchanged => debug!("Pod spec unchanged"),
                }
                self.set_status(UnitStatus::Active);
                ReconcileOutcome {
                    status: UnitStatus::Active,
                    disposition: Disposition::Done,
                    applied: Some(spec),
                }
            }
            Err(OperatorError::WorkloadUnavailable(reason)) => {
                info!("Workload not reachable yet: {}", reason);
                let status = UnitStatus::waiting(WAITING_FOR_WORKLOAD);
                self.set_status(status.clone());
                ReconcileOutcome::retry(status)
            }
            Err(e) => {
                error!("Failed to apply pod spec: {}", e);
                let status = UnitStatus::blocked(format!("Failed to apply pod spec: {}", e));
                self.set_status(status.clone());
                ReconcileOutcome::done(status)
            }
        }
    }

    /// Assemble the spec the current inputs would produce, without applying it
    pub async fn render(&self) -> Option<PodSpec> {
        let database = self.unit_state.database().await.ok().flatten()?;
        let config = self.config().await;
        let admin_password = self.resolve_admin_password(&config).await;
        Some(PodSpec::assemble(WORKLOAD_NAME, &config, &database, &admin_password))
    }

    /// The LDAP admin password.
    ///
    /// Returns the stored credential, otherwise generates and stores one when
    /// this unit is the leader, otherwise an empty string.
    pub async fn get_admin_password(&self) -> String {
        match self.leader_data.admin_password().await {
            Ok(Some(password)) => return password,
            Ok(None) => {}
            Err(e) => {
                warn!("Failed to read admin password: {}", e);
                return String::new();
            }
        }

        if !self.is_leader().await {
            return String::new();
        }

        let password = pwgen(Some(ADMIN_PASSWORD_LENGTH));
        match self.leader_data.set_admin_password(&password).await {
            Ok(()) => {
                info!("Generated LDAP admin password");
                password
            }
            Err(e) => {
                error!("Failed to store generated admin password: {}", e);
                String::new()
            }
        }
    }

    /// Configured admin password if non-empty, otherwise `get_admin_password`
    pub async fn resolve_admin_password(&self, config: &CharmConfig) -> String {
        match config.admin_password() {
            Some(password) => password.to_string(),
            None => self.get_admin_password().await,
        }
    }

    pub async fn run_action(&self, action: ActionRequest) -> ActionResult {
        match action {
            ActionRequest::GetAdminPassword => {
                let config = self.config().await;
                let password = self.resolve_admin_password(&config).await;
                if password.is_empty() {
                    ActionResult::Failed {
                        message: ADMIN_PASSWORD_UNSET.to_string(),
                    }
                } else {
                    ActionResult::Success {
                        results: BTreeMap::from([("admin-password".to_string(), password)]),
                    }
                }
            }
        }
    }

    pub async fn on_database_relation_joined(&self, event: &RelationJoined) -> HandleOutcome {
        if self.is_leader().await {
            if let Err(e) = self.relation.request_database(DATABASE_NAME).await {
                warn!("Failed to request database {}: {}", DATABASE_NAME, e);
                return HandleOutcome::retry();
            }
            info!("Requested database {}", DATABASE_NAME);
            HandleOutcome::done()
        } else if event.database.as_deref() != Some(DATABASE_NAME) {
            // The leader has not set the request yet; this unit may become
            // leader and have to do it.
            debug!("Deferring relation-joined until the leader requests {}", DATABASE_NAME);
            HandleOutcome::retry()
        } else {
            HandleOutcome::done()
        }
    }

    pub async fn on_master_changed(&self, event: &MasterChanged) -> HandleOutcome {
        if event.database.as_deref() != Some(DATABASE_NAME) {
            debug!(
                "Ignoring master change for database {:?}",
                event.database.as_deref()
            );
            return HandleOutcome::done();
        }

        if let Err(e) = self.unit_state.set_database(event.master.as_ref()).await {
            error!("Failed to store database connection: {}", e);
            return HandleOutcome::retry();
        }

        match &event.master {
            Some(master) => {
                info!("Database primary is {}:{}", master.host, master.port);
                HandleOutcome::done().emit(Trigger::DbMasterAvailable)
            }
            None => {
                info!("No database primary available");
                HandleOutcome::done()
            }
        }
    }

    pub async fn on_database_relation_broken(&self) -> HandleOutcome {
        if let Err(e) = self.unit_state.set_database(None).await {
            error!("Failed to clear database connection: {}", e);
            return HandleOutcome::retry();
        }
        self.set_status(UnitStatus::waiting(WAITING_FOR_DATABASE));
        HandleOutcome::done()
    }
}

/// Builder for a reconciler, unset collaborators default to in-memory ones
pub struct ReconcilerBuilder {
    config: CharmConfig,
    unit_store: Option<Arc<dyn StateStore>>,
    leader_store: Option<Arc<dyn StateStore>>,
    leadership: Option<Arc<dyn Leadership>>,
    relation: Option<Arc<dyn DatabaseRelation>>,
    workload: Option<Arc<dyn Workload>>,
    status: Option<Arc<dyn StatusReporter>>,
}

impl ReconcilerBuilder {
    pub fn new() -> Self {
        Self {
            config: CharmConfig::default(),
            unit_store: None,
            leader_store: None,
            leadership: None,
            relation: None,
            workload: None,
            status: None,
        }
    }

    pub fn config(mut self, config: CharmConfig) -> Self {
        self.config = config;
        self
    }

    pub fn unit_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.unit_store = Some(store);
        self
    }

    pub fn leader_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.leader_store = Some(store);
        self
    }

    pub fn leadership(mut self, leadership: Arc<dyn Leadership>) -> Self {
        self.leadership = Some(leadership);
        self
    }

    pub fn relation(mut self, relation: Arc<dyn DatabaseRelation>) -> Self {
        self.relation = Some(relation);
        self
    }

    pub fn workload(mut self, workload: Arc<dyn Workload>) -> Self {
        self.workload = Some(workload);
        self
    }

    pub fn status(mut self, status: Arc<dyn StatusReporter>) -> Self {
        self.status = Some(status);
        self
    }

    pub fn build(self) -> Reconciler {
        Reconciler {
            config: RwLock::new(self.config),
            unit_state: UnitState::new(
                self.unit_store
                    .unwrap_or_else(|| Arc::new(MemoryStore::new())),
            ),
            leader_data: LeaderData::new(
                self.leader_store
                    .unwrap_or_else(|| Arc::new(MemoryStore::new())),
            ),
            leadership: self
                .leadership
                .unwrap_or_else(|| Arc::new(StaticLeadership::default())),
            relation: self
                .relation
                .unwrap_or_else(|| Arc::new(RecordedRelation::new())),
            workload: self
                .workload
                .unwrap_or_else(|| Arc::new(MemoryWorkload::new())),
            status: self
                .status
                .unwrap_or_else(|| Arc::new(StatusHistory::new())),
        }
    }
}

impl Default for ReconcilerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
