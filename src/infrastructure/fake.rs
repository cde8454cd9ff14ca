use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::infrastructure::{InfrastructureError, LaunchRequest, Machine, MachinePhase, ProviderId};
use crate::offering::{CapacityType, Zone};

/// What happens on the next `create()` call.
#[derive(Debug, Clone)]
pub enum CreateBehavior {
    /// Happy path — returns a Pending machine.
    Succeed,
    /// Returns a machine that is already Running with a node attached.
    SucceedRunning,
    /// Returns after sleeping for the given duration.
    SucceedAfterDelay(Duration),
    /// The offering isn't available (sold out, wrong zone, etc).
    OfferingUnavailable,
    /// General creation failure.
    CreationFailed(String),
    /// Network/API blowup.
    InternalError(String),
}

/// What happens on the next `delete()` call.
#[derive(Debug, Clone)]
pub enum DeleteBehavior {
    /// Machine removed (or `NotFound` if there was none).
    Succeed,
    /// Returns Ok(()) but the machine persists (silent no-op).
    Noop,
    /// Deletion failed.
    Fail(String),
}

/// Logged record of a `create()` call.
#[derive(Debug, Clone)]
pub struct CreateCall {
    pub node_claim: String,
    pub instance_type: String,
    pub zone: Zone,
    pub capacity_type: CapacityType,
    pub labels: BTreeMap<String, String>,
    pub result: Option<Machine>,
}

/// Logged record of a `delete()` call.
#[derive(Debug, Clone)]
pub struct DeleteCall {
    pub node_claim: String,
}

/// Interior state behind the Arc<Mutex<_>>.
#[derive(Debug)]
struct FakeInfrastructureState {
    create_behaviors: VecDeque<CreateBehavior>,
    delete_behaviors: VecDeque<DeleteBehavior>,
    default_create: CreateBehavior,
    default_delete: DeleteBehavior,
    machines: BTreeMap<String, Machine>,
    create_calls: Vec<CreateCall>,
    delete_calls: Vec<DeleteCall>,
    list_calls: usize,
}

/// A deterministic, in-memory delegate for testing failure modes.
///
/// Each call to `create()`/`delete()` pops the next behavior from a queue.
/// When the queue is empty, the configured default applies. Created machines
/// are kept by NodeClaim name so `get`/`find`/`list` see them.
#[derive(Debug, Clone)]
pub struct FakeInfrastructure {
    state: Arc<Mutex<FakeInfrastructureState>>,
    next_id: Arc<AtomicU64>,
}

impl Default for FakeInfrastructure {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeInfrastructure {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeInfrastructureState {
                create_behaviors: VecDeque::new(),
                delete_behaviors: VecDeque::new(),
                default_create: CreateBehavior::Succeed,
                default_delete: DeleteBehavior::Succeed,
                machines: BTreeMap::new(),
                create_calls: Vec::new(),
                delete_calls: Vec::new(),
                list_calls: 0,
            })),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    // ── Builder methods ──────────────────────────────────────────────

    pub fn on_next_create(self, behavior: CreateBehavior) -> Self {
        self.state
            .lock()
            .unwrap()
            .create_behaviors
            .push_back(behavior);
        self
    }

    pub fn on_next_delete(self, behavior: DeleteBehavior) -> Self {
        self.state
            .lock()
            .unwrap()
            .delete_behaviors
            .push_back(behavior);
        self
    }

    pub fn with_default_create(self, behavior: CreateBehavior) -> Self {
        self.state.lock().unwrap().default_create = behavior;
        self
    }

    pub fn with_default_delete(self, behavior: DeleteBehavior) -> Self {
        self.state.lock().unwrap().default_delete = behavior;
        self
    }

    /// Seed a machine as if it had been created earlier.
    pub fn with_machine(self, machine: Machine) -> Self {
        self.state
            .lock()
            .unwrap()
            .machines
            .insert(machine.node_claim.clone(), machine);
        self
    }

    // ── Introspection ────────────────────────────────────────────────

    pub fn create_calls(&self) -> Vec<CreateCall> {
        self.state.lock().unwrap().create_calls.clone()
    }

    pub fn delete_calls(&self) -> Vec<DeleteCall> {
        self.state.lock().unwrap().delete_calls.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().unwrap().list_calls
    }

    /// Move a machine through its lifecycle, e.g. to `Running` or `Failed`.
    pub fn set_phase(&self, node_claim: &str, phase: MachinePhase) {
        if let Some(machine) = self.state.lock().unwrap().machines.get_mut(node_claim) {
            machine.phase = phase;
            if phase == MachinePhase::Running && machine.node_name.is_none() {
                machine.node_name = Some(machine.name.clone());
            }
        }
    }

    // ── Infrastructure implementation ────────────────────────────────

    fn new_machine(&self, request: &LaunchRequest<'_>, phase: MachinePhase) -> Machine {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("fake-machine-{n}");
        Machine {
            provider_id: Some(ProviderId(format!("fake:///{}/{name}", request.offering.zone))),
            node_name: (phase == MachinePhase::Running).then(|| name.clone()),
            name,
            node_claim: request.node_claim.to_string(),
            labels: request.labels.clone(),
            phase,
        }
    }

    pub async fn create(&self, request: &LaunchRequest<'_>) -> Result<Machine, InfrastructureError> {
        let behavior = {
            let mut state = self.state.lock().unwrap();
            state
                .create_behaviors
                .pop_front()
                .unwrap_or_else(|| state.default_create.clone())
        };

        let result = match behavior {
            CreateBehavior::Succeed => Ok(self.new_machine(request, MachinePhase::Pending)),
            CreateBehavior::SucceedRunning => Ok(self.new_machine(request, MachinePhase::Running)),
            CreateBehavior::SucceedAfterDelay(d) => {
                tokio::time::sleep(d).await;
                Ok(self.new_machine(request, MachinePhase::Pending))
            }
            CreateBehavior::OfferingUnavailable => Err(InfrastructureError::OfferingUnavailable(
                format!(
                    "{} not available in {}",
                    request.instance_type.name, request.offering.zone
                ),
            )),
            CreateBehavior::CreationFailed(message) => {
                Err(InfrastructureError::CreationFailed { message })
            }
            CreateBehavior::InternalError(msg) => {
                Err(InfrastructureError::Internal(anyhow::anyhow!(msg)))
            }
        };

        let mut state = self.state.lock().unwrap();
        if let Ok(machine) = &result {
            state
                .machines
                .insert(machine.node_claim.clone(), machine.clone());
        }
        state.create_calls.push(CreateCall {
            node_claim: request.node_claim.to_string(),
            instance_type: request.instance_type.name.clone(),
            zone: request.offering.zone.clone(),
            capacity_type: request.offering.capacity_type,
            labels: request.labels.clone(),
            result: result.as_ref().ok().cloned(),
        });

        result
    }

    pub async fn get(&self, provider_id: &ProviderId) -> Result<Machine, InfrastructureError> {
        self.state
            .lock()
            .unwrap()
            .machines
            .values()
            .find(|m| m.provider_id.as_ref() == Some(provider_id))
            .cloned()
            .ok_or_else(|| InfrastructureError::NotFound(provider_id.to_string()))
    }

    pub async fn find(&self, node_claim: &str) -> Result<Option<Machine>, InfrastructureError> {
        Ok(self.state.lock().unwrap().machines.get(node_claim).cloned())
    }

    pub async fn delete(&self, node_claim: &str) -> Result<(), InfrastructureError> {
        let mut state = self.state.lock().unwrap();
        let behavior = state
            .delete_behaviors
            .pop_front()
            .unwrap_or_else(|| state.default_delete.clone());
        state.delete_calls.push(DeleteCall {
            node_claim: node_claim.to_string(),
        });

        match behavior {
            DeleteBehavior::Succeed => match state.machines.remove(node_claim) {
                Some(_) => Ok(()),
                None => Err(InfrastructureError::NotFound(node_claim.to_string())),
            },
            DeleteBehavior::Noop => Ok(()),
            DeleteBehavior::Fail(message) => Err(InfrastructureError::DeletionFailed { message }),
        }
    }

    pub async fn list(&self) -> Result<Vec<Machine>, InfrastructureError> {
        let mut state = self.state.lock().unwrap();
        state.list_calls += 1;
        Ok(state.machines.values().cloned().collect())
    }
}
