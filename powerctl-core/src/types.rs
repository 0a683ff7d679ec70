use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Component identifier of a compute node (opaque upstream id).
pub type NodeId = String;

/// Component identifier of a baseboard management controller.
pub type BmcId = String;

// ─── Power operations ─────────────────────────────────────────

/// The power operation a transition applies to its target nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PowerOperation {
    On,
    Off,
    SoftOff,
    HardOff,
    SoftRestart,
    HardRestart,
    Nmi,
}

impl PowerOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerOperation::On => "on",
            PowerOperation::Off => "off",
            PowerOperation::SoftOff => "soft-off",
            PowerOperation::HardOff => "hard-off",
            PowerOperation::SoftRestart => "soft-restart",
            PowerOperation::HardRestart => "hard-restart",
            PowerOperation::Nmi => "nmi",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "on" => PowerOperation::On,
            "off" => PowerOperation::Off,
            "soft-off" => PowerOperation::SoftOff,
            "hard-off" => PowerOperation::HardOff,
            "soft-restart" => PowerOperation::SoftRestart,
            "hard-restart" => PowerOperation::HardRestart,
            "nmi" => PowerOperation::Nmi,
            _ => return None,
        })
    }

    /// Redfish ResetType for the ComputerSystem.Reset action.
    pub fn reset_type(&self) -> &'static str {
        match self {
            PowerOperation::On => "On",
            PowerOperation::Off => "ForceOff",
            PowerOperation::SoftOff => "GracefulShutdown",
            PowerOperation::HardOff => "ForceOff",
            PowerOperation::SoftRestart => "GracefulRestart",
            PowerOperation::HardRestart => "ForceRestart",
            PowerOperation::Nmi => "Nmi",
        }
    }

    /// Power state the node must reach for verification to pass.
    /// `None` means the operation is not verified (nmi).
    pub fn expected_power_state(&self) -> Option<PowerState> {
        match self {
            PowerOperation::On | PowerOperation::SoftRestart | PowerOperation::HardRestart => {
                Some(PowerState::On)
            }
            PowerOperation::Off | PowerOperation::SoftOff | PowerOperation::HardOff => {
                Some(PowerState::Off)
            }
            PowerOperation::Nmi => None,
        }
    }
}

// ─── Power state (as read from the BMC) ───────────────────────

/// Redfish PowerState values the executor recognises. Anything else in a
/// response is a protocol error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    On,
    Off,
    PoweringOn,
    PoweringOff,
    Unknown,
}

impl PowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::On => "On",
            PowerState::Off => "Off",
            PowerState::PoweringOn => "PoweringOn",
            PowerState::PoweringOff => "PoweringOff",
            PowerState::Unknown => "Unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "On" => PowerState::On,
            "Off" => PowerState::Off,
            "PoweringOn" => PowerState::PoweringOn,
            "PoweringOff" => PowerState::PoweringOff,
            "Unknown" => PowerState::Unknown,
            _ => return None,
        })
    }
}

// ─── Transition ───────────────────────────────────────────────

/// Lifecycle state of a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransitionState {
    Pending,
    Planned,
    InProgress,
    Completed,
    PartiallyFailed,
    Failed,
    Cancelled,
    Aborted,
}

impl TransitionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionState::Pending => "pending",
            TransitionState::Planned => "planned",
            TransitionState::InProgress => "in-progress",
            TransitionState::Completed => "completed",
            TransitionState::PartiallyFailed => "partially-failed",
            TransitionState::Failed => "failed",
            TransitionState::Cancelled => "cancelled",
            TransitionState::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => TransitionState::Pending,
            "planned" => TransitionState::Planned,
            "in-progress" => TransitionState::InProgress,
            "completed" => TransitionState::Completed,
            "partially-failed" => TransitionState::PartiallyFailed,
            "failed" => TransitionState::Failed,
            "cancelled" => TransitionState::Cancelled,
            "aborted" => TransitionState::Aborted,
            _ => return None,
        })
    }

    /// Terminal transitions are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransitionState::Completed
                | TransitionState::PartiallyFailed
                | TransitionState::Failed
                | TransitionState::Cancelled
                | TransitionState::Aborted
        )
    }
}

/// Aggregate task counts carried on the transition row.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionAggregate {
    pub task_count: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub cancelled: u32,
}

/// One user request to change power state on a set of nodes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transition {
    pub id: Uuid,
    pub operation: PowerOperation,
    pub state: TransitionState,
    /// Caller-supplied idempotency/request correlation id.
    pub request_id: String,
    /// Subject of the authenticated caller (opaque to the core).
    pub caller_sub: String,
    pub dry_run: bool,
    /// Per-task deadline in milliseconds, from enqueue through verification.
    pub deadline_ms: i64,
    pub aggregate: TransitionAggregate,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ─── Task ─────────────────────────────────────────────────────

/// Lifecycle state of a per-node task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Pending,
    /// Dry-run only: routing resolved, never dispatched.
    Planned,
    Queued,
    Running,
    Retry,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Planned => "planned",
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Retry => "retry",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => TaskState::Pending,
            "planned" => TaskState::Planned,
            "queued" => TaskState::Queued,
            "running" => TaskState::Running,
            "retry" => TaskState::Retry,
            "succeeded" => TaskState::Succeeded,
            "failed" => TaskState::Failed,
            "cancelled" => TaskState::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// Per-node work item belonging to a transition. Keyed by
/// (transition_id, node_id).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransitionTask {
    pub transition_id: Uuid,
    pub node_id: NodeId,
    pub state: TaskState,
    pub attempt: u32,
    /// Set once routing resolves.
    pub bmc_id: Option<BmcId>,
    pub error_code: Option<String>,
    pub error_detail: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Power state observed by verification.
    pub observed_state: Option<PowerState>,
}

impl TransitionTask {
    pub fn new(transition_id: Uuid, node_id: NodeId) -> Self {
        Self {
            transition_id,
            node_id,
            state: TaskState::Pending,
            attempt: 0,
            bmc_id: None,
            error_code: None,
            error_detail: None,
            started_at: None,
            ended_at: None,
            observed_state: None,
        }
    }
}

// ─── Mapping cache rows ───────────────────────────────────────

/// Where a mapping row came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingSource {
    Topology,
    Manual,
}

impl MappingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingSource::Topology => "topology",
            MappingSource::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "topology" => MappingSource::Topology,
            "manual" => MappingSource::Manual,
            _ => return None,
        })
    }
}

/// A BMC's reachable endpoint. `endpoint = None` is a tombstone: the BMC is
/// known to topology but has no usable address.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BmcEndpoint {
    pub bmc_id: BmcId,
    /// Normalised https origin (`scheme://host[:port]`, no path).
    pub endpoint: Option<String>,
    pub credential_id: Option<String>,
    pub insecure_skip_verify: bool,
    pub source: MappingSource,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Routing link from a node to its managing BMC.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeBmcLink {
    pub node_id: NodeId,
    pub bmc_id: BmcId,
    pub source: MappingSource,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fully resolved routing for one node, ready for dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingRecord {
    pub node_id: NodeId,
    pub bmc_id: BmcId,
    pub endpoint: String,
    pub credential_id: String,
    pub insecure_skip_verify: bool,
}

// ─── Outbox ───────────────────────────────────────────────────

/// Durable event row, written in the same transaction as the state change
/// that produced it. Consumed by an external relay.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    /// e.g. `power.transition.planned`, `power.task.succeeded`.
    pub subject: String,
    /// Post-change snapshot of the resource.
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    pub fn new(subject: String, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            subject,
            payload,
            created_at: Utc::now(),
            delivered_at: None,
        }
    }

    /// Outbox row for a transition state change.
    pub fn for_transition(transition: &Transition) -> Self {
        Self::new(
            format!("power.transition.{}", transition.state.as_str()),
            serde_json::to_value(transition).unwrap_or(serde_json::Value::Null),
        )
    }

    /// Outbox row for a task state change.
    pub fn for_task(task: &TransitionTask) -> Self {
        Self::new(
            format!("power.task.{}", task.state.as_str()),
            serde_json::to_value(task).unwrap_or(serde_json::Value::Null),
        )
    }
}

// ─── Credentials ──────────────────────────────────────────────

/// Resolved BMC credential. Never persisted by the core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BmcCredential {
    pub username: String,
    pub password: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_type_mapping_is_exact() {
        assert_eq!(PowerOperation::On.reset_type(), "On");
        assert_eq!(PowerOperation::Off.reset_type(), "ForceOff");
        assert_eq!(PowerOperation::SoftOff.reset_type(), "GracefulShutdown");
        assert_eq!(PowerOperation::HardOff.reset_type(), "ForceOff");
        assert_eq!(PowerOperation::SoftRestart.reset_type(), "GracefulRestart");
        assert_eq!(PowerOperation::HardRestart.reset_type(), "ForceRestart");
        assert_eq!(PowerOperation::Nmi.reset_type(), "Nmi");
    }

    #[test]
    fn expected_state_per_operation() {
        assert_eq!(
            PowerOperation::On.expected_power_state(),
            Some(PowerState::On)
        );
        assert_eq!(
            PowerOperation::SoftRestart.expected_power_state(),
            Some(PowerState::On)
        );
        assert_eq!(
            PowerOperation::HardOff.expected_power_state(),
            Some(PowerState::Off)
        );
        assert_eq!(PowerOperation::Nmi.expected_power_state(), None);
    }

    #[test]
    fn state_string_round_trips() {
        for s in [
            TransitionState::Pending,
            TransitionState::Planned,
            TransitionState::InProgress,
            TransitionState::Completed,
            TransitionState::PartiallyFailed,
            TransitionState::Failed,
            TransitionState::Cancelled,
            TransitionState::Aborted,
        ] {
            assert_eq!(TransitionState::parse(s.as_str()), Some(s));
        }
        for s in [
            TaskState::Pending,
            TaskState::Planned,
            TaskState::Queued,
            TaskState::Running,
            TaskState::Retry,
            TaskState::Succeeded,
            TaskState::Failed,
            TaskState::Cancelled,
        ] {
            assert_eq!(TaskState::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn outbox_subjects() {
        let mut t = Transition {
            id: Uuid::now_v7(),
            operation: PowerOperation::On,
            state: TransitionState::InProgress,
            request_id: "r".into(),
            caller_sub: "s".into(),
            dry_run: false,
            deadline_ms: 300_000,
            aggregate: TransitionAggregate::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(
            OutboxEntry::for_transition(&t).subject,
            "power.transition.in-progress"
        );
        t.state = TransitionState::PartiallyFailed;
        assert_eq!(
            OutboxEntry::for_transition(&t).subject,
            "power.transition.partially-failed"
        );

        let mut task = TransitionTask::new(t.id, "node-a".into());
        task.state = TaskState::Succeeded;
        assert_eq!(OutboxEntry::for_task(&task).subject, "power.task.succeeded");
    }
}
