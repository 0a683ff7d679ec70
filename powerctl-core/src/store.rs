use crate::types::{
    BmcEndpoint, NodeBmcLink, OutboxEntry, Transition, TransitionState, TransitionTask,
};
use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Upsert/delete counts reported by a mapping replace.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MappingReplaceCounts {
    pub endpoints_upserted: u32,
    pub endpoints_deleted: u32,
    pub links_upserted: u32,
    pub links_deleted: u32,
}

/// Persistence trait for all power-control state.
///
/// Mutations that change transition or task state take the outbox rows they
/// produce and persist them atomically with the change. The engine and
/// synchronizer operate exclusively through this trait, enabling pluggable
/// backends (MemoryStore for tests/dev, Postgres for production).
#[async_trait]
pub trait PowerStore: Send + Sync {
    // ── Transitions ──

    /// Persist a new transition with its task rows and creation outbox rows
    /// in one transaction.
    async fn create_transition(
        &self,
        transition: &Transition,
        tasks: &[TransitionTask],
        outbox: &[OutboxEntry],
    ) -> Result<()>;

    async fn load_transition(&self, id: Uuid) -> Result<Option<Transition>>;

    async fn list_transitions(
        &self,
        state: Option<TransitionState>,
        limit: usize,
    ) -> Result<Vec<Transition>>;

    /// Whole-row update plus its outbox row, atomically. Rejects updates to
    /// transitions already in a terminal state.
    async fn update_transition(&self, transition: &Transition, outbox: &OutboxEntry) -> Result<()>;

    // ── Tasks ──

    async fn load_tasks(&self, transition_id: Uuid) -> Result<Vec<TransitionTask>>;

    async fn load_task(&self, transition_id: Uuid, node_id: &str)
        -> Result<Option<TransitionTask>>;

    /// Whole-row update plus its outbox row, atomically.
    async fn update_task(&self, task: &TransitionTask, outbox: &OutboxEntry) -> Result<()>;

    // ── Mapping cache ──

    async fn get_link(&self, node_id: &str) -> Result<Option<NodeBmcLink>>;

    async fn get_endpoint(&self, bmc_id: &str) -> Result<Option<BmcEndpoint>>;

    async fn list_endpoints(&self) -> Result<Vec<BmcEndpoint>>;

    /// Operator-driven single-endpoint upsert (`source = manual`).
    async fn upsert_endpoint(&self, endpoint: &BmcEndpoint) -> Result<()>;

    /// Atomically replace the whole mapping cache (delete-then-insert in one
    /// transaction). A concurrent resolver sees either the old or the new
    /// cache, never a mix.
    async fn replace_mappings(
        &self,
        endpoints: &[BmcEndpoint],
        links: &[NodeBmcLink],
    ) -> Result<MappingReplaceCounts>;

    // ── Outbox ──

    /// Oldest-first undelivered rows, for the external relay.
    async fn list_undelivered_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>>;

    async fn mark_outbox_delivered(&self, ids: &[Uuid]) -> Result<()>;
}
