use crate::store::{MappingReplaceCounts, PowerStore};
use crate::types::{
    BmcEndpoint, NodeBmcLink, OutboxEntry, Transition, TransitionState, TransitionTask,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

struct Inner {
    transitions: HashMap<Uuid, Transition>,
    tasks: HashMap<(Uuid, String), TransitionTask>,
    endpoints: HashMap<String, BmcEndpoint>,
    links: HashMap<String, NodeBmcLink>,
    outbox: Vec<OutboxEntry>,
}

/// In-memory implementation of `PowerStore` for tests and single-process
/// development. All mutations take the write lock for their full duration,
/// which gives the same atomicity the Postgres backend gets from
/// transactions.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                transitions: HashMap::new(),
                tasks: HashMap::new(),
                endpoints: HashMap::new(),
                links: HashMap::new(),
                outbox: Vec::new(),
            }),
        }
    }

    /// All outbox rows in insertion order. Test helper.
    pub async fn outbox_subjects(&self) -> Vec<String> {
        let r = self.inner.read().await;
        r.outbox.iter().map(|e| e.subject.clone()).collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PowerStore for MemoryStore {
    // ── Transitions ──

    async fn create_transition(
        &self,
        transition: &Transition,
        tasks: &[TransitionTask],
        outbox: &[OutboxEntry],
    ) -> Result<()> {
        let mut w = self.inner.write().await;
        if w.transitions.contains_key(&transition.id) {
            return Err(anyhow!("transition already exists: {}", transition.id));
        }
        w.transitions.insert(transition.id, transition.clone());
        for task in tasks {
            w.tasks.insert(
                (task.transition_id, task.node_id.clone()),
                task.clone(),
            );
        }
        w.outbox.extend(outbox.iter().cloned());
        Ok(())
    }

    async fn load_transition(&self, id: Uuid) -> Result<Option<Transition>> {
        let r = self.inner.read().await;
        Ok(r.transitions.get(&id).cloned())
    }

    async fn list_transitions(
        &self,
        state: Option<TransitionState>,
        limit: usize,
    ) -> Result<Vec<Transition>> {
        let r = self.inner.read().await;
        let mut out: Vec<Transition> = r
            .transitions
            .values()
            .filter(|t| state.map_or(true, |s| t.state == s))
            .cloned()
            .collect();
        out.sort_by_key(|t| t.created_at);
        out.truncate(limit);
        Ok(out)
    }

    async fn update_transition(&self, transition: &Transition, outbox: &OutboxEntry) -> Result<()> {
        let mut w = self.inner.write().await;
        let existing = w
            .transitions
            .get(&transition.id)
            .ok_or_else(|| anyhow!("transition not found: {}", transition.id))?;
        if existing.state.is_terminal() {
            return Err(anyhow!(
                "transition {} is terminal ({})",
                transition.id,
                existing.state.as_str()
            ));
        }
        w.transitions.insert(transition.id, transition.clone());
        w.outbox.push(outbox.clone());
        Ok(())
    }

    // ── Tasks ──

    async fn load_tasks(&self, transition_id: Uuid) -> Result<Vec<TransitionTask>> {
        let r = self.inner.read().await;
        let mut out: Vec<TransitionTask> = r
            .tasks
            .iter()
            .filter(|((tid, _), _)| *tid == transition_id)
            .map(|(_, t)| t.clone())
            .collect();
        out.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(out)
    }

    async fn load_task(
        &self,
        transition_id: Uuid,
        node_id: &str,
    ) -> Result<Option<TransitionTask>> {
        let r = self.inner.read().await;
        Ok(r.tasks.get(&(transition_id, node_id.to_string())).cloned())
    }

    async fn update_task(&self, task: &TransitionTask, outbox: &OutboxEntry) -> Result<()> {
        let mut w = self.inner.write().await;
        let key = (task.transition_id, task.node_id.clone());
        if !w.tasks.contains_key(&key) {
            return Err(anyhow!(
                "task not found: {}/{}",
                task.transition_id,
                task.node_id
            ));
        }
        w.tasks.insert(key, task.clone());
        w.outbox.push(outbox.clone());
        Ok(())
    }

    // ── Mapping cache ──

    async fn get_link(&self, node_id: &str) -> Result<Option<NodeBmcLink>> {
        let r = self.inner.read().await;
        Ok(r.links.get(node_id).cloned())
    }

    async fn get_endpoint(&self, bmc_id: &str) -> Result<Option<BmcEndpoint>> {
        let r = self.inner.read().await;
        Ok(r.endpoints.get(bmc_id).cloned())
    }

    async fn list_endpoints(&self) -> Result<Vec<BmcEndpoint>> {
        let r = self.inner.read().await;
        let mut out: Vec<BmcEndpoint> = r.endpoints.values().cloned().collect();
        out.sort_by(|a, b| a.bmc_id.cmp(&b.bmc_id));
        Ok(out)
    }

    async fn upsert_endpoint(&self, endpoint: &BmcEndpoint) -> Result<()> {
        let mut w = self.inner.write().await;
        w.endpoints
            .insert(endpoint.bmc_id.clone(), endpoint.clone());
        Ok(())
    }

    async fn replace_mappings(
        &self,
        endpoints: &[BmcEndpoint],
        links: &[NodeBmcLink],
    ) -> Result<MappingReplaceCounts> {
        let mut w = self.inner.write().await;

        let desired_endpoints: std::collections::HashSet<&str> =
            endpoints.iter().map(|e| e.bmc_id.as_str()).collect();
        let desired_links: std::collections::HashSet<&str> =
            links.iter().map(|l| l.node_id.as_str()).collect();
        let endpoints_deleted = w
            .endpoints
            .keys()
            .filter(|id| !desired_endpoints.contains(id.as_str()))
            .count() as u32;
        let links_deleted = w
            .links
            .keys()
            .filter(|id| !desired_links.contains(id.as_str()))
            .count() as u32;

        w.endpoints = endpoints
            .iter()
            .map(|e| (e.bmc_id.clone(), e.clone()))
            .collect();
        w.links = links
            .iter()
            .map(|l| (l.node_id.clone(), l.clone()))
            .collect();

        Ok(MappingReplaceCounts {
            endpoints_upserted: endpoints.len() as u32,
            endpoints_deleted,
            links_upserted: links.len() as u32,
            links_deleted,
        })
    }

    // ── Outbox ──

    async fn list_undelivered_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let r = self.inner.read().await;
        Ok(r.outbox
            .iter()
            .filter(|e| e.delivered_at.is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_outbox_delivered(&self, ids: &[Uuid]) -> Result<()> {
        let mut w = self.inner.write().await;
        let now = Utc::now();
        for entry in w.outbox.iter_mut() {
            if ids.contains(&entry.id) && entry.delivered_at.is_none() {
                entry.delivered_at = Some(now);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        MappingSource, PowerOperation, TaskState, TransitionAggregate,
    };

    fn make_transition() -> Transition {
        Transition {
            id: Uuid::now_v7(),
            operation: PowerOperation::On,
            state: TransitionState::Pending,
            request_id: "req-1".into(),
            caller_sub: "tester".into(),
            dry_run: false,
            deadline_ms: 300_000,
            aggregate: TransitionAggregate::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn make_endpoint(bmc_id: &str, endpoint: Option<&str>) -> BmcEndpoint {
        BmcEndpoint {
            bmc_id: bmc_id.into(),
            endpoint: endpoint.map(str::to_string),
            credential_id: None,
            insecure_skip_verify: false,
            source: MappingSource::Topology,
            last_synced_at: Some(Utc::now()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn make_link(node_id: &str, bmc_id: &str) -> NodeBmcLink {
        NodeBmcLink {
            node_id: node_id.into(),
            bmc_id: bmc_id.into(),
            source: MappingSource::Topology,
            last_synced_at: Some(Utc::now()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn create_update_round_trip() {
        let store = MemoryStore::new();
        let mut t = make_transition();
        let task = TransitionTask::new(t.id, "node-a".into());
        store
            .create_transition(
                &t,
                &[task.clone()],
                &[
                    OutboxEntry::for_transition(&t),
                    OutboxEntry::for_task(&task),
                ],
            )
            .await
            .unwrap();

        let loaded = store.load_transition(t.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, TransitionState::Pending);
        assert_eq!(store.load_tasks(t.id).await.unwrap().len(), 1);

        t.state = TransitionState::Planned;
        store
            .update_transition(&t, &OutboxEntry::for_transition(&t))
            .await
            .unwrap();

        let subjects = store.outbox_subjects().await;
        assert_eq!(
            subjects,
            vec![
                "power.transition.pending",
                "power.task.pending",
                "power.transition.planned"
            ]
        );
    }

    #[tokio::test]
    async fn terminal_transition_is_immutable() {
        let store = MemoryStore::new();
        let mut t = make_transition();
        t.state = TransitionState::Completed;
        store.create_transition(&t, &[], &[]).await.unwrap();

        t.state = TransitionState::Failed;
        let err = store
            .update_transition(&t, &OutboxEntry::for_transition(&t))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("terminal"));
    }

    #[tokio::test]
    async fn update_task_persists_outbox_atomically() {
        let store = MemoryStore::new();
        let t = make_transition();
        let mut task = TransitionTask::new(t.id, "node-a".into());
        store
            .create_transition(&t, &[task.clone()], &[])
            .await
            .unwrap();

        task.state = TaskState::Queued;
        store
            .update_task(&task, &OutboxEntry::for_task(&task))
            .await
            .unwrap();

        let loaded = store.load_task(t.id, "node-a").await.unwrap().unwrap();
        assert_eq!(loaded.state, TaskState::Queued);
        assert_eq!(store.outbox_subjects().await, vec!["power.task.queued"]);
    }

    #[tokio::test]
    async fn replace_mappings_counts_and_swaps() {
        let store = MemoryStore::new();
        store
            .replace_mappings(
                &[
                    make_endpoint("bmc-1", Some("https://10.0.0.1")),
                    make_endpoint("bmc-old", None),
                ],
                &[make_link("node-1", "bmc-1")],
            )
            .await
            .unwrap();

        let counts = store
            .replace_mappings(
                &[
                    make_endpoint("bmc-1", Some("https://10.0.0.1")),
                    make_endpoint("bmc-2", Some("https://10.0.0.2")),
                ],
                &[make_link("node-1", "bmc-1"), make_link("node-2", "bmc-2")],
            )
            .await
            .unwrap();

        assert_eq!(counts.endpoints_upserted, 2);
        assert_eq!(counts.endpoints_deleted, 1);
        assert_eq!(counts.links_upserted, 2);
        assert_eq!(counts.links_deleted, 0);
        assert!(store.get_endpoint("bmc-old").await.unwrap().is_none());
        assert!(store.get_endpoint("bmc-2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn manual_endpoint_upsert_and_listing() {
        let store = MemoryStore::new();
        let mut endpoint = make_endpoint("bmc-9", Some("https://10.0.0.9"));
        endpoint.source = MappingSource::Manual;
        store.upsert_endpoint(&endpoint).await.unwrap();

        let loaded = store.get_endpoint("bmc-9").await.unwrap().unwrap();
        assert_eq!(loaded.source, MappingSource::Manual);

        endpoint.credential_id = Some("cred-z".into());
        store.upsert_endpoint(&endpoint).await.unwrap();
        let loaded = store.get_endpoint("bmc-9").await.unwrap().unwrap();
        assert_eq!(loaded.credential_id.as_deref(), Some("cred-z"));
        assert_eq!(store.list_endpoints().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_transitions_filters_by_state() {
        let store = MemoryStore::new();
        let pending = make_transition();
        let mut completed = make_transition();
        completed.state = TransitionState::Completed;
        store.create_transition(&pending, &[], &[]).await.unwrap();
        store.create_transition(&completed, &[], &[]).await.unwrap();

        let all = store.list_transitions(None, 10).await.unwrap();
        assert_eq!(all.len(), 2);
        let only_pending = store
            .list_transitions(Some(TransitionState::Pending), 10)
            .await
            .unwrap();
        assert_eq!(only_pending.len(), 1);
        assert_eq!(only_pending[0].id, pending.id);
    }

    #[tokio::test]
    async fn outbox_delivery_bookkeeping() {
        let store = MemoryStore::new();
        let t = make_transition();
        store
            .create_transition(&t, &[], &[OutboxEntry::for_transition(&t)])
            .await
            .unwrap();

        let pending = store.list_undelivered_outbox(10).await.unwrap();
        assert_eq!(pending.len(), 1);

        store
            .mark_outbox_delivered(&[pending[0].id])
            .await
            .unwrap();
        assert!(store.list_undelivered_outbox(10).await.unwrap().is_empty());
    }
}
