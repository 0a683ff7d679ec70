use crate::config::CoreConfig;
use crate::credentials::CredentialResolver;
use crate::error::codes;
use crate::redfish::{PowerActionRequest, PowerExecutor};
use crate::resolver::RoutingResolver;
use crate::store::PowerStore;
use crate::topology::{NodeStateUpdater, TopologyClient};
use crate::types::{
    OutboxEntry, PowerOperation, RoutingRecord, TaskState, Transition, TransitionAggregate,
    TransitionState, TransitionTask,
};
use crate::verify::ExpectedStateReader;
use anyhow::{anyhow, Result};
use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ─── Admission request ────────────────────────────────────────

/// Flat, typed admission input. Group expansion and policy checks happen in
/// the peripheral layer before this reaches the engine; in particular,
/// destructive operations (off, soft-off, soft-restart, hard-restart, nmi)
/// must already carry caller confirmation.
#[derive(Clone, Debug)]
pub struct CreateTransitionRequest {
    pub operation: PowerOperation,
    pub nodes: Vec<String>,
    pub dry_run: bool,
    pub deadline_override: Option<Duration>,
    pub request_id: String,
    pub caller_sub: String,
}

// ─── Internal task outcome ────────────────────────────────────

enum TaskOutcome {
    Succeeded {
        observed: Option<crate::types::PowerState>,
        warning: Option<String>,
    },
    Failed {
        code: &'static str,
        detail: String,
    },
    Cancelled,
    DeadlineExceeded,
}

// ─── Engine ───────────────────────────────────────────────────

/// State machine driver for transitions and their per-node tasks: admits,
/// plans, dispatches under two-level concurrency caps, retries, verifies,
/// and finalises. One instance per process.
pub struct TransitionEngine {
    store: Arc<dyn PowerStore>,
    executor: Arc<dyn PowerExecutor>,
    credentials: Arc<dyn CredentialResolver>,
    resolver: RoutingResolver,
    verifier: ExpectedStateReader,
    updater: NodeStateUpdater,
    cfg: CoreConfig,
    global_slots: Arc<Semaphore>,
    /// Lazily created, never removed; bounded by fleet size.
    bmc_slots: std::sync::Mutex<HashMap<String, Arc<Semaphore>>>,
    transition_tokens: std::sync::Mutex<HashMap<Uuid, CancellationToken>>,
    /// Serialises terminal-state aggregation across concurrent task exits.
    finalize_lock: Mutex<()>,
    runners: Mutex<JoinSet<()>>,
    shutdown: CancellationToken,
}

impl TransitionEngine {
    pub fn new(
        store: Arc<dyn PowerStore>,
        executor: Arc<dyn PowerExecutor>,
        topology: Arc<dyn TopologyClient>,
        credentials: Arc<dyn CredentialResolver>,
        cfg: CoreConfig,
    ) -> Self {
        Self {
            resolver: RoutingResolver::new(store.clone()),
            verifier: ExpectedStateReader::new(
                executor.clone(),
                cfg.verification_poll,
                cfg.verification_window,
            ),
            updater: NodeStateUpdater::new(topology),
            global_slots: Arc::new(Semaphore::new(cfg.global_concurrency)),
            bmc_slots: std::sync::Mutex::new(HashMap::new()),
            transition_tokens: std::sync::Mutex::new(HashMap::new()),
            finalize_lock: Mutex::new(()),
            runners: Mutex::new(JoinSet::new()),
            shutdown: CancellationToken::new(),
            store,
            executor,
            credentials,
            cfg,
        }
    }

    // ── Queries (thin wrappers for the peripheral layer) ──

    pub async fn get_transition(&self, id: Uuid) -> Result<Option<Transition>> {
        self.store.load_transition(id).await
    }

    pub async fn get_tasks(&self, id: Uuid) -> Result<Vec<TransitionTask>> {
        self.store.load_tasks(id).await
    }

    pub async fn list_transitions(
        &self,
        state: Option<TransitionState>,
        limit: usize,
    ) -> Result<Vec<Transition>> {
        self.store.list_transitions(state, limit).await
    }

    // ── Admission ──

    /// Persist and plan a transition, then dispatch its runnable tasks.
    /// Returns the transition in its post-admission state.
    pub async fn create_transition(
        self: &Arc<Self>,
        request: CreateTransitionRequest,
    ) -> Result<Transition> {
        if self.shutdown.is_cancelled() {
            return Err(anyhow!("engine is shutting down"));
        }

        let mut nodes: Vec<String> = Vec::with_capacity(request.nodes.len());
        for node in request.nodes {
            if !nodes.contains(&node) {
                nodes.push(node);
            }
        }

        let now = Utc::now();
        let deadline = request
            .deadline_override
            .unwrap_or(self.cfg.transition_deadline);
        let mut transition = Transition {
            id: Uuid::now_v7(),
            operation: request.operation,
            state: TransitionState::Pending,
            request_id: request.request_id,
            caller_sub: request.caller_sub,
            dry_run: request.dry_run,
            deadline_ms: deadline.as_millis() as i64,
            aggregate: TransitionAggregate {
                task_count: nodes.len() as u32,
                ..Default::default()
            },
            created_at: now,
            updated_at: now,
        };

        let mut tasks: HashMap<String, TransitionTask> = nodes
            .iter()
            .map(|n| (n.clone(), TransitionTask::new(transition.id, n.clone())))
            .collect();

        let mut creation_outbox = vec![OutboxEntry::for_transition(&transition)];
        for node in &nodes {
            creation_outbox.push(OutboxEntry::for_task(&tasks[node]));
        }
        let ordered: Vec<TransitionTask> = nodes.iter().map(|n| tasks[n].clone()).collect();
        self.store
            .create_transition(&transition, &ordered, &creation_outbox)
            .await?;

        tracing::info!(
            transition = %transition.id,
            operation = transition.operation.as_str(),
            nodes = nodes.len(),
            dry_run = transition.dry_run,
            "transition admitted"
        );

        // Resolve routing and tag mapping failures on their tasks.
        let (mut resolved, errors) = self.resolver.resolve(&nodes).await?;
        for error in &errors {
            let Some(task) = tasks.get_mut(&error.node_id) else {
                continue;
            };
            task.state = TaskState::Failed;
            task.bmc_id = error.bmc_id.clone();
            task.error_code = Some(error.code.as_str().to_string());
            task.error_detail = Some(error.detail.clone());
            task.ended_at = Some(Utc::now());
            self.persist_task(task).await?;
        }
        for record in &resolved {
            if let Some(task) = tasks.get_mut(&record.node_id) {
                task.bmc_id = Some(record.bmc_id.clone());
            }
        }

        if transition.dry_run {
            for record in &resolved {
                let Some(task) = tasks.get_mut(&record.node_id) else {
                    continue;
                };
                task.state = TaskState::Planned;
                self.persist_task(task).await?;
            }
            self.advance_transition(&mut transition, TransitionState::Planned)
                .await?;
            return Ok(transition);
        }

        self.advance_transition(&mut transition, TransitionState::Planned)
            .await?;

        if resolved.is_empty() {
            // Nothing runnable: aggregate immediately.
            let final_tasks = self.store.load_tasks(transition.id).await?;
            transition.aggregate = aggregate_counts(&final_tasks);
            self.advance_transition(&mut transition, aggregate_state(&final_tasks, false))
                .await?;
            return Ok(transition);
        }

        self.advance_transition(&mut transition, TransitionState::InProgress)
            .await?;

        let token = self.shutdown.child_token();
        self.transition_tokens
            .lock()
            .expect("transition token lock poisoned")
            .insert(transition.id, token.clone());

        // Deterministic admission order: same created_at, so node id breaks
        // the tie. The FIFO-fair semaphores preserve this as dispatch order.
        resolved.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        for record in resolved {
            let Some(mut task) = tasks.remove(&record.node_id) else {
                continue;
            };
            task.state = TaskState::Queued;
            self.persist_task(&task).await?;
            let enqueued_at = Instant::now();

            let engine = self.clone();
            let transition = transition.clone();
            let token = token.clone();
            self.runners.lock().await.spawn(async move {
                engine
                    .run_task(transition, task, record, token, enqueued_at)
                    .await;
            });
        }

        Ok(transition)
    }

    // ── Cancellation (reserved: not yet exposed by the external API) ──

    /// Cancel a transition: pending/planned tasks are cancelled directly,
    /// queued/retry/running ones via their cancellation signal.
    pub async fn cancel_transition(&self, id: Uuid) -> Result<()> {
        let transition = self
            .store
            .load_transition(id)
            .await?
            .ok_or_else(|| anyhow!("transition not found: {id}"))?;
        if transition.state.is_terminal() {
            return Err(anyhow!("transition {id} is terminal"));
        }

        // Tasks with no runner attached yet.
        for mut task in self.store.load_tasks(id).await? {
            if matches!(task.state, TaskState::Pending | TaskState::Planned) {
                task.state = TaskState::Cancelled;
                task.error_code = Some(codes::CANCELLED.to_string());
                task.error_detail = Some("transition cancelled".to_string());
                task.ended_at = Some(Utc::now());
                self.persist_task(&task).await?;
            }
        }

        let token = self
            .transition_tokens
            .lock()
            .expect("transition token lock poisoned")
            .get(&id)
            .cloned();
        if let Some(token) = token {
            token.cancel();
        }

        self.finalize_transition(id).await
    }

    // ── Shutdown ──

    /// Stop admitting, signal every in-flight task, and wait up to the grace
    /// window for runners to drain. Transitions still unfinished after the
    /// grace window are swept to `aborted`.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let deadline = Instant::now() + self.cfg.shutdown_grace;
        let mut runners = self.runners.lock().await;
        loop {
            match tokio::time::timeout_at(deadline, runners.join_next()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!("shutdown grace expired; aborting in-flight task runners");
                    runners.abort_all();
                    break;
                }
            }
        }
        drop(runners);

        if let Err(e) = self.sweep_interrupted().await {
            tracing::error!(error = %e, "failed to sweep interrupted transitions");
        }
    }

    /// Mark transitions left non-terminal by an aborted drain.
    async fn sweep_interrupted(&self) -> Result<()> {
        for state in [TransitionState::Pending, TransitionState::InProgress] {
            for mut transition in self.store.list_transitions(Some(state), 10_000).await? {
                for mut task in self.store.load_tasks(transition.id).await? {
                    if !task.state.is_terminal() {
                        task.state = TaskState::Cancelled;
                        task.error_code = Some(codes::CANCELLED.to_string());
                        task.error_detail = Some("engine shutdown".to_string());
                        task.ended_at = Some(Utc::now());
                        self.persist_task(&task).await?;
                    }
                }
                let tasks = self.store.load_tasks(transition.id).await?;
                transition.aggregate = aggregate_counts(&tasks);
                self.advance_transition(&mut transition, TransitionState::Aborted)
                    .await?;
            }
        }
        Ok(())
    }

    // ── Task runner ──

    async fn run_task(
        self: Arc<Self>,
        transition: Transition,
        task: TransitionTask,
        record: RoutingRecord,
        token: CancellationToken,
        enqueued_at: Instant,
    ) {
        let deadline_at = enqueued_at + Duration::from_millis(transition.deadline_ms.max(0) as u64);

        let drive = self.drive_task(&transition, task.clone(), &record);
        tokio::pin!(drive);
        let outcome = tokio::select! {
            outcome = &mut drive => outcome,
            _ = token.cancelled() => TaskOutcome::Cancelled,
            _ = tokio::time::sleep_until(deadline_at) => TaskOutcome::DeadlineExceeded,
        };

        // The drive future may have been dropped mid-write; reload the last
        // persisted row so attempt counts survive.
        let mut task = match self.store.load_task(task.transition_id, &task.node_id).await {
            Ok(Some(latest)) => latest,
            Ok(None) | Err(_) => task,
        };
        if task.state.is_terminal() {
            // Persistence gave out mid-drive and the failure was already
            // recorded; nothing further to write.
            self.try_finalize(transition.id).await;
            return;
        }

        let now = Utc::now();
        match outcome {
            TaskOutcome::Succeeded { observed, warning } => {
                task.state = TaskState::Succeeded;
                task.observed_state = observed;
                task.error_code = None;
                task.error_detail = warning;
                task.ended_at = Some(now);
            }
            TaskOutcome::Failed { code, detail } => {
                task.state = TaskState::Failed;
                task.error_code = Some(code.to_string());
                task.error_detail = Some(detail);
                task.ended_at = Some(now);
            }
            TaskOutcome::Cancelled => {
                task.state = TaskState::Cancelled;
                task.error_code = Some(codes::CANCELLED.to_string());
                task.error_detail = Some("cancelled".to_string());
                task.ended_at = Some(now);
            }
            TaskOutcome::DeadlineExceeded => {
                task.state = TaskState::Failed;
                task.error_code = Some(codes::DEADLINE_EXCEEDED.to_string());
                task.error_detail = Some(format!(
                    "deadline of {}ms exceeded",
                    transition.deadline_ms
                ));
                task.ended_at = Some(now);
            }
        }

        if let Err(e) = self.persist_task(&task).await {
            tracing::error!(
                transition = %task.transition_id,
                node = %task.node_id,
                error = %e,
                "failed to persist terminal task state"
            );
        }
        self.try_finalize(transition.id).await;
    }

    /// Attempt/retry loop: acquire slots, dispatch, verify, push node state.
    /// Intermediate states are persisted as it goes; the final state is
    /// written by `run_task` from the returned outcome.
    async fn drive_task(
        &self,
        transition: &Transition,
        mut task: TransitionTask,
        record: &RoutingRecord,
    ) -> TaskOutcome {
        loop {
            // Per-BMC slot first, then global; released in reverse.
            let bmc_slots = self.bmc_semaphore(&record.bmc_id);
            let bmc_permit = match bmc_slots.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return TaskOutcome::Failed {
                        code: codes::CANCELLED,
                        detail: "dispatch slots closed".to_string(),
                    }
                }
            };
            let global_permit = match self.global_slots.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return TaskOutcome::Failed {
                        code: codes::CANCELLED,
                        detail: "dispatch slots closed".to_string(),
                    }
                }
            };

            task.state = TaskState::Running;
            task.attempt += 1;
            if task.started_at.is_none() {
                task.started_at = Some(Utc::now());
            }
            if self.persist_task(&task).await.is_err() {
                return TaskOutcome::Failed {
                    code: codes::PERSISTENCE,
                    detail: "store unreachable while claiming task".to_string(),
                };
            }

            let credential = match self.credentials.resolve(&record.credential_id).await {
                Ok(credential) => credential,
                Err(e) => {
                    return TaskOutcome::Failed {
                        code: codes::CREDENTIAL_MISSING,
                        detail: e.to_string(),
                    }
                }
            };
            let request = PowerActionRequest {
                endpoint: record.endpoint.clone(),
                node_id: task.node_id.clone(),
                operation: transition.operation,
                credential,
                insecure_skip_verify: record.insecure_skip_verify,
            };

            tracing::debug!(
                transition = %task.transition_id,
                node = %task.node_id,
                bmc = %record.bmc_id,
                attempt = task.attempt,
                "dispatching power action"
            );

            let error = match self.executor.execute_power_action(&request).await {
                Ok(()) => {
                    return match self.verifier.await_expected_state(&request).await {
                        Ok(observed) => {
                            let warning = match observed {
                                Some(state) => self
                                    .updater
                                    .push_node_state(&task.node_id, state)
                                    .await
                                    .err()
                                    .map(|e| {
                                        tracing::warn!(
                                            node = %task.node_id,
                                            error = %e,
                                            "node state update failed after verification"
                                        );
                                        format!("node state update failed: {e}")
                                    }),
                                None => None,
                            };
                            TaskOutcome::Succeeded { observed, warning }
                        }
                        Err(crate::error::VerifyError::Timeout { window_ms }) => {
                            TaskOutcome::Failed {
                                code: codes::VERIFICATION_TIMEOUT,
                                detail: format!(
                                    "expected state not observed within {window_ms}ms"
                                ),
                            }
                        }
                        Err(crate::error::VerifyError::Read(e)) => TaskOutcome::Failed {
                            code: codes::VERIFICATION_READ_ERROR,
                            detail: e.to_string(),
                        },
                    };
                }
                Err(e) => e,
            };

            if !error.is_retryable() || task.attempt >= self.cfg.retry_attempts {
                return TaskOutcome::Failed {
                    code: error.task_error_code(),
                    detail: error.to_string(),
                };
            }

            // Retryable and attempts remain: back off without holding slots.
            drop(global_permit);
            drop(bmc_permit);

            let delay = self.retry_backoff(task.attempt);
            task.state = TaskState::Retry;
            task.error_code = Some(error.task_error_code().to_string());
            task.error_detail = Some(error.to_string());
            if self.persist_task(&task).await.is_err() {
                return TaskOutcome::Failed {
                    code: codes::PERSISTENCE,
                    detail: "store unreachable while scheduling retry".to_string(),
                };
            }

            tracing::debug!(
                transition = %task.transition_id,
                node = %task.node_id,
                attempt = task.attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying after backoff"
            );
            // The caller's select enforces the deadline if it lands mid-sleep.
            tokio::time::sleep(delay).await;

            task.state = TaskState::Queued;
            if self.persist_task(&task).await.is_err() {
                return TaskOutcome::Failed {
                    code: codes::PERSISTENCE,
                    detail: "store unreachable while requeueing".to_string(),
                };
            }
        }
    }

    /// `min(max, base × 2^(attempt-1))` with ±20% jitter.
    fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let capped = self
            .cfg
            .retry_backoff_base
            .saturating_mul(factor)
            .min(self.cfg.retry_backoff_max);
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        capped.mul_f64(jitter)
    }

    fn bmc_semaphore(&self, bmc_id: &str) -> Arc<Semaphore> {
        self.bmc_slots
            .lock()
            .expect("bmc slot lock poisoned")
            .entry(bmc_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.cfg.per_bmc_concurrency)))
            .clone()
    }

    // ── Persistence helpers ──

    /// Write a task row (with its outbox entry), retrying transient store
    /// failures before giving up.
    async fn persist_task(&self, task: &TransitionTask) -> Result<()> {
        let outbox = OutboxEntry::for_task(task);
        let mut last_error = None;
        for attempt in 0..3 {
            match self.store.update_task(task, &outbox).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if attempt < 2 {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow!("store unreachable")))
    }

    async fn advance_transition(
        &self,
        transition: &mut Transition,
        state: TransitionState,
    ) -> Result<()> {
        transition.state = state;
        transition.updated_at = Utc::now();
        self.store
            .update_transition(transition, &OutboxEntry::for_transition(transition))
            .await
    }

    // ── Finalisation ──

    async fn try_finalize(&self, id: Uuid) {
        if let Err(e) = self.finalize_transition(id).await {
            tracing::error!(transition = %id, error = %e, "failed to finalise transition");
        }
    }

    /// Advance the parent to its terminal state once every task is terminal.
    async fn finalize_transition(&self, id: Uuid) -> Result<()> {
        let _guard = self.finalize_lock.lock().await;

        let Some(mut transition) = self.store.load_transition(id).await? else {
            return Err(anyhow!("transition not found: {id}"));
        };
        if transition.state.is_terminal() {
            return Ok(());
        }
        let tasks = self.store.load_tasks(id).await?;
        if !tasks.iter().all(|t| t.state.is_terminal()) {
            return Ok(());
        }

        transition.aggregate = aggregate_counts(&tasks);
        let state = aggregate_state(&tasks, self.shutdown.is_cancelled());
        self.advance_transition(&mut transition, state).await?;

        self.transition_tokens
            .lock()
            .expect("transition token lock poisoned")
            .remove(&id);

        tracing::info!(
            transition = %id,
            state = state.as_str(),
            succeeded = transition.aggregate.succeeded,
            failed = transition.aggregate.failed,
            cancelled = transition.aggregate.cancelled,
            "transition finalised"
        );
        Ok(())
    }
}

fn aggregate_counts(tasks: &[TransitionTask]) -> TransitionAggregate {
    TransitionAggregate {
        task_count: tasks.len() as u32,
        succeeded: tasks
            .iter()
            .filter(|t| t.state == TaskState::Succeeded)
            .count() as u32,
        failed: tasks.iter().filter(|t| t.state == TaskState::Failed).count() as u32,
        cancelled: tasks
            .iter()
            .filter(|t| t.state == TaskState::Cancelled)
            .count() as u32,
    }
}

/// Terminal aggregation rule. `during_shutdown` turns a shutdown-driven
/// cancellation into `aborted`.
fn aggregate_state(tasks: &[TransitionTask], during_shutdown: bool) -> TransitionState {
    if tasks.is_empty() {
        return TransitionState::Failed;
    }
    let succeeded = tasks.iter().filter(|t| t.state == TaskState::Succeeded).count();
    let failed = tasks.iter().filter(|t| t.state == TaskState::Failed).count();
    let cancelled = tasks
        .iter()
        .filter(|t| t.state == TaskState::Cancelled)
        .count();

    if succeeded == tasks.len() {
        TransitionState::Completed
    } else if failed == tasks.len() {
        TransitionState::Failed
    } else if cancelled > 0 && succeeded == 0 {
        if during_shutdown {
            TransitionState::Aborted
        } else {
            TransitionState::Cancelled
        }
    } else {
        TransitionState::PartiallyFailed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_in(state: TaskState) -> TransitionTask {
        let mut task = TransitionTask::new(Uuid::now_v7(), "n".into());
        task.state = state;
        task
    }

    #[test]
    fn aggregation_rule() {
        use TaskState::*;
        assert_eq!(
            aggregate_state(&[task_in(Succeeded), task_in(Succeeded)], false),
            TransitionState::Completed
        );
        assert_eq!(
            aggregate_state(&[task_in(Failed), task_in(Failed)], false),
            TransitionState::Failed
        );
        assert_eq!(
            aggregate_state(&[task_in(Succeeded), task_in(Failed)], false),
            TransitionState::PartiallyFailed
        );
        assert_eq!(
            aggregate_state(&[task_in(Cancelled), task_in(Failed)], false),
            TransitionState::Cancelled
        );
        assert_eq!(
            aggregate_state(&[task_in(Cancelled), task_in(Succeeded)], false),
            TransitionState::PartiallyFailed
        );
        assert_eq!(aggregate_state(&[], false), TransitionState::Failed);
        assert_eq!(
            aggregate_state(&[task_in(Cancelled)], true),
            TransitionState::Aborted
        );
    }

    #[test]
    fn aggregate_counts_tally() {
        use TaskState::*;
        let counts = aggregate_counts(&[
            task_in(Succeeded),
            task_in(Failed),
            task_in(Failed),
            task_in(Cancelled),
        ]);
        assert_eq!(counts.task_count, 4);
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.failed, 2);
        assert_eq!(counts.cancelled, 1);
    }
}
