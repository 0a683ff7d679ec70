use crate::store::{MappingReplaceCounts, PowerStore};
use crate::types::{
    BmcEndpoint, MappingSource, NodeBmcLink, OutboxEntry, PowerOperation, PowerState, TaskState,
    Transition, TransitionAggregate, TransitionState, TransitionTask,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashSet;
use uuid::Uuid;

/// Transition states treated as immutable by UPDATE guards. Must stay in
/// lockstep with `TransitionState::is_terminal`.
const TERMINAL_TRANSITION_STATES: [&str; 5] = [
    "completed",
    "partially-failed",
    "failed",
    "cancelled",
    "aborted",
];

fn transition_from_row(row: &PgRow) -> Result<Transition> {
    let operation: String = row.get("operation");
    let state: String = row.get("state");
    let task_count: i32 = row.get("task_count");
    let succeeded: i32 = row.get("succeeded");
    let failed: i32 = row.get("failed");
    let cancelled: i32 = row.get("cancelled");

    Ok(Transition {
        id: row.get("id"),
        operation: PowerOperation::parse(&operation)
            .ok_or_else(|| anyhow!("unknown operation in store: {operation}"))?,
        state: TransitionState::parse(&state)
            .ok_or_else(|| anyhow!("unknown transition state in store: {state}"))?,
        request_id: row.get("request_id"),
        caller_sub: row.get("caller_sub"),
        dry_run: row.get("dry_run"),
        deadline_ms: row.get("deadline_ms"),
        aggregate: TransitionAggregate {
            task_count: task_count as u32,
            succeeded: succeeded as u32,
            failed: failed as u32,
            cancelled: cancelled as u32,
        },
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn task_from_row(row: &PgRow) -> Result<TransitionTask> {
    let state: String = row.get("state");
    let attempt: i32 = row.get("attempt");
    let observed: Option<String> = row.get("observed_state");

    Ok(TransitionTask {
        transition_id: row.get("transition_id"),
        node_id: row.get("node_id"),
        state: TaskState::parse(&state)
            .ok_or_else(|| anyhow!("unknown task state in store: {state}"))?,
        attempt: attempt as u32,
        bmc_id: row.get("bmc_id"),
        error_code: row.get("error_code"),
        error_detail: row.get("error_detail"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
        observed_state: observed
            .map(|s| {
                PowerState::parse(&s)
                    .ok_or_else(|| anyhow!("unknown observed state in store: {s}"))
            })
            .transpose()?,
    })
}

fn endpoint_from_row(row: &PgRow) -> Result<BmcEndpoint> {
    let source: String = row.get("source");
    Ok(BmcEndpoint {
        bmc_id: row.get("bmc_id"),
        endpoint: row.get("endpoint"),
        credential_id: row.get("credential_id"),
        insecure_skip_verify: row.get("insecure_skip_verify"),
        source: MappingSource::parse(&source)
            .ok_or_else(|| anyhow!("unknown mapping source in store: {source}"))?,
        last_synced_at: row.get("last_synced_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn link_from_row(row: &PgRow) -> Result<NodeBmcLink> {
    let source: String = row.get("source");
    Ok(NodeBmcLink {
        node_id: row.get("node_id"),
        bmc_id: row.get("bmc_id"),
        source: MappingSource::parse(&source)
            .ok_or_else(|| anyhow!("unknown mapping source in store: {source}"))?,
        last_synced_at: row.get("last_synced_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

async fn insert_outbox(tx: &mut Transaction<'_, Postgres>, entry: &OutboxEntry) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO outbox (id, subject, payload, created_at, delivered_at)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(entry.id)
    .bind(&entry.subject)
    .bind(&entry.payload)
    .bind(entry.created_at)
    .bind(entry.delivered_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_task(tx: &mut Transaction<'_, Postgres>, task: &TransitionTask) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO transition_tasks (
            transition_id, node_id, state, attempt, bmc_id,
            error_code, error_detail, started_at, ended_at, observed_state
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (transition_id, node_id) DO UPDATE SET
            state = EXCLUDED.state,
            attempt = EXCLUDED.attempt,
            bmc_id = EXCLUDED.bmc_id,
            error_code = EXCLUDED.error_code,
            error_detail = EXCLUDED.error_detail,
            started_at = EXCLUDED.started_at,
            ended_at = EXCLUDED.ended_at,
            observed_state = EXCLUDED.observed_state
        "#,
    )
    .bind(task.transition_id)
    .bind(&task.node_id)
    .bind(task.state.as_str())
    .bind(task.attempt as i32)
    .bind(&task.bmc_id)
    .bind(&task.error_code)
    .bind(&task.error_detail)
    .bind(task.started_at)
    .bind(task.ended_at)
    .bind(task.observed_state.map(|s| s.as_str()))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// PostgreSQL-backed implementation of `PowerStore`.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run powerctl migrations")?;
        Ok(())
    }
}

#[async_trait]
impl PowerStore for PostgresStore {
    // ── Transitions ──

    async fn create_transition(
        &self,
        transition: &Transition,
        tasks: &[TransitionTask],
        outbox: &[OutboxEntry],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO transitions (
                id, operation, state, request_id, caller_sub, dry_run,
                deadline_ms, task_count, succeeded, failed, cancelled,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(transition.id)
        .bind(transition.operation.as_str())
        .bind(transition.state.as_str())
        .bind(&transition.request_id)
        .bind(&transition.caller_sub)
        .bind(transition.dry_run)
        .bind(transition.deadline_ms)
        .bind(transition.aggregate.task_count as i32)
        .bind(transition.aggregate.succeeded as i32)
        .bind(transition.aggregate.failed as i32)
        .bind(transition.aggregate.cancelled as i32)
        .bind(transition.created_at)
        .bind(transition.updated_at)
        .execute(&mut *tx)
        .await?;

        for task in tasks {
            upsert_task(&mut tx, task).await?;
        }
        for entry in outbox {
            insert_outbox(&mut tx, entry).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_transition(&self, id: Uuid) -> Result<Option<Transition>> {
        let row = sqlx::query("SELECT * FROM transitions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(transition_from_row).transpose()
    }

    async fn list_transitions(
        &self,
        state: Option<TransitionState>,
        limit: usize,
    ) -> Result<Vec<Transition>> {
        let rows = match state {
            Some(state) => {
                sqlx::query(
                    "SELECT * FROM transitions WHERE state = $1 ORDER BY created_at LIMIT $2",
                )
                .bind(state.as_str())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM transitions ORDER BY created_at LIMIT $1")
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(transition_from_row).collect()
    }

    async fn update_transition(&self, transition: &Transition, outbox: &OutboxEntry) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE transitions SET
                state = $2,
                task_count = $3,
                succeeded = $4,
                failed = $5,
                cancelled = $6,
                updated_at = $7
            WHERE id = $1 AND state <> ALL($8)
            "#,
        )
        .bind(transition.id)
        .bind(transition.state.as_str())
        .bind(transition.aggregate.task_count as i32)
        .bind(transition.aggregate.succeeded as i32)
        .bind(transition.aggregate.failed as i32)
        .bind(transition.aggregate.cancelled as i32)
        .bind(transition.updated_at)
        .bind(&TERMINAL_TRANSITION_STATES[..])
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow!(
                "transition {} not found or terminal",
                transition.id
            ));
        }

        insert_outbox(&mut tx, outbox).await?;
        tx.commit().await?;
        Ok(())
    }

    // ── Tasks ──

    async fn load_tasks(&self, transition_id: Uuid) -> Result<Vec<TransitionTask>> {
        let rows = sqlx::query(
            "SELECT * FROM transition_tasks WHERE transition_id = $1 ORDER BY node_id",
        )
        .bind(transition_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn load_task(
        &self,
        transition_id: Uuid,
        node_id: &str,
    ) -> Result<Option<TransitionTask>> {
        let row = sqlx::query(
            "SELECT * FROM transition_tasks WHERE transition_id = $1 AND node_id = $2",
        )
        .bind(transition_id)
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn update_task(&self, task: &TransitionTask, outbox: &OutboxEntry) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE transition_tasks SET
                state = $3,
                attempt = $4,
                bmc_id = $5,
                error_code = $6,
                error_detail = $7,
                started_at = $8,
                ended_at = $9,
                observed_state = $10
            WHERE transition_id = $1 AND node_id = $2
            "#,
        )
        .bind(task.transition_id)
        .bind(&task.node_id)
        .bind(task.state.as_str())
        .bind(task.attempt as i32)
        .bind(&task.bmc_id)
        .bind(&task.error_code)
        .bind(&task.error_detail)
        .bind(task.started_at)
        .bind(task.ended_at)
        .bind(task.observed_state.map(|s| s.as_str()))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow!(
                "task not found: {}/{}",
                task.transition_id,
                task.node_id
            ));
        }

        insert_outbox(&mut tx, outbox).await?;
        tx.commit().await?;
        Ok(())
    }

    // ── Mapping cache ──

    async fn get_link(&self, node_id: &str) -> Result<Option<NodeBmcLink>> {
        let row = sqlx::query("SELECT * FROM node_bmc_links WHERE node_id = $1")
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(link_from_row).transpose()
    }

    async fn get_endpoint(&self, bmc_id: &str) -> Result<Option<BmcEndpoint>> {
        let row = sqlx::query("SELECT * FROM bmc_endpoints WHERE bmc_id = $1")
            .bind(bmc_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(endpoint_from_row).transpose()
    }

    async fn list_endpoints(&self) -> Result<Vec<BmcEndpoint>> {
        let rows = sqlx::query("SELECT * FROM bmc_endpoints ORDER BY bmc_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(endpoint_from_row).collect()
    }

    async fn upsert_endpoint(&self, endpoint: &BmcEndpoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bmc_endpoints (
                bmc_id, endpoint, credential_id, insecure_skip_verify,
                source, last_synced_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (bmc_id) DO UPDATE SET
                endpoint = EXCLUDED.endpoint,
                credential_id = EXCLUDED.credential_id,
                insecure_skip_verify = EXCLUDED.insecure_skip_verify,
                source = EXCLUDED.source,
                last_synced_at = EXCLUDED.last_synced_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&endpoint.bmc_id)
        .bind(&endpoint.endpoint)
        .bind(&endpoint.credential_id)
        .bind(endpoint.insecure_skip_verify)
        .bind(endpoint.source.as_str())
        .bind(endpoint.last_synced_at)
        .bind(endpoint.created_at)
        .bind(endpoint.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replace_mappings(
        &self,
        endpoints: &[BmcEndpoint],
        links: &[NodeBmcLink],
    ) -> Result<MappingReplaceCounts> {
        let mut tx = self.pool.begin().await?;

        let existing_endpoints: HashSet<String> = sqlx::query("SELECT bmc_id FROM bmc_endpoints")
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(|r| r.get::<String, _>("bmc_id"))
            .collect();
        let existing_links: HashSet<String> = sqlx::query("SELECT node_id FROM node_bmc_links")
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(|r| r.get::<String, _>("node_id"))
            .collect();

        sqlx::query("DELETE FROM bmc_endpoints")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM node_bmc_links")
            .execute(&mut *tx)
            .await?;

        for endpoint in endpoints {
            sqlx::query(
                r#"
                INSERT INTO bmc_endpoints (
                    bmc_id, endpoint, credential_id, insecure_skip_verify,
                    source, last_synced_at, created_at, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(&endpoint.bmc_id)
            .bind(&endpoint.endpoint)
            .bind(&endpoint.credential_id)
            .bind(endpoint.insecure_skip_verify)
            .bind(endpoint.source.as_str())
            .bind(endpoint.last_synced_at)
            .bind(endpoint.created_at)
            .bind(endpoint.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        for link in links {
            sqlx::query(
                r#"
                INSERT INTO node_bmc_links (
                    node_id, bmc_id, source, last_synced_at, created_at, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(&link.node_id)
            .bind(&link.bmc_id)
            .bind(link.source.as_str())
            .bind(link.last_synced_at)
            .bind(link.created_at)
            .bind(link.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        let desired_endpoints: HashSet<&str> =
            endpoints.iter().map(|e| e.bmc_id.as_str()).collect();
        let desired_links: HashSet<&str> = links.iter().map(|l| l.node_id.as_str()).collect();
        let endpoints_deleted = existing_endpoints
            .iter()
            .filter(|id| !desired_endpoints.contains(id.as_str()))
            .count() as u32;
        let links_deleted = existing_links
            .iter()
            .filter(|id| !desired_links.contains(id.as_str()))
            .count() as u32;

        Ok(MappingReplaceCounts {
            endpoints_upserted: endpoints.len() as u32,
            endpoints_deleted,
            links_upserted: links.len() as u32,
            links_deleted,
        })
    }

    // ── Outbox ──

    async fn list_undelivered_outbox(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, subject, payload, created_at, delivered_at
            FROM outbox
            WHERE delivered_at IS NULL
            ORDER BY created_at
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(OutboxEntry {
                    id: row.get("id"),
                    subject: row.get("subject"),
                    payload: row.get("payload"),
                    created_at: row.get("created_at"),
                    delivered_at: row.get("delivered_at"),
                })
            })
            .collect()
    }

    async fn mark_outbox_delivered(&self, ids: &[Uuid]) -> Result<()> {
        sqlx::query(
            "UPDATE outbox SET delivered_at = now() WHERE id = ANY($1) AND delivered_at IS NULL",
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
