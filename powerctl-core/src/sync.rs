use crate::store::{MappingReplaceCounts, PowerStore};
use crate::topology::{Component, ComponentFetch, ComponentKind, EthernetInterface, TopologyClient};
use crate::types::{BmcEndpoint, MappingSource, NodeBmcLink};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

// ─── Status ───────────────────────────────────────────────────

/// Snapshot of synchronizer health, cheap to clone.
#[derive(Clone, Debug, Default)]
pub struct SyncStatus {
    /// True once at least one cycle has succeeded.
    pub ready: bool,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub last_error: Option<String>,
    /// The last cycle found upstream unchanged and skipped reconciliation.
    pub last_not_modified: bool,
    pub last_counts: MappingReplaceCounts,
    pub last_completed_at: Option<DateTime<Utc>>,
}

struct SyncState {
    component_etag: Option<String>,
    interface_fingerprint: Option<[u8; 32]>,
    status: SyncStatus,
}

enum CycleOutcome {
    NotModified,
    Applied {
        counts: MappingReplaceCounts,
        etag: Option<String>,
        fingerprint: [u8; 32],
    },
}

// ─── Synchronizer ─────────────────────────────────────────────

/// Reconciles the local routing cache against the upstream topology
/// service. One instance per process; `run` is the single long-lived loop,
/// `trigger` requests an on-demand cycle from it.
pub struct MappingSynchronizer {
    store: Arc<dyn PowerStore>,
    topology: Arc<dyn TopologyClient>,
    interval: Duration,
    sync_on_startup: bool,
    default_credential_id: Option<String>,
    state: Mutex<SyncState>,
    trigger_tx: mpsc::Sender<oneshot::Sender<SyncStatus>>,
    trigger_rx: std::sync::Mutex<Option<mpsc::Receiver<oneshot::Sender<SyncStatus>>>>,
}

impl MappingSynchronizer {
    pub fn new(
        store: Arc<dyn PowerStore>,
        topology: Arc<dyn TopologyClient>,
        interval: Duration,
        sync_on_startup: bool,
        default_credential_id: Option<String>,
    ) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(8);
        Self {
            store,
            topology,
            interval,
            sync_on_startup,
            default_credential_id,
            state: Mutex::new(SyncState {
                component_etag: None,
                interface_fingerprint: None,
                status: SyncStatus::default(),
            }),
            trigger_tx,
            trigger_rx: std::sync::Mutex::new(Some(trigger_rx)),
        }
    }

    /// Periodic reconcile loop. Exits when `shutdown` fires; an in-flight
    /// cycle finishes first.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut rx = self
            .trigger_rx
            .lock()
            .expect("trigger receiver lock poisoned")
            .take()
            .expect("synchronizer run() started twice");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval fires immediately; the first tick doubles as the startup
        // sync when configured.
        ticker.tick().await;
        if self.sync_on_startup {
            self.sync_cycle().await;
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sync_cycle().await;
                }
                Some(responder) = rx.recv() => {
                    let status = self.sync_cycle().await;
                    let _ = responder.send(status);
                }
            }
        }
    }

    /// Request an immediate cycle and wait for it to finish. Returns
    /// `deadline exceeded` if the loop does not answer within `timeout`
    /// (including when `run` is not active).
    pub async fn trigger(&self, timeout: Duration) -> Result<SyncStatus> {
        let (tx, rx) = oneshot::channel();
        let fut = async {
            self.trigger_tx
                .send(tx)
                .await
                .map_err(|_| anyhow!("synchronizer stopped"))?;
            rx.await.map_err(|_| anyhow!("synchronizer stopped"))
        };
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| anyhow!("deadline exceeded waiting for mapping sync"))?
    }

    pub async fn status(&self) -> SyncStatus {
        self.state.lock().await.status.clone()
    }

    /// One reconcile cycle; updates status and returns the new snapshot.
    /// Transient upstream errors leave the cache and `ready` untouched.
    async fn sync_cycle(&self) -> SyncStatus {
        let outcome = self.reconcile().await;

        let mut state = self.state.lock().await;
        match outcome {
            Ok(CycleOutcome::NotModified) => {
                state.status.ready = true;
                state.status.successful_runs += 1;
                state.status.last_error = None;
                state.status.last_not_modified = true;
                state.status.last_counts = MappingReplaceCounts::default();
                state.status.last_completed_at = Some(Utc::now());
            }
            Ok(CycleOutcome::Applied {
                counts,
                etag,
                fingerprint,
            }) => {
                state.component_etag = etag;
                state.interface_fingerprint = Some(fingerprint);
                state.status.ready = true;
                state.status.successful_runs += 1;
                state.status.last_error = None;
                state.status.last_not_modified = false;
                state.status.last_counts = counts;
                state.status.last_completed_at = Some(Utc::now());
                tracing::info!(
                    endpoints_upserted = counts.endpoints_upserted,
                    endpoints_deleted = counts.endpoints_deleted,
                    links_upserted = counts.links_upserted,
                    links_deleted = counts.links_deleted,
                    "mapping sync applied"
                );
            }
            Err(e) => {
                state.status.failed_runs += 1;
                state.status.last_error = Some(e.to_string());
                tracing::warn!(error = %e, "mapping sync failed");
            }
        }
        state.status.clone()
    }

    async fn reconcile(&self) -> Result<CycleOutcome> {
        let (etag, last_fingerprint) = {
            let state = self.state.lock().await;
            (state.component_etag.clone(), state.interface_fingerprint)
        };

        let fetch = self.topology.list_components(etag.as_deref()).await?;
        let interfaces = self.topology.list_ethernet_interfaces().await?;
        let fingerprint = interface_fingerprint(&interfaces);

        let (components, new_etag) = match fetch {
            ComponentFetch::NotModified if Some(fingerprint) == last_fingerprint => {
                return Ok(CycleOutcome::NotModified);
            }
            // Interfaces moved while the component list stayed put: refetch
            // unconditionally to rebuild against the full list.
            ComponentFetch::NotModified => match self.topology.list_components(None).await? {
                ComponentFetch::Modified { components, etag } => (components, etag),
                ComponentFetch::NotModified => {
                    return Err(anyhow!(
                        "upstream answered not-modified to an unconditional component fetch"
                    ))
                }
            },
            ComponentFetch::Modified { components, etag } => (components, etag),
        };

        let existing: HashMap<String, BmcEndpoint> = self
            .store
            .list_endpoints()
            .await?
            .into_iter()
            .map(|e| (e.bmc_id.clone(), e))
            .collect();

        let (endpoints, links) = build_desired_state(
            &components,
            &interfaces,
            &existing,
            self.default_credential_id.as_deref(),
        );

        let counts = self.store.replace_mappings(&endpoints, &links).await?;

        Ok(CycleOutcome::Applied {
            counts,
            etag: new_etag,
            fingerprint,
        })
    }
}

// ─── Desired-state construction ───────────────────────────────

/// Order-insensitive digest of the interface list, used to detect interface
/// churn when the component entity-tag is unchanged.
fn interface_fingerprint(interfaces: &[EthernetInterface]) -> [u8; 32] {
    let mut lines: Vec<String> = interfaces
        .iter()
        .map(|i| format!("{}={}", i.component_id, i.ip_address))
        .collect();
    lines.sort();

    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize().into()
}

/// Reduce an interface address to an https origin. Already-URL-shaped values
/// keep their scheme; bare addresses become `https://<ip>`. Unparseable
/// values yield `None` (tombstone).
fn normalize_origin(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let parsed = url::Url::parse(&candidate).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), host, port),
        None => format!("{}://{}", parsed.scheme(), host),
    })
}

/// One endpoint per BMC, one link per node whose parent is a BMC in this
/// component list. Credentials and the TLS flag are operator-managed:
/// existing values survive the rebuild, and `default_credential_id` fills
/// the gap when neither side has one.
fn build_desired_state(
    components: &[Component],
    interfaces: &[EthernetInterface],
    existing: &HashMap<String, BmcEndpoint>,
    default_credential_id: Option<&str>,
) -> (Vec<BmcEndpoint>, Vec<NodeBmcLink>) {
    let now = Utc::now();

    let mut addresses: HashMap<&str, Vec<&str>> = HashMap::new();
    for interface in interfaces {
        addresses
            .entry(interface.component_id.as_str())
            .or_default()
            .push(interface.ip_address.as_str());
    }

    let bmc_ids: HashSet<&str> = components
        .iter()
        .filter(|c| c.kind == ComponentKind::NodeBmc)
        .map(|c| c.id.as_str())
        .collect();

    let mut endpoints = Vec::new();
    for component in components {
        if component.kind != ComponentKind::NodeBmc {
            continue;
        }
        let candidates = addresses
            .get(component.id.as_str())
            .map(Vec::as_slice)
            .unwrap_or_default();
        // Prefer an already-URL-shaped value over a bare address.
        let primary = candidates
            .iter()
            .find(|a| a.contains("://"))
            .or_else(|| candidates.iter().find(|a| !a.trim().is_empty()));
        let endpoint = primary.and_then(|a| normalize_origin(a));

        let prior = existing.get(component.id.as_str());
        let credential_id = prior
            .and_then(|p| p.credential_id.clone())
            .or_else(|| default_credential_id.map(str::to_string));

        endpoints.push(BmcEndpoint {
            bmc_id: component.id.clone(),
            endpoint,
            credential_id,
            insecure_skip_verify: prior.map(|p| p.insecure_skip_verify).unwrap_or(false),
            source: MappingSource::Topology,
            last_synced_at: Some(now),
            created_at: prior.map(|p| p.created_at).unwrap_or(now),
            updated_at: now,
        });
    }

    let links = components
        .iter()
        .filter(|c| c.kind == ComponentKind::Node)
        .filter_map(|c| {
            let parent = c.parent.as_deref()?;
            if !bmc_ids.contains(parent) {
                return None;
            }
            Some(NodeBmcLink {
                node_id: c.id.clone(),
                bmc_id: parent.to_string(),
                source: MappingSource::Topology,
                last_synced_at: Some(now),
                created_at: now,
                updated_at: now,
            })
        })
        .collect();

    (endpoints, links)
}
