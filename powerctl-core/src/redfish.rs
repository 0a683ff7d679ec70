use crate::error::ExecutionError;
use crate::types::{BmcCredential, PowerOperation, PowerState};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

// ─── Request ──────────────────────────────────────────────────

/// Everything needed for one round trip against a BMC.
#[derive(Clone, Debug)]
pub struct PowerActionRequest {
    /// Normalised origin, e.g. `https://10.1.0.10`.
    pub endpoint: String,
    pub node_id: String,
    pub operation: PowerOperation,
    pub credential: BmcCredential,
    pub insecure_skip_verify: bool,
}

/// Executes power actions and power-state reads against a BMC. The engine
/// depends on this seam; `RedfishExecutor` is the production implementation.
#[async_trait]
pub trait PowerExecutor: Send + Sync {
    async fn execute_power_action(&self, request: &PowerActionRequest)
        -> Result<(), ExecutionError>;

    async fn read_power_state(
        &self,
        request: &PowerActionRequest,
    ) -> Result<PowerState, ExecutionError>;
}

// ─── Redfish wire types ───────────────────────────────────────

#[derive(Deserialize)]
struct OdataRef {
    #[serde(rename = "@odata.id")]
    odata_id: String,
}

#[derive(Deserialize)]
struct SystemsCollection {
    #[serde(rename = "Members", default)]
    members: Vec<OdataRef>,
}

#[derive(Deserialize)]
struct SystemResource {
    #[serde(rename = "PowerState")]
    power_state: Option<String>,
}

/// Pick the ComputerSystem member for a node: the member whose path ends in
/// the node id (case-insensitive), else the lexicographically first.
fn pick_member(members: &[OdataRef], node_id: &str) -> Option<String> {
    let wanted = node_id.to_lowercase();
    members
        .iter()
        .find(|m| {
            m.odata_id
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .map(|tail| tail.to_lowercase() == wanted)
                .unwrap_or(false)
        })
        .or_else(|| members.iter().min_by(|a, b| a.odata_id.cmp(&b.odata_id)))
        .map(|m| m.odata_id.trim_end_matches('/').to_string())
}

// ─── Executor ─────────────────────────────────────────────────

/// reqwest-backed Redfish executor. Holds two shared clients (TLS-verifying
/// and certificate-tolerant) and a process-lifetime Systems-path cache keyed
/// by (endpoint, node id), invalidated on NotFound.
pub struct RedfishExecutor {
    client: reqwest::Client,
    insecure_client: reqwest::Client,
    systems_cache: Mutex<HashMap<(String, String), String>>,
}

impl RedfishExecutor {
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let insecure_client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            client,
            insecure_client,
            systems_cache: Mutex::new(HashMap::new()),
        })
    }

    fn client_for(&self, request: &PowerActionRequest) -> &reqwest::Client {
        if request.insecure_skip_verify {
            &self.insecure_client
        } else {
            &self.client
        }
    }

    fn cache_key(request: &PowerActionRequest) -> (String, String) {
        (request.endpoint.clone(), request.node_id.clone())
    }

    fn invalidate_systems_path(&self, request: &PowerActionRequest) {
        self.systems_cache
            .lock()
            .expect("systems cache lock poisoned")
            .remove(&Self::cache_key(request));
    }

    async fn check_status(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, ExecutionError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let detail = response.text().await.unwrap_or_default();
        let detail: String = detail.trim().chars().take(512).collect();
        Err(ExecutionError::http(status.as_u16(), detail))
    }

    /// Resolve the ComputerSystem path for a node, consulting the cache
    /// first and fetching `/redfish/v1/Systems` on a miss.
    async fn systems_path(&self, request: &PowerActionRequest) -> Result<String, ExecutionError> {
        let key = Self::cache_key(request);
        if let Some(path) = self
            .systems_cache
            .lock()
            .expect("systems cache lock poisoned")
            .get(&key)
        {
            return Ok(path.clone());
        }

        let response = self
            .client_for(request)
            .get(format!("{}/redfish/v1/Systems", request.endpoint))
            .basic_auth(
                &request.credential.username,
                Some(&request.credential.password),
            )
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let collection: SystemsCollection = response.json().await?;

        let path = pick_member(&collection.members, &request.node_id).ok_or_else(|| {
            ExecutionError::protocol(format!(
                "Systems collection at {} has no members",
                request.endpoint
            ))
        })?;

        self.systems_cache
            .lock()
            .expect("systems cache lock poisoned")
            .insert(key, path.clone());
        Ok(path)
    }
}

#[async_trait]
impl PowerExecutor for RedfishExecutor {
    async fn execute_power_action(
        &self,
        request: &PowerActionRequest,
    ) -> Result<(), ExecutionError> {
        let path = self.systems_path(request).await?;
        let url = format!(
            "{}{}/Actions/ComputerSystem.Reset",
            request.endpoint, path
        );

        let response = self
            .client_for(request)
            .post(&url)
            .basic_auth(
                &request.credential.username,
                Some(&request.credential.password),
            )
            .json(&serde_json::json!({ "ResetType": request.operation.reset_type() }))
            .send()
            .await?;

        match Self::check_status(response).await {
            Ok(_) => Ok(()),
            Err(e) => {
                if matches!(e, ExecutionError::Http { status: 404, .. }) {
                    self.invalidate_systems_path(request);
                }
                Err(e)
            }
        }
    }

    async fn read_power_state(
        &self,
        request: &PowerActionRequest,
    ) -> Result<PowerState, ExecutionError> {
        let path = self.systems_path(request).await?;

        let response = self
            .client_for(request)
            .get(format!("{}{}", request.endpoint, path))
            .basic_auth(
                &request.credential.username,
                Some(&request.credential.password),
            )
            .send()
            .await?;

        let response = match Self::check_status(response).await {
            Ok(r) => r,
            Err(e) => {
                if matches!(e, ExecutionError::Http { status: 404, .. }) {
                    self.invalidate_systems_path(request);
                }
                return Err(e);
            }
        };

        let resource: SystemResource = response.json().await?;
        let raw = resource
            .power_state
            .ok_or_else(|| ExecutionError::protocol("response has no PowerState"))?;
        PowerState::parse(&raw)
            .ok_or_else(|| ExecutionError::protocol(format!("unknown PowerState {raw:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refs(paths: &[&str]) -> Vec<OdataRef> {
        paths
            .iter()
            .map(|p| OdataRef {
                odata_id: p.to_string(),
            })
            .collect()
    }

    #[test]
    fn member_matching_node_id_wins() {
        let members = refs(&[
            "/redfish/v1/Systems/Other",
            "/redfish/v1/Systems/Node-A",
        ]);
        assert_eq!(
            pick_member(&members, "node-a").as_deref(),
            Some("/redfish/v1/Systems/Node-A")
        );
    }

    #[test]
    fn falls_back_to_first_member_lexicographically() {
        let members = refs(&["/redfish/v1/Systems/Zeta", "/redfish/v1/Systems/Alpha"]);
        assert_eq!(
            pick_member(&members, "node-x").as_deref(),
            Some("/redfish/v1/Systems/Alpha")
        );
    }

    #[test]
    fn trailing_slash_tolerated() {
        let members = refs(&["/redfish/v1/Systems/node-a/"]);
        assert_eq!(
            pick_member(&members, "NODE-A").as_deref(),
            Some("/redfish/v1/Systems/node-a")
        );
    }

    #[test]
    fn empty_collection_yields_none() {
        assert_eq!(pick_member(&[], "node-a"), None);
    }
}
