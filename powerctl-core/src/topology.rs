use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::types::PowerState;

// ─── Upstream wire types ──────────────────────────────────────

/// Component kinds the synchronizer cares about. Everything else upstream is
/// carried as `Other` and ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentKind {
    Node,
    #[serde(rename = "NodeBMC")]
    NodeBmc,
    #[serde(other)]
    Other,
}

/// One entry from `GET /components`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Component {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ComponentKind,
    /// For nodes: the managing BMC's component id.
    #[serde(default)]
    pub parent: Option<String>,
}

/// One entry from `GET /ethernet-interfaces`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EthernetInterface {
    pub component_id: String,
    pub ip_address: String,
}

/// Result of a conditional component fetch.
#[derive(Clone, Debug)]
pub enum ComponentFetch {
    /// Upstream entity-tag matched; no body was transferred.
    NotModified,
    Modified {
        components: Vec<Component>,
        etag: Option<String>,
    },
}

/// Upstream topology service failure.
#[derive(Clone, Debug, Error)]
pub enum TopologyError {
    #[error("topology transport error: {0}")]
    Transport(String),
    #[error("topology http {status}: {detail}")]
    Http { status: u16, detail: String },
    #[error("topology decode error: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for TopologyError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            TopologyError::Decode(e.to_string())
        } else {
            TopologyError::Transport(e.to_string())
        }
    }
}

// ─── Client trait ─────────────────────────────────────────────

/// Read/patch access to the authoritative topology service. The contracts
/// (`GET /components` with entity-tag support, `GET /ethernet-interfaces`,
/// `PATCH /components/{id}`) are fixed upstream.
#[async_trait]
pub trait TopologyClient: Send + Sync {
    /// Conditional fetch: pass the last observed entity-tag to allow the
    /// upstream to answer `NotModified`.
    async fn list_components(&self, etag: Option<&str>) -> Result<ComponentFetch, TopologyError>;

    async fn list_ethernet_interfaces(&self) -> Result<Vec<EthernetInterface>, TopologyError>;

    async fn patch_component_state(&self, id: &str, state: &str) -> Result<(), TopologyError>;
}

// ─── HTTP implementation ──────────────────────────────────────

#[derive(Deserialize)]
struct ComponentsBody {
    components: Vec<Component>,
}

#[derive(Deserialize)]
struct InterfacesBody {
    interfaces: Vec<EthernetInterface>,
}

/// reqwest-backed `TopologyClient`.
pub struct HttpTopologyClient {
    base: String,
    client: reqwest::Client,
}

impl HttpTopologyClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, TopologyError> {
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(TopologyError::Http {
                status: status.as_u16(),
                detail,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl TopologyClient for HttpTopologyClient {
    async fn list_components(&self, etag: Option<&str>) -> Result<ComponentFetch, TopologyError> {
        let mut request = self.client.get(format!("{}/components", self.base));
        if let Some(etag) = etag {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag);
        }
        let response = request.send().await?;

        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(ComponentFetch::NotModified);
        }
        let response = Self::check_status(response).await?;
        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body: ComponentsBody = response.json().await?;
        Ok(ComponentFetch::Modified {
            components: body.components,
            etag,
        })
    }

    async fn list_ethernet_interfaces(&self) -> Result<Vec<EthernetInterface>, TopologyError> {
        let response = self
            .client
            .get(format!("{}/ethernet-interfaces", self.base))
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        let body: InterfacesBody = response.json().await?;
        Ok(body.interfaces)
    }

    async fn patch_component_state(&self, id: &str, state: &str) -> Result<(), TopologyError> {
        let response = self
            .client
            .patch(format!("{}/components/{}", self.base, id))
            .json(&serde_json::json!({ "state": state }))
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }
}

// ─── Node-state updater ───────────────────────────────────────

/// Pushes verified post-transition power state back to the topology
/// service. Failures here are surfaced to the caller but never reopen a
/// completed task.
pub struct NodeStateUpdater {
    topology: Arc<dyn TopologyClient>,
}

impl NodeStateUpdater {
    pub fn new(topology: Arc<dyn TopologyClient>) -> Self {
        Self { topology }
    }

    pub async fn push_node_state(&self, node_id: &str, observed: PowerState) -> Result<()> {
        let state = match observed {
            PowerState::On => "Ready",
            PowerState::Off => "Off",
            other => {
                return Err(anyhow!(
                    "unsupported power state for node update: {}",
                    other.as_str()
                ))
            }
        };
        self.topology
            .patch_component_state(node_id, state)
            .await
            .map_err(|e| anyhow!("component state patch for {node_id} failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingTopology {
        patches: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl TopologyClient for RecordingTopology {
        async fn list_components(
            &self,
            _etag: Option<&str>,
        ) -> Result<ComponentFetch, TopologyError> {
            Ok(ComponentFetch::Modified {
                components: vec![],
                etag: None,
            })
        }

        async fn list_ethernet_interfaces(
            &self,
        ) -> Result<Vec<EthernetInterface>, TopologyError> {
            Ok(vec![])
        }

        async fn patch_component_state(&self, id: &str, state: &str) -> Result<(), TopologyError> {
            self.patches
                .lock()
                .unwrap()
                .push((id.to_string(), state.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn updater_maps_power_states() {
        let topo = Arc::new(RecordingTopology {
            patches: Mutex::new(vec![]),
        });
        let updater = NodeStateUpdater::new(topo.clone());

        updater
            .push_node_state("node-a", PowerState::On)
            .await
            .unwrap();
        updater
            .push_node_state("node-b", PowerState::Off)
            .await
            .unwrap();

        let patches = topo.patches.lock().unwrap().clone();
        assert_eq!(
            patches,
            vec![
                ("node-a".to_string(), "Ready".to_string()),
                ("node-b".to_string(), "Off".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn updater_rejects_transitional_states() {
        let topo = Arc::new(RecordingTopology {
            patches: Mutex::new(vec![]),
        });
        let updater = NodeStateUpdater::new(topo);
        let err = updater
            .push_node_state("node-a", PowerState::PoweringOn)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported power state"));
    }

    #[test]
    fn component_kind_tolerates_unknown_types() {
        let c: Component =
            serde_json::from_str(r#"{"id":"x1","type":"RouterBMC","parent":null}"#).unwrap();
        assert_eq!(c.kind, ComponentKind::Other);
        let c: Component =
            serde_json::from_str(r#"{"id":"n1","type":"Node","parent":"b1"}"#).unwrap();
        assert_eq!(c.kind, ComponentKind::Node);
        assert_eq!(c.parent.as_deref(), Some("b1"));
    }
}
