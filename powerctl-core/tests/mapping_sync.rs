//! Mapping synchronizer against a scripted topology service, end to end
//! through the running loop, then routing resolution over the synced cache.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use powerctl_core::error::MappingErrorCode;
use powerctl_core::resolver::RoutingResolver;
use powerctl_core::store::PowerStore;
use powerctl_core::store_memory::MemoryStore;
use powerctl_core::sync::MappingSynchronizer;
use powerctl_core::topology::{
    Component, ComponentFetch, ComponentKind, EthernetInterface, TopologyClient, TopologyError,
};
use powerctl_core::types::{BmcEndpoint, MappingSource};

struct FakeTopology {
    components: Mutex<Vec<Component>>,
    interfaces: Mutex<Vec<EthernetInterface>>,
    etag: Mutex<String>,
}

#[async_trait]
impl TopologyClient for FakeTopology {
    async fn list_components(&self, etag: Option<&str>) -> Result<ComponentFetch, TopologyError> {
        let current = self.etag.lock().unwrap().clone();
        if etag == Some(current.as_str()) {
            return Ok(ComponentFetch::NotModified);
        }
        Ok(ComponentFetch::Modified {
            components: self.components.lock().unwrap().clone(),
            etag: Some(current),
        })
    }

    async fn list_ethernet_interfaces(&self) -> Result<Vec<EthernetInterface>, TopologyError> {
        Ok(self.interfaces.lock().unwrap().clone())
    }

    async fn patch_component_state(&self, _id: &str, _state: &str) -> Result<(), TopologyError> {
        Ok(())
    }
}

fn bmc(id: &str) -> Component {
    Component {
        id: id.into(),
        kind: ComponentKind::NodeBmc,
        parent: None,
    }
}

fn node(id: &str, parent: &str) -> Component {
    Component {
        id: id.into(),
        kind: ComponentKind::Node,
        parent: Some(parent.into()),
    }
}

/// Upstream lists bmc-1/bmc-2 with node-1/node-2, only bmc-1 has an
/// address; the store already holds a credential for bmc-1 and a stale
/// bmc-old tombstone. The sync replaces the cache, preserves the
/// credential, and the resolver classifies lookups against the result.
#[tokio::test]
async fn sync_then_resolve_scenario() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now();
    store
        .replace_mappings(
            &[
                BmcEndpoint {
                    bmc_id: "bmc-1".into(),
                    endpoint: Some("https://10.9.9.9".into()),
                    credential_id: Some("cred-x".into()),
                    insecure_skip_verify: false,
                    source: MappingSource::Topology,
                    last_synced_at: None,
                    created_at: now,
                    updated_at: now,
                },
                BmcEndpoint {
                    bmc_id: "bmc-old".into(),
                    endpoint: None,
                    credential_id: None,
                    insecure_skip_verify: false,
                    source: MappingSource::Topology,
                    last_synced_at: None,
                    created_at: now,
                    updated_at: now,
                },
            ],
            &[],
        )
        .await
        .unwrap();

    let topology = Arc::new(FakeTopology {
        components: Mutex::new(vec![
            bmc("bmc-1"),
            bmc("bmc-2"),
            node("node-1", "bmc-1"),
            node("node-2", "bmc-2"),
        ]),
        interfaces: Mutex::new(vec![EthernetInterface {
            component_id: "bmc-1".into(),
            ip_address: "10.1.0.10".into(),
        }]),
        etag: Mutex::new("v1".into()),
    });

    let synchronizer = Arc::new(MappingSynchronizer::new(
        store.clone(),
        topology,
        Duration::from_secs(300),
        false,
        None,
    ));

    let shutdown = CancellationToken::new();
    let loop_handle = {
        let synchronizer = synchronizer.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { synchronizer.run(shutdown).await })
    };

    let status = synchronizer.trigger(Duration::from_secs(5)).await.unwrap();
    assert!(status.ready);
    assert_eq!(status.last_counts.endpoints_upserted, 2);
    assert_eq!(status.last_counts.endpoints_deleted, 1);
    assert_eq!(status.last_counts.links_upserted, 2);

    let bmc1 = store.get_endpoint("bmc-1").await.unwrap().unwrap();
    assert_eq!(bmc1.endpoint.as_deref(), Some("https://10.1.0.10"));
    assert_eq!(bmc1.credential_id.as_deref(), Some("cred-x"));
    let bmc2 = store.get_endpoint("bmc-2").await.unwrap().unwrap();
    assert_eq!(bmc2.endpoint, None);

    // A second trigger with unchanged upstream skips reconciliation.
    let status = synchronizer.trigger(Duration::from_secs(5)).await.unwrap();
    assert!(status.last_not_modified);
    assert_eq!(status.last_counts.endpoints_upserted, 0);
    assert_eq!(status.last_counts.endpoints_deleted, 0);

    let resolver = RoutingResolver::new(store.clone());
    let (resolved, errors) = resolver
        .resolve(&["node-1".into(), "node-2".into(), "node-missing".into()])
        .await
        .unwrap();

    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].node_id, "node-1");
    assert_eq!(resolved[0].bmc_id, "bmc-1");
    assert_eq!(errors.len(), 2);
    let code_for = |node: &str| {
        errors
            .iter()
            .find(|e| e.node_id == node)
            .map(|e| e.code)
            .unwrap()
    };
    assert_eq!(code_for("node-2"), MappingErrorCode::EndpointMissing);
    assert_eq!(code_for("node-missing"), MappingErrorCode::MappingNotFound);

    shutdown.cancel();
    loop_handle.await.unwrap();
}
