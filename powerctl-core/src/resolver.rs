use crate::error::MappingError;
use crate::store::PowerStore;
use crate::types::RoutingRecord;
use anyhow::Result;
use std::sync::Arc;

/// Resolves node ids to dispatchable routing records against the mapping
/// cache. Read-only and side-effect free; output order is not guaranteed.
pub struct RoutingResolver {
    store: Arc<dyn PowerStore>,
}

impl RoutingResolver {
    pub fn new(store: Arc<dyn PowerStore>) -> Self {
        Self { store }
    }

    /// Resolve each node to `(bmc_id, endpoint, credential_id, tls flags)`
    /// or a typed mapping error. Store failures abort the whole resolution.
    pub async fn resolve(
        &self,
        node_ids: &[String],
    ) -> Result<(Vec<RoutingRecord>, Vec<MappingError>)> {
        let mut resolved = Vec::new();
        let mut errors = Vec::new();

        for node_id in node_ids {
            let Some(link) = self.store.get_link(node_id).await? else {
                errors.push(MappingError::not_found(node_id));
                continue;
            };

            let endpoint = match self.store.get_endpoint(&link.bmc_id).await? {
                Some(e) => e,
                None => {
                    errors.push(MappingError::endpoint_missing(node_id, &link.bmc_id));
                    continue;
                }
            };

            // A tombstone row counts as missing.
            let Some(url) = endpoint.endpoint.as_deref().filter(|u| !u.is_empty()) else {
                errors.push(MappingError::endpoint_missing(node_id, &link.bmc_id));
                continue;
            };

            let Some(credential_id) = endpoint
                .credential_id
                .as_deref()
                .filter(|c| !c.is_empty())
            else {
                errors.push(MappingError::credential_missing(node_id, &link.bmc_id));
                continue;
            };

            resolved.push(RoutingRecord {
                node_id: node_id.clone(),
                bmc_id: link.bmc_id.clone(),
                endpoint: url.to_string(),
                credential_id: credential_id.to_string(),
                insecure_skip_verify: endpoint.insecure_skip_verify,
            });
        }

        Ok((resolved, errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MappingErrorCode;
    use crate::store_memory::MemoryStore;
    use crate::types::{BmcEndpoint, MappingSource, NodeBmcLink};
    use chrono::Utc;

    async fn seed(store: &MemoryStore) {
        let now = Utc::now();
        let endpoints = [
            BmcEndpoint {
                bmc_id: "bmc-1".into(),
                endpoint: Some("https://10.1.0.10".into()),
                credential_id: Some("cred-x".into()),
                insecure_skip_verify: true,
                source: MappingSource::Topology,
                last_synced_at: Some(now),
                created_at: now,
                updated_at: now,
            },
            BmcEndpoint {
                bmc_id: "bmc-2".into(),
                endpoint: None,
                credential_id: Some("cred-x".into()),
                insecure_skip_verify: false,
                source: MappingSource::Topology,
                last_synced_at: Some(now),
                created_at: now,
                updated_at: now,
            },
            BmcEndpoint {
                bmc_id: "bmc-3".into(),
                endpoint: Some("https://10.1.0.12".into()),
                credential_id: None,
                insecure_skip_verify: false,
                source: MappingSource::Topology,
                last_synced_at: Some(now),
                created_at: now,
                updated_at: now,
            },
        ];
        let links = [
            ("node-1", "bmc-1"),
            ("node-2", "bmc-2"),
            ("node-3", "bmc-3"),
            ("node-orphan", "bmc-gone"),
        ];
        let links: Vec<NodeBmcLink> = links
            .iter()
            .map(|(n, b)| NodeBmcLink {
                node_id: n.to_string(),
                bmc_id: b.to_string(),
                source: MappingSource::Topology,
                last_synced_at: Some(now),
                created_at: now,
                updated_at: now,
            })
            .collect();
        store.replace_mappings(&endpoints, &links).await.unwrap();
    }

    #[tokio::test]
    async fn resolves_and_classifies() {
        let store = Arc::new(MemoryStore::new());
        seed(&store).await;
        let resolver = RoutingResolver::new(store);

        let (resolved, errors) = resolver
            .resolve(&[
                "node-1".into(),
                "node-2".into(),
                "node-3".into(),
                "node-orphan".into(),
                "node-missing".into(),
            ])
            .await
            .unwrap();

        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].bmc_id, "bmc-1");
        assert_eq!(resolved[0].endpoint, "https://10.1.0.10");
        assert_eq!(resolved[0].credential_id, "cred-x");
        assert!(resolved[0].insecure_skip_verify);

        let code_for = |node: &str| {
            errors
                .iter()
                .find(|e| e.node_id == node)
                .map(|e| e.code)
                .unwrap()
        };
        assert_eq!(code_for("node-2"), MappingErrorCode::EndpointMissing);
        assert_eq!(code_for("node-3"), MappingErrorCode::CredentialMissing);
        // An orphaned link (endpoint row gone entirely) is still a typed error.
        assert_eq!(code_for("node-orphan"), MappingErrorCode::EndpointMissing);
        assert_eq!(code_for("node-missing"), MappingErrorCode::MappingNotFound);
    }
}
