use std::sync::Arc;

use powerctl_core::config::CoreConfig;
use powerctl_core::credentials::EnvCredentialResolver;
use powerctl_core::engine::TransitionEngine;
use powerctl_core::redfish::RedfishExecutor;
use powerctl_core::store::PowerStore;
use powerctl_core::store_memory::MemoryStore;
use powerctl_core::sync::MappingSynchronizer;
use powerctl_core::topology::HttpTopologyClient;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = CoreConfig::from_env()?;

    let topology_url = std::env::var("POWERCTL_TOPOLOGY_URL")
        .map_err(|_| "POWERCTL_TOPOLOGY_URL must be set")?;
    let topology = Arc::new(HttpTopologyClient::new(&topology_url)?);

    let store = build_store().await?;
    let executor = Arc::new(RedfishExecutor::new()?);
    let credentials = Arc::new(EnvCredentialResolver);

    let engine = Arc::new(TransitionEngine::new(
        store.clone(),
        executor,
        topology.clone(),
        credentials,
        cfg.clone(),
    ));

    let synchronizer = Arc::new(MappingSynchronizer::new(
        store,
        topology,
        cfg.mapping_sync_interval,
        cfg.sync_on_startup,
        cfg.default_credential_id.clone(),
    ));

    let shutdown = CancellationToken::new();
    let sync_loop = {
        let synchronizer = synchronizer.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { synchronizer.run(shutdown).await })
    };

    tracing::info!(topology = %topology_url, "power control core up, reconciling BMC mappings");

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, draining in-flight power tasks");

    shutdown.cancel();
    engine.shutdown().await;
    sync_loop.await?;

    Ok(())
}

/// Transitions, tasks, and the BMC mapping cache go to Postgres when
/// `POWERCTL_DATABASE_URL` (or plain `DATABASE_URL`) is set. Without one the
/// core runs entirely in process memory, which suits a lab bring-up but
/// loses transition history and synced mappings on restart.
async fn build_store() -> Result<Arc<dyn PowerStore>, Box<dyn std::error::Error>> {
    let url = std::env::var("POWERCTL_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .ok();

    #[cfg(feature = "postgres")]
    if let Some(url) = &url {
        let pool = sqlx::PgPool::connect(url).await?;
        let store = powerctl_core::store_postgres::PostgresStore::new(pool);
        store.migrate().await?;
        tracing::info!("transition history persisted to Postgres");
        return Ok(Arc::new(store));
    }

    #[cfg(not(feature = "postgres"))]
    if url.is_some() {
        tracing::warn!(
            "database URL is set but this build has no postgres feature, keeping state in memory"
        );
    }

    tracing::info!("running on the in-memory store, transition history will not survive a restart");
    Ok(Arc::new(MemoryStore::new()))
}
