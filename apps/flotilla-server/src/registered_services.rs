//! Code-registered service types, routers and hooks available to every
//! deployment this binary can run.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::postgres::{PgPool, PgPoolOptions};

use flotilla::registry::Registry;
use flotilla_bootstrap::AppConfig;
use sync_config::PoolProvider;

/// Lazily-connected named pools backed by the `database:` config section.
pub struct NamedPools {
    servers: std::collections::HashMap<String, flotilla_bootstrap::DatabaseServerConfig>,
    pools: DashMap<String, PgPool>,
}

impl NamedPools {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            servers: config.database.clone(),
            pools: DashMap::new(),
        }
    }
}

#[async_trait]
impl PoolProvider for NamedPools {
    async fn named_pool(&self, name: &str) -> anyhow::Result<PgPool> {
        if let Some(pool) = self.pools.get(name) {
            return Ok(pool.clone());
        }
        let server = self.servers.get(name).ok_or_else(|| {
            anyhow::anyhow!("database pool '{name}' is not declared in the database: section")
        })?;
        let pool = PgPoolOptions::new()
            .max_connections(server.max_conns.unwrap_or(5))
            .connect(&server.dsn)
            .await
            .map_err(|err| anyhow::anyhow!("connecting pool '{name}' failed: {err}"))?;
        tracing::info!(pool = %name, "database pool connected");
        self.pools.insert(name.to_string(), pool.clone());
        Ok(pool)
    }
}

/// Register every service type, router factory and init hook this binary
/// ships with.
pub fn register_all(registry: &Arc<Registry>, config: &AppConfig) -> anyhow::Result<()> {
    let pools: Arc<dyn PoolProvider> = Arc::new(NamedPools::new(config));

    user_service::register(registry)?;
    sync_config::register(registry, pools)?;

    registry.register_router_factory("status", || {
        axum::Router::new().route(
            "/status",
            axum::routing::get(|| async { "flotilla-server" }),
        )
    })?;

    registry.register_server_init_hook(
        "log-startup",
        flotilla::registry::init_hook(|registry| async move {
            tracing::info!(?registry, "server init hook complete");
            Ok(())
        }),
    )?;

    Ok(())
}
