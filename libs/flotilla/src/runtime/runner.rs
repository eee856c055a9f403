//! Lifecycle runner: select a server, flatten its definitions, run its
//! init hook, bind listeners, and coordinate graceful shutdown.
//!
//! Phase order: normalize -> init hook -> seal -> mount & bind -> wait ->
//! drain -> service shutdown hooks (reverse resolution order).

use std::{future::Future, pin::Pin, sync::Arc};

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::deploy::config::DeploymentConfig;
use crate::deploy::normalize::{normalize_server, NormalizedServer};
use crate::registry::{Registry, ServiceSource};
use crate::runtime::server::{build_listener_router, serve_listener};
use crate::runtime::shutdown;

/// How the runtime decides when to stop.
pub enum ShutdownOptions {
    /// Listen for OS signals (Ctrl+C / SIGTERM).
    Signals,
    /// An external `CancellationToken` controls the lifecycle.
    Token(CancellationToken),
    /// An arbitrary future; when it completes, shutdown begins.
    Future(Pin<Box<dyn Future<Output = ()> + Send>>),
}

pub struct RunOptions {
    pub config: DeploymentConfig,
    pub registry: Arc<Registry>,
    /// `"deployment.server"`, a bare unambiguous server name, or `"first"`.
    pub server: String,
    pub shutdown: ShutdownOptions,
}

/// Full cycle for the selected server.
pub async fn run(opts: RunOptions) -> anyhow::Result<()> {
    let cancel = match &opts.shutdown {
        ShutdownOptions::Token(token) => token.clone(),
        _ => CancellationToken::new(),
    };

    match opts.shutdown {
        ShutdownOptions::Signals => {
            let token = cancel.clone();
            tokio::spawn(async move {
                if let Err(err) = shutdown::wait_for_shutdown().await {
                    tracing::warn!(error = %err, "signal waiter failed; falling back to ctrl_c");
                    let _ = tokio::signal::ctrl_c().await;
                }
                token.cancel();
            });
        }
        ShutdownOptions::Future(waiter) => {
            let token = cancel.clone();
            tokio::spawn(async move {
                waiter.await;
                tracing::info!("external shutdown future completed");
                token.cancel();
            });
        }
        ShutdownOptions::Token(_) => {
            tracing::debug!("external token controls the lifecycle");
        }
    }

    let (deployment, server) = opts.config.select_server(&opts.server)?;
    tracing::info!(deployment = %deployment, server = %server, "starting server");

    let normalized = normalize_server(&opts.config, &deployment, &server)?;
    let registry = opts.registry;
    apply_normalized(&registry, &normalized)?;

    // init hook runs before sealing so it can register manual routers
    if let Some(hook_name) = &normalized.server_config.init_hook {
        let hook = registry
            .server_init_hook(hook_name)
            .with_context(|| format!("server init hook '{hook_name}' is not registered"))?;
        hook(registry.clone())
            .await
            .with_context(|| format!("server init hook '{hook_name}' failed"))?;
    }
    registry.seal();

    // build all routers first so startup errors are fatal before any bind
    let mut bound = Vec::new();
    for listener in &normalized.server_config.listeners {
        let router = build_listener_router(&registry, listener).await?;
        bound.push((listener.addr.clone(), router));
    }

    let drain_timeout = normalized.server_config.shutdown_timeout;
    let mut tasks = Vec::new();
    for (addr, router) in bound {
        let cancel = cancel.clone();
        let task_addr = addr.clone();
        tasks.push((
            addr,
            tokio::spawn(async move {
                serve_listener(task_addr, router, cancel, drain_timeout).await
            }),
        ));
    }

    // each listener is an independent failure domain
    for (addr, task) in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!(addr = %addr, error = %err, "listener failed"),
            Err(err) => tracing::error!(addr = %addr, error = %err, "listener task panicked"),
        }
    }

    registry.shutdown_all().await;
    tracing::info!(deployment = %deployment, server = %server, "server stopped");
    Ok(())
}

/// Push normalized registrations and placement into the registry.
fn apply_normalized(registry: &Registry, normalized: &NormalizedServer) -> anyhow::Result<()> {
    for (name, def) in &normalized.middleware {
        registry
            .register_middleware_def(name.clone(), def.clone())
            .with_context(|| format!("registering middleware definition '{name}'"))?;
    }
    for (name, def) in &normalized.services {
        registry
            .register_lazy_service(
                name.clone(),
                ServiceSource::Type(def.kind.clone()),
                def.config.clone(),
                def.depends_on.clone(),
                def.middlewares.clone(),
            )
            .with_context(|| format!("registering service '{name}'"))?;
    }
    registry.set_placement(normalized.placement.clone());
    Ok(())
}
