//! Listener construction and serving.
//!
//! Each listener owns one axum router assembled from its mounted services
//! and named routers, wrapped in the ambient layer stack: request-id
//! propagation, HTTP trace span, and panic recovery (outermost).

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::{HeaderName, HeaderValue, Request};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::trace::TraceLayer;

use crate::deploy::config::ListenerConfig;
use crate::errors::ServiceError;
use crate::registry::{Registry, RegistryError, RouterSpec, ServiceSource};
use crate::router::{error_response, mount_service};

const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone, Default)]
struct MakeReqId;

impl MakeRequestId for MakeReqId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&uuid::Uuid::now_v7().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// Build the router for one listener: auto-generated service routers plus
/// named routers / router factories, then the ambient layers.
pub async fn build_listener_router(
    registry: &Arc<Registry>,
    listener: &ListenerConfig,
) -> Result<Router, RegistryError> {
    let mut router = Router::new();

    for service_name in &listener.services {
        let entry = registry
            .lazy_entry(service_name)
            .ok_or_else(|| RegistryError::NotFound(service_name.clone()))?;
        let spec = match &entry.source {
            ServiceSource::Type(type_name) => registry
                .get_service_metadata(type_name)
                .map(|d| d.router.clone())
                .ok_or_else(|| RegistryError::TypeNotFound(type_name.clone()))?,
            ServiceSource::Inline(_) => RouterSpec::default(),
        };
        let instance = registry.get_service(service_name).await?;
        let service_router =
            mount_service(registry, service_name, &instance, &spec, &entry.middleware)?;
        router = router.merge(service_router);
    }

    for router_name in &listener.routers {
        router = router.merge(registry.router(router_name)?);
    }

    router = router.route("/healthz", get(health));

    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);
    router = router
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(request_id.clone(), MakeReqId))
        .layer(PropagateRequestIdLayer::new(request_id))
        .layer(CatchPanicLayer::custom(panic_response));

    Ok(router)
}

async fn health() -> &'static str {
    "ok"
}

fn panic_response(_err: Box<dyn Any + Send + 'static>) -> axum::response::Response {
    tracing::error!("request handler panicked");
    error_response(&ServiceError::Internal("handler panicked".into())).into_response()
}

/// Serve one listener until cancellation. On cancellation the listener
/// stops accepting immediately, in-flight requests drain for up to
/// `drain_timeout`, then the task is aborted.
pub async fn serve_listener(
    addr: String,
    router: Router,
    cancel: CancellationToken,
    drain_timeout: Duration,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind listener on {addr}"))?;
    tracing::info!(addr = %addr, "listener bound");

    let shutdown_token = cancel.clone();
    let mut task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
            .await
    });

    tokio::select! {
        joined = &mut task => {
            joined
                .context("listener task panicked")?
                .with_context(|| format!("listener on {addr} failed"))?;
        }
        () = cancel.cancelled() => {
            match tokio::time::timeout(drain_timeout, &mut task).await {
                Ok(joined) => {
                    joined
                        .context("listener task panicked")?
                        .with_context(|| format!("listener on {addr} failed during drain"))?;
                    tracing::info!(addr = %addr, "listener drained");
                }
                Err(_) => {
                    task.abort();
                    tracing::warn!(
                        addr = %addr,
                        timeout = ?drain_timeout,
                        "drain timeout exceeded, forcing listener stop"
                    );
                }
            }
        }
    }
    Ok(())
}
