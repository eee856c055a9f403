//! Middleware contract: a named factory producing a request-wrapping
//! function. Factories take a single config mapping; the produced function
//! receives the request and the next handler in the chain.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::value::ValueExt;

/// The function a middleware factory produces.
pub type MiddlewareFn =
    Arc<dyn Fn(Request, Next) -> BoxFuture<'static, Response> + Send + Sync>;

type BuildFn = dyn Fn(&Value) -> anyhow::Result<MiddlewareFn> + Send + Sync;

#[derive(Clone)]
pub struct MiddlewareFactory {
    f: Arc<BuildFn>,
}

impl MiddlewareFactory {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Value) -> anyhow::Result<MiddlewareFn> + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }

    pub fn build(&self, config: &Value) -> anyhow::Result<MiddlewareFn> {
        (self.f)(config)
    }
}

impl std::fmt::Debug for MiddlewareFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MiddlewareFactory")
    }
}

/// Wrap an axum router with one middleware function.
pub fn apply(router: axum::Router, mw: MiddlewareFn) -> axum::Router {
    router.layer(axum::middleware::from_fn(
        move |req: Request, next: Next| {
            let mw = mw.clone();
            async move { mw(req, next).await }
        },
    ))
}

/// Wrap a plain async function into a [`MiddlewareFn`].
pub fn middleware_fn<F, Fut>(f: F) -> MiddlewareFn
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Response> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |req, next| {
        let f = f.clone();
        Box::pin(async move { f(req, next).await })
    })
}

/// Built-in request logger factory. Config: `{ "tag": "api" }`.
pub fn request_logger_factory() -> MiddlewareFactory {
    MiddlewareFactory::new(|config| {
        let tag = config.str_or("tag", "http");
        Ok(middleware_fn(move |req: Request, next: Next| {
            let tag = tag.clone();
            async move {
                let method = req.method().clone();
                let path = req.uri().path().to_string();
                let started = Instant::now();
                let res = next.run(req).await;
                tracing::info!(
                    %method,
                    path = %path,
                    status = res.status().as_u16(),
                    latency_ms = started.elapsed().as_millis() as u64,
                    tag = %tag,
                    "request handled"
                );
                res
            }
        }))
    })
}
