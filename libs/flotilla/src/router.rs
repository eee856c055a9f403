//! Router generation: maps a service's operation set to axum routes using
//! the type's convention, wraps every operation in the JSON envelope, and
//! applies the descriptor and per-route middleware chains.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{on, MethodFilter};
use axum::{Json, Router};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::convention::join_prefix;
use crate::errors::{Envelope, ServiceError};
use crate::middleware;
use crate::registry::{Registry, RegistryError, RouterSpec};
use crate::service::ServiceInstance;

/// Everything an operation can read from the incoming request.
#[derive(Debug, Default)]
pub struct OperationRequest {
    pub path_params: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub headers: HeaderMap,
    pub body: Value,
}

impl OperationRequest {
    /// Required path parameter.
    pub fn param(&self, name: &str) -> Result<&str, ServiceError> {
        self.path_params
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| ServiceError::Validation(format!("missing path parameter '{name}'")))
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// Deserialize the JSON body into the operation's typed request.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ServiceError> {
        serde_json::from_value(self.body.clone())
            .map_err(|err| ServiceError::Validation(format!("invalid request body: {err}")))
    }
}

type JsonHandlerFn =
    Arc<dyn Fn(OperationRequest) -> BoxFuture<'static, Result<Value, ServiceError>> + Send + Sync>;
type UnitHandlerFn =
    Arc<dyn Fn(OperationRequest) -> BoxFuture<'static, Result<(), ServiceError>> + Send + Sync>;

/// The two canonical handler shapes; anything else mounts as a manually
/// registered router and passes through the generator untouched.
#[derive(Clone)]
pub enum OperationHandler {
    /// `request -> (T, error)`: 200 with an enveloped body on success.
    Json(JsonHandlerFn),
    /// `request -> error`: 204 on success.
    Unit(UnitHandlerFn),
}

/// One exported operation of a service.
#[derive(Clone)]
pub struct Operation {
    pub name: String,
    pub handler: OperationHandler,
}

impl Operation {
    pub fn json<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OperationRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ServiceError>> + Send + 'static,
    {
        let f = Arc::new(f);
        Self {
            name: name.into(),
            handler: OperationHandler::Json(Arc::new(move |req| {
                let f = f.clone();
                Box::pin(async move { f(req).await })
            })),
        }
    }

    pub fn unit<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OperationRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ServiceError>> + Send + 'static,
    {
        let f = Arc::new(f);
        Self {
            name: name.into(),
            handler: OperationHandler::Unit(Arc::new(move |req| {
                let f = f.clone();
                Box::pin(async move { f(req).await })
            })),
        }
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Operation({})", self.name)
    }
}

pub(crate) fn success_response(data: Value) -> Response {
    (StatusCode::OK, Json(Envelope::success(data))).into_response()
}

pub(crate) fn error_response(err: &ServiceError) -> Response {
    // full detail stays server-side; the envelope carries code + message
    tracing::error!(code = err.code(), error = %err, "operation failed");
    (err.status(), Json(Envelope::failure(err))).into_response()
}

/// Build a router that dispatches into a local service instance.
///
/// Route paths are `prefix + convention path`; per-route middleware wraps a
/// single route, then the descriptor chain plus `extra_middleware` (from
/// the service definition) wraps the whole router, first name outermost.
pub fn mount_service(
    registry: &Registry,
    name: &str,
    instance: &ServiceInstance,
    spec: &RouterSpec,
    extra_middleware: &[String],
) -> Result<Router, RegistryError> {
    let operations = instance.operations();
    if operations.is_empty() {
        return Err(RegistryError::NoOperations(name.to_string()));
    }

    let convention_name = spec.convention.as_deref().unwrap_or("rest");
    let convention = registry.convention(convention_name)?;
    let op_names: Vec<String> = operations.iter().map(|op| op.name.clone()).collect();
    let routes = convention.routes(&op_names, &spec.convention_options());

    let mut router = Router::new();
    for op in &operations {
        let Some(meta) = routes.get(&op.name) else {
            tracing::warn!(service = %name, operation = %op.name, "convention produced no route");
            continue;
        };
        let full_path = join_prefix(&spec.path_prefix, &meta.path);
        let filter = MethodFilter::try_from(meta.method.clone()).map_err(|_| {
            RegistryError::UnsupportedMethod {
                op: op.name.clone(),
                method: meta.method.clone(),
            }
        })?;

        let mut route = Router::new().route(&full_path, on(filter, operation_handler(op.handler.clone())));

        // per-route middleware, then any names carried on the route meta
        let mut route_mw: Vec<&String> = Vec::new();
        if let Some(names) = spec.route_middleware.get(&op.name) {
            route_mw.extend(names);
        }
        route_mw.extend(meta.middleware.iter());
        for mw_name in route_mw.into_iter().rev() {
            route = middleware::apply(route, registry.middleware(mw_name)?);
        }

        tracing::debug!(
            service = %name,
            operation = %op.name,
            method = %meta.method,
            path = %full_path,
            "mounted operation"
        );
        router = router.merge(route);
    }

    let mut chain: Vec<&String> = spec.middleware.iter().collect();
    chain.extend(extra_middleware.iter());
    for mw_name in chain.into_iter().rev() {
        router = middleware::apply(router, registry.middleware(mw_name)?);
    }

    Ok(router)
}

fn operation_handler(
    handler: OperationHandler,
) -> impl Fn(
    Path<HashMap<String, String>>,
    Query<HashMap<String, String>>,
    HeaderMap,
    Bytes,
) -> BoxFuture<'static, Response>
       + Clone
       + Send
       + 'static {
    move |Path(path_params), Query(query), headers, body: Bytes| {
        let handler = handler.clone();
        Box::pin(async move {
            let body_value = if body.is_empty() {
                Value::Null
            } else {
                match serde_json::from_slice(&body) {
                    Ok(value) => value,
                    Err(err) => {
                        return error_response(&ServiceError::Validation(format!(
                            "invalid JSON body: {err}"
                        )))
                    }
                }
            };
            let request = OperationRequest {
                path_params,
                query,
                headers,
                body: body_value,
            };
            match handler {
                OperationHandler::Json(f) => match f(request).await {
                    Ok(data) => success_response(data),
                    Err(err) => error_response(&err),
                },
                OperationHandler::Unit(f) => match f(request).await {
                    Ok(()) => StatusCode::NO_CONTENT.into_response(),
                    Err(err) => error_response(&err),
                },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convention::RouteMeta;
    use crate::registry::{ServiceSource, ServiceTypeOptions};
    use crate::service::{Service, ServiceFactory};
    use async_trait::async_trait;
    use http::Method;
    use parking_lot::RwLock;
    use std::any::Any;
    use tower::ServiceExt;

    #[derive(Default)]
    struct TestUsers {
        users: Arc<RwLock<HashMap<String, Value>>>,
    }

    #[async_trait]
    impl Service for TestUsers {
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }

        fn operations(&self) -> Vec<Operation> {
            let users = self.users.clone();
            let get_users = users.clone();
            let list_users = users.clone();
            let delete_users = users.clone();
            vec![
                Operation::json("CreateUser", move |req: OperationRequest| {
                    let users = users.clone();
                    async move {
                        let mut body = req.body.clone();
                        let id = uuid::Uuid::new_v4().to_string();
                        body["id"] = Value::String(id.clone());
                        users.write().insert(id, body.clone());
                        Ok(body)
                    }
                }),
                Operation::json("GetUser", move |req: OperationRequest| {
                    let users = get_users.clone();
                    async move {
                        let id = req.param("id")?.to_string();
                        users
                            .read()
                            .get(&id)
                            .cloned()
                            .ok_or_else(|| ServiceError::not_found("user", &id))
                    }
                }),
                Operation::json("ListUsers", move |_req| {
                    let users = list_users.clone();
                    async move {
                        let all: Vec<Value> = users.read().values().cloned().collect();
                        Ok(Value::Array(all))
                    }
                }),
                Operation::unit("DeleteUser", move |req: OperationRequest| {
                    let users = delete_users.clone();
                    async move {
                        let id = req.param("id")?.to_string();
                        users
                            .write()
                            .remove(&id)
                            .map(|_| ())
                            .ok_or_else(|| ServiceError::not_found("user", &id))
                    }
                }),
                Operation::json("Login", |req: OperationRequest| async move {
                    let email = req.body.get("email").cloned().unwrap_or(Value::Null);
                    Ok(serde_json::json!({"token": "ok", "email": email}))
                }),
            ]
        }
    }

    fn test_registry() -> (Registry, ServiceInstance) {
        let registry = Registry::new();
        let instance: ServiceInstance = Arc::new(TestUsers::default());
        (registry, instance)
    }

    fn user_spec() -> RouterSpec {
        let options = ServiceTypeOptions::default()
            .prefix("/api/v1")
            .resource("user", "users")
            .route("Login", RouteMeta::new(Method::POST, "/auth/login"));
        options.router
    }

    async fn send(
        router: &Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = http::Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                axum::body::Body::from(serde_json::to_vec(&value).unwrap())
            }
            None => axum::body::Body::empty(),
        };
        let res = router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn auto_rest_mount_round_trip() {
        let (registry, instance) = test_registry();
        let router =
            mount_service(&registry, "user-service", &instance, &user_spec(), &[]).unwrap();

        let (status, created) = send(
            &router,
            Method::POST,
            "/api/v1/users",
            Some(serde_json::json!({"name": "Alice", "email": "alice@example.com"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["success"], Value::Bool(true));
        let id = created["data"]["id"].as_str().unwrap().to_string();
        assert!(!id.is_empty());
        assert_eq!(created["data"]["name"], "Alice");
        assert_eq!(created["data"]["email"], "alice@example.com");

        let (status, fetched) =
            send(&router, Method::GET, &format!("/api/v1/users/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["data"]["name"], "Alice");

        let (status, listed) = send(&router, Method::GET, "/api/v1/users", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["data"].as_array().unwrap().len(), 1);

        let (status, body) =
            send(&router, Method::DELETE, &format!("/api/v1/users/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(body, Value::Null);

        let (status, missing) =
            send(&router, Method::GET, &format!("/api/v1/users/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(missing["success"], Value::Bool(false));
        assert_eq!(missing["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn override_route_is_not_resource_shaped() {
        let (registry, instance) = test_registry();
        let router =
            mount_service(&registry, "user-service", &instance, &user_spec(), &[]).unwrap();

        let (status, body) = send(
            &router,
            Method::POST,
            "/api/v1/auth/login",
            Some(serde_json::json!({"email": "a@b.c", "password": "pw"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["token"], "ok");

        // the convention-shaped path must not exist for the override
        let (status, _) = send(
            &router,
            Method::POST,
            "/api/v1/auths/login",
            Some(serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_json_body_maps_to_validation_error() {
        let (registry, instance) = test_registry();
        let router =
            mount_service(&registry, "user-service", &instance, &user_spec(), &[]).unwrap();

        let res = router
            .clone()
            .oneshot(
                http::Request::builder()
                    .method(Method::POST)
                    .uri("/api/v1/users")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn service_level_middleware_wraps_every_route() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static HITS: AtomicUsize = AtomicUsize::new(0);

        let (registry, instance) = test_registry();
        registry
            .register_middleware_factory(
                "hit-counter",
                crate::middleware::MiddlewareFactory::new(|_| {
                    Ok(crate::middleware::middleware_fn(
                        |req: axum::extract::Request, next: axum::middleware::Next| async move {
                            HITS.fetch_add(1, Ordering::SeqCst);
                            next.run(req).await
                        },
                    ))
                }),
            )
            .unwrap();

        let mut spec = user_spec();
        spec.middleware = vec!["hit-counter".to_string()];
        let router = mount_service(&registry, "user-service", &instance, &spec, &[]).unwrap();

        send(&router, Method::GET, "/api/v1/users", None).await;
        send(&router, Method::GET, "/api/v1/users", None).await;
        assert_eq!(HITS.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn mounting_a_service_without_operations_fails() {
        struct Opless;
        #[async_trait]
        impl Service for Opless {
            fn as_any(&self) -> &dyn Any {
                self
            }
            fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
                self
            }
        }

        let registry = Registry::new();
        let instance: ServiceInstance = Arc::new(Opless);
        let err =
            mount_service(&registry, "opless", &instance, &RouterSpec::default(), &[]).unwrap_err();
        assert!(matches!(err, RegistryError::NoOperations(_)));
    }

    #[tokio::test]
    async fn registry_resolves_and_mounts_inline_service() {
        let registry = Registry::new();
        registry
            .register_lazy_service(
                "users",
                ServiceSource::Inline(ServiceFactory::new(|| Ok(TestUsers::default()))),
                Value::Null,
                Vec::new(),
                Vec::new(),
            )
            .unwrap();

        let instance = registry.get_service("users").await.unwrap();
        let router =
            mount_service(&registry, "users", &instance, &user_spec(), &[]).unwrap();
        let (status, _) = send(&router, Method::GET, "/api/v1/users", None).await;
        assert_eq!(status, StatusCode::OK);
    }
}
