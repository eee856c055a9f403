//! In-memory users service demonstrating convention-based exposure:
//! CRUD operations mapped by the REST convention plus an explicit
//! `Login` route override, with a remote proxy for cross-server use.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use flotilla::convention::RouteMeta;
use flotilla::registry::{Registry, RegistryError, ServiceTypeOptions};
use flotilla::remote::RemoteClient;
use flotilla::router::{Operation, OperationRequest};
use flotilla::service::{RemoteFactory, RemoteTarget, Service, ServiceFactory};
use flotilla::{ServiceError, ValueExt};

/// The registered service type name.
pub const SERVICE_TYPE: &str = "user-service";

pub const OPERATIONS: &[&str] = &[
    "GetUser",
    "ListUsers",
    "CreateUser",
    "UpdateUser",
    "DeleteUser",
    "Login",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    name: String,
    email: String,
}

#[derive(Debug, Deserialize)]
struct LoginPayload {
    email: String,
    #[allow(dead_code)]
    password: String,
}

#[derive(Default)]
pub struct UserService {
    greeting: Option<String>,
    users: Arc<RwLock<HashMap<String, User>>>,
}

impl UserService {
    pub fn from_config(config: &Value) -> Self {
        Self {
            greeting: config.str_of("greeting").map(str::to_string),
            users: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn user_count(&self) -> usize {
        self.users.read().len()
    }
}

#[async_trait]
impl Service for UserService {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn operations(&self) -> Vec<Operation> {
        let users = self.users.clone();
        let get_store = users.clone();
        let list_store = users.clone();
        let update_store = users.clone();
        let delete_store = users.clone();
        let greeting = self.greeting.clone();

        vec![
            Operation::json("GetUser", move |req: OperationRequest| {
                let users = get_store.clone();
                async move {
                    let id = req.param("id")?.to_string();
                    let found = users.read().get(&id).cloned();
                    match found {
                        Some(user) => Ok(serde_json::to_value(user)
                            .map_err(ServiceError::internal)?),
                        None => Err(ServiceError::not_found("user", &id)),
                    }
                }
            }),
            Operation::json("ListUsers", move |_req: OperationRequest| {
                let users = list_store.clone();
                async move {
                    let mut all: Vec<User> = users.read().values().cloned().collect();
                    all.sort_by(|a, b| a.name.cmp(&b.name));
                    serde_json::to_value(all).map_err(ServiceError::internal)
                }
            }),
            Operation::json("CreateUser", move |req: OperationRequest| {
                let users = users.clone();
                async move {
                    let payload: UserPayload = req.parse()?;
                    if payload.email.is_empty() {
                        return Err(ServiceError::Validation("email must not be empty".into()));
                    }
                    let duplicate = users
                        .read()
                        .values()
                        .any(|user| user.email == payload.email);
                    if duplicate {
                        return Err(ServiceError::Conflict(format!(
                            "a user with email '{}' already exists",
                            payload.email
                        )));
                    }
                    let user = User {
                        id: uuid::Uuid::now_v7().to_string(),
                        name: payload.name,
                        email: payload.email,
                    };
                    users.write().insert(user.id.clone(), user.clone());
                    tracing::info!(user = %user.id, "user created");
                    serde_json::to_value(user).map_err(ServiceError::internal)
                }
            }),
            Operation::json("UpdateUser", move |req: OperationRequest| {
                let users = update_store.clone();
                async move {
                    let id = req.param("id")?.to_string();
                    let payload: UserPayload = req.parse()?;
                    let mut store = users.write();
                    let user = store
                        .get_mut(&id)
                        .ok_or_else(|| ServiceError::not_found("user", &id))?;
                    user.name = payload.name;
                    user.email = payload.email;
                    serde_json::to_value(user.clone()).map_err(ServiceError::internal)
                }
            }),
            Operation::unit("DeleteUser", move |req: OperationRequest| {
                let users = delete_store.clone();
                async move {
                    let id = req.param("id")?.to_string();
                    users
                        .write()
                        .remove(&id)
                        .map(|_| ())
                        .ok_or_else(|| ServiceError::not_found("user", &id))
                }
            }),
            Operation::json("Login", move |req: OperationRequest| {
                let greeting = greeting.clone();
                async move {
                    let payload: LoginPayload = req.parse()?;
                    // demo only: issue an opaque token for any credentials
                    Ok(json!({
                        "token": uuid::Uuid::now_v7().to_string(),
                        "email": payload.email,
                        "greeting": greeting,
                    }))
                }
            }),
        ]
    }
}

/// Remote proxy with the same operation surface, built from the target
/// computed by the server-side convention.
pub struct UserServiceClient {
    client: RemoteClient,
}

impl UserServiceClient {
    pub fn new(target: RemoteTarget) -> Self {
        Self {
            client: RemoteClient::new(target),
        }
    }

    pub async fn get_user(&self, id: &str) -> Result<User, ServiceError> {
        let data = self.client.call("GetUser", json!({"id": id})).await?;
        serde_json::from_value(data).map_err(ServiceError::internal)
    }

    pub async fn list_users(&self) -> Result<Vec<User>, ServiceError> {
        let data = self.client.call("ListUsers", Value::Null).await?;
        serde_json::from_value(data).map_err(ServiceError::internal)
    }

    pub async fn create_user(&self, name: &str, email: &str) -> Result<User, ServiceError> {
        let data = self
            .client
            .call("CreateUser", json!({"name": name, "email": email}))
            .await?;
        serde_json::from_value(data).map_err(ServiceError::internal)
    }

    pub async fn delete_user(&self, id: &str) -> Result<(), ServiceError> {
        self.client.call("DeleteUser", json!({"id": id})).await?;
        Ok(())
    }
}

#[async_trait]
impl Service for UserServiceClient {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Register the `user-service` type with its local and remote factories.
pub fn register(registry: &Registry) -> Result<(), RegistryError> {
    registry.register_service_type(
        SERVICE_TYPE,
        ServiceFactory::with_config(|config| Ok(UserService::from_config(&config))),
        Some(RemoteFactory::new(|target, _config| {
            Ok(UserServiceClient::new(target))
        })),
        ServiceTypeOptions::default()
            .prefix("/api/v1")
            .resource("user", "users")
            .convention("rest")
            .operations(OPERATIONS)
            .route("Login", RouteMeta::new(http::Method::POST, "/auth/login")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla::registry::ServiceSource;
    use flotilla::router::mount_service;
    use flotilla::service::ServiceInstance;
    use http::{Method, StatusCode};
    use tower::ServiceExt;

    async fn mounted_router() -> (Arc<Registry>, axum::Router) {
        let registry = Arc::new(Registry::new());
        register(&registry).unwrap();
        registry
            .register_lazy_service(
                "users",
                ServiceSource::Type(SERVICE_TYPE.to_string()),
                Value::Null,
                Vec::new(),
                Vec::new(),
            )
            .unwrap();
        let instance = registry.get_service("users").await.unwrap();
        let spec = registry
            .get_service_metadata(SERVICE_TYPE)
            .unwrap()
            .router
            .clone();
        let router = mount_service(&registry, "users", &instance, &spec, &[]).unwrap();
        (registry, router)
    }

    async fn request(
        router: &axum::Router,
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
        let response = router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn create_then_fetch_round_trip() {
        let (_registry, router) = mounted_router().await;

        let (status, body) = request(
            &router,
            Method::POST,
            "/api/v1/users",
            Some(json!({"name": "Alice", "email": "alice@example.com"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], Value::Bool(true));
        let id = body["data"]["id"].as_str().unwrap().to_string();
        assert!(!id.is_empty());

        let (status, body) =
            request(&router, Method::GET, &format!("/api/v1/users/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["email"], "alice@example.com");
    }

    #[tokio::test]
    async fn duplicate_email_conflicts() {
        let (_registry, router) = mounted_router().await;
        let payload = json!({"name": "Alice", "email": "alice@example.com"});

        let (status, _) =
            request(&router, Method::POST, "/api/v1/users", Some(payload.clone())).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) =
            request(&router, Method::POST, "/api/v1/users", Some(payload)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "conflict");
    }

    #[tokio::test]
    async fn login_uses_the_override_path() {
        let (_registry, router) = mounted_router().await;

        let (status, body) = request(
            &router,
            Method::POST,
            "/api/v1/auth/login",
            Some(json!({"email": "a@b.c", "password": "pw"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"]["token"].as_str().is_some());

        let (status, _) = request(
            &router,
            Method::POST,
            "/api/v1/auths/login",
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_returns_no_content_then_404() {
        let (_registry, router) = mounted_router().await;

        let (_, created) = request(
            &router,
            Method::POST,
            "/api/v1/users",
            Some(json!({"name": "Bob", "email": "bob@example.com"})),
        )
        .await;
        let id = created["data"]["id"].as_str().unwrap().to_string();

        let (status, _) =
            request(&router, Method::DELETE, &format!("/api/v1/users/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) =
            request(&router, Method::DELETE, &format!("/api/v1/users/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn remote_routes_match_mounted_routes() {
        let registry = Registry::new();
        register(&registry).unwrap();
        let descriptor = registry.get_service_metadata(SERVICE_TYPE).unwrap();
        let target = registry
            .remote_target(&descriptor, "backend".into(), "http://backend:9000".into())
            .unwrap();
        let client = RemoteClient::new(target);

        assert_eq!(
            client.route_template("GetUser").unwrap(),
            "/api/v1/users/{id}"
        );
        assert_eq!(
            client.route_template("Login").unwrap(),
            "/api/v1/auth/login"
        );
        assert_eq!(client.route_template("ListUsers").unwrap(), "/api/v1/users");
    }
}
