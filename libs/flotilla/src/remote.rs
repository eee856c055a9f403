//! Client-side proxies for services mounted on other servers.
//!
//! A [`RemoteClient`] is built from a [`RemoteTarget`] whose route map was
//! computed by the same convention the server side mounts with, so the URL
//! a client builds for an operation is the URL the server actually serves.

use std::collections::HashMap;

use http::Method;
use serde_json::{Map, Value};

use crate::convention::join_prefix;
use crate::errors::{Envelope, ServiceError};
use crate::service::RemoteTarget;

#[derive(Debug, Clone)]
pub struct RemoteClient {
    target: RemoteTarget,
    http: reqwest::Client,
}

impl RemoteClient {
    pub fn new(target: RemoteTarget) -> Self {
        Self {
            target,
            http: reqwest::Client::new(),
        }
    }

    pub fn target_server(&self) -> &str {
        &self.target.server
    }

    /// The method and fully interpolated URL for an operation. Path
    /// parameters are taken from `params`; a parameter the route needs but
    /// `params` lacks is a validation error.
    pub fn url_for(
        &self,
        operation: &str,
        params: &HashMap<String, String>,
    ) -> Result<(Method, String), ServiceError> {
        let meta = self.target.routes.get(operation).ok_or_else(|| {
            ServiceError::Internal(format!("operation '{operation}' has no route"))
        })?;
        let path = interpolate(&meta.path, params)?;
        let base = self.target.base_url.trim_end_matches('/');
        let prefixed = join_prefix(&self.target.path_prefix, &path);
        Ok((meta.method.clone(), format!("{base}{prefixed}")))
    }

    /// Route template for an operation, before interpolation. Useful for
    /// asserting client/server URL symmetry.
    pub fn route_template(&self, operation: &str) -> Option<String> {
        self.target
            .routes
            .get(operation)
            .map(|meta| join_prefix(&self.target.path_prefix, &meta.path))
    }

    /// Invoke a remote operation.
    ///
    /// Object payload fields matching `{param}` segments interpolate into
    /// the path and are removed. For GET the remaining scalar fields travel
    /// as query parameters; for every other method the remaining object is
    /// the JSON body.
    pub async fn call(&self, operation: &str, payload: Value) -> Result<Value, ServiceError> {
        let meta = self.target.routes.get(operation).ok_or_else(|| {
            ServiceError::Internal(format!("operation '{operation}' has no route"))
        })?;

        let mut body = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };

        let mut params = HashMap::new();
        for segment in path_param_names(&meta.path) {
            if let Some(value) = body.remove(&segment) {
                params.insert(segment, scalar_to_string(&value)?);
            }
        }

        let (method, url) = self.url_for(operation, &params)?;
        let mut request = self.http.request(method.clone(), &url);

        if method == Method::GET {
            let pairs: Vec<(String, String)> = body
                .iter()
                .filter_map(|(k, v)| scalar_to_string(v).ok().map(|s| (k.clone(), s)))
                .collect();
            if !pairs.is_empty() {
                request = request.query(&pairs);
            }
        } else if !body.is_empty() {
            request = request.json(&Value::Object(body));
        }

        let response = request
            .send()
            .await
            .map_err(|err| ServiceError::Internal(format!("remote call to {url} failed: {err}")))?;

        let status = response.status();
        if status == http::StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| ServiceError::Internal(format!("remote response read failed: {err}")))?;

        let envelope: Envelope = serde_json::from_slice(&bytes).map_err(|err| {
            ServiceError::Internal(format!(
                "remote response from {url} is not an envelope: {err}"
            ))
        })?;

        if envelope.success {
            return Ok(envelope.data.unwrap_or(Value::Null));
        }
        let error = envelope.error.ok_or_else(|| {
            ServiceError::Internal(format!("remote error from {url} carries no error body"))
        })?;
        Err(ServiceError::from_wire(
            status.as_u16(),
            &error.code,
            &error.message,
        ))
    }
}

fn interpolate(
    path: &str,
    params: &HashMap<String, String>,
) -> Result<String, ServiceError> {
    let mut out = String::with_capacity(path.len());
    for segment in path.split('/') {
        if segment.is_empty() {
            continue;
        }
        out.push('/');
        if let Some(name) = segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            let value = params.get(name).ok_or_else(|| {
                ServiceError::Validation(format!("missing path parameter '{name}'"))
            })?;
            out.push_str(value);
        } else {
            out.push_str(segment);
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

fn path_param_names(path: &str) -> Vec<String> {
    path.split('/')
        .filter_map(|segment| {
            segment
                .strip_prefix('{')
                .and_then(|s| s.strip_suffix('}'))
                .map(str::to_string)
        })
        .collect()
}

fn scalar_to_string(value: &Value) -> Result<String, ServiceError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(ServiceError::Validation(format!(
            "value {other} cannot be used as a URL component"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convention::{Convention, ConventionOptions, RestConvention, RouteMeta};
    use httpmock::prelude::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn target_for(base_url: &str) -> RemoteTarget {
        let opts = ConventionOptions {
            path_prefix: "/api/v1".into(),
            resource_singular: Some("user".into()),
            resource_plural: Some("users".into()),
            overrides: {
                let mut map = BTreeMap::new();
                map.insert(
                    "Login".to_string(),
                    RouteMeta::new(Method::POST, "/auth/login"),
                );
                map
            },
        };
        let ops: Vec<String> = ["GetUser", "ListUsers", "CreateUser", "DeleteUser", "Login"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        RemoteTarget {
            server: "backend".into(),
            base_url: base_url.to_string(),
            path_prefix: "/api/v1".into(),
            routes: RestConvention.routes(&ops, &opts),
        }
    }

    #[test]
    fn client_urls_match_server_side_routes() {
        let client = RemoteClient::new(target_for("http://backend:8080"));
        assert_eq!(
            client.route_template("GetUser").unwrap(),
            "/api/v1/users/{id}"
        );
        assert_eq!(client.route_template("ListUsers").unwrap(), "/api/v1/users");
        assert_eq!(
            client.route_template("Login").unwrap(),
            "/api/v1/auth/login"
        );

        let mut params = HashMap::new();
        params.insert("id".to_string(), "42".to_string());
        let (method, url) = client.url_for("GetUser", &params).unwrap();
        assert_eq!(method, Method::GET);
        assert_eq!(url, "http://backend:8080/api/v1/users/42");
    }

    #[test]
    fn missing_path_parameter_is_a_validation_error() {
        let client = RemoteClient::new(target_for("http://backend:8080"));
        let err = client.url_for("GetUser", &HashMap::new()).unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn call_interpolates_path_and_parses_envelope() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v1/users/42");
                then.status(200).json_body(json!({
                    "success": true,
                    "data": {"id": "42", "name": "Alice"}
                }));
            })
            .await;

        let client = RemoteClient::new(target_for(&server.base_url()));
        let data = client.call("GetUser", json!({"id": "42"})).await.unwrap();
        mock.assert_async().await;
        assert_eq!(data["name"], "Alice");
    }

    #[tokio::test]
    async fn call_sends_json_body_for_non_get() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/v1/users")
                    .json_body(json!({"name": "Alice", "email": "alice@example.com"}));
                then.status(200).json_body(json!({
                    "success": true,
                    "data": {"id": "1", "name": "Alice", "email": "alice@example.com"}
                }));
            })
            .await;

        let client = RemoteClient::new(target_for(&server.base_url()));
        let data = client
            .call(
                "CreateUser",
                json!({"name": "Alice", "email": "alice@example.com"}),
            )
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(data["id"], "1");
    }

    #[tokio::test]
    async fn call_sends_scalars_as_query_for_get() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/v1/users")
                    .query_param("limit", "10");
                then.status(200)
                    .json_body(json!({"success": true, "data": []}));
            })
            .await;

        let client = RemoteClient::new(target_for(&server.base_url()));
        client.call("ListUsers", json!({"limit": 10})).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn wire_errors_reconstruct_locally() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/v1/users/7");
                then.status(404).json_body(json!({
                    "success": false,
                    "error": {"code": "not_found", "message": "user '7' not found"}
                }));
            })
            .await;

        let client = RemoteClient::new(target_for(&server.base_url()));
        let err = client.call("GetUser", json!({"id": "7"})).await.unwrap_err();
        assert_eq!(err.code(), "not_found");
        assert_eq!(err.status().as_u16(), 404);
        assert_eq!(err.to_string(), "user '7' not found");
    }

    #[tokio::test]
    async fn no_content_maps_to_null() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(DELETE).path("/api/v1/users/42");
                then.status(204);
            })
            .await;

        let client = RemoteClient::new(target_for(&server.base_url()));
        let data = client.call("DeleteUser", json!({"id": "42"})).await.unwrap();
        assert_eq!(data, Value::Null);
    }
}
