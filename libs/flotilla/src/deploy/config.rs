//! The parsed deployment tree: three-scope inline definitions
//! (global / deployment / server), servers and their listeners.
//!
//! Maps are `IndexMap` so "first server declared" stays meaningful for the
//! `"first"` selector sentinel.

use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("deployment '{0}' does not exist")]
    UnknownDeployment(String),
    #[error("server '{0}' does not exist")]
    UnknownServer(String),
    #[error("server name '{name}' is ambiguous: found in deployments {matches:?}")]
    AmbiguousServer { name: String, matches: Vec<String> },
    #[error("configuration declares no servers")]
    NoServers,
    #[error("unknown reference '{name}' (searched {searched:?})")]
    UnknownReference {
        name: String,
        searched: Vec<String>,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DeploymentConfig {
    pub middleware_definitions: IndexMap<String, MiddlewareDefinition>,
    pub service_definitions: IndexMap<String, ServiceDefinition>,
    pub deployments: IndexMap<String, Deployment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareDefinition {
    /// Middleware factory type to instantiate.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServiceDefinition {
    /// Registered service type, or the name another definition is known by.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Middleware applied to every route of this service when mounted.
    #[serde(default)]
    pub middlewares: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Deployment {
    pub inline_middleware_definitions: IndexMap<String, MiddlewareDefinition>,
    pub inline_service_definitions: IndexMap<String, ServiceDefinition>,
    pub servers: IndexMap<String, ServerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerConfig {
    pub base_url: String,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    pub listeners: Vec<ListenerConfig>,
    pub inline_middleware_definitions: IndexMap<String, MiddlewareDefinition>,
    pub inline_service_definitions: IndexMap<String, ServiceDefinition>,
    /// Name of a code-registered hook run before listeners bind.
    pub init_hook: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            shutdown_timeout: Duration::from_secs(30),
            listeners: Vec::new(),
            inline_middleware_definitions: IndexMap::new(),
            inline_service_definitions: IndexMap::new(),
            init_hook: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ListenerConfig {
    pub addr: String,
    pub services: Vec<String>,
    pub routers: Vec<String>,
}

impl DeploymentConfig {
    /// Resolve a server selector into `(deployment, server)`.
    ///
    /// Accepts `"deployment.server"`, a bare server name when it is
    /// unambiguous across deployments, or `"first"` for the first server
    /// declared.
    pub fn select_server(&self, selector: &str) -> Result<(String, String), DeployError> {
        if selector == "first" {
            for (dname, deployment) in &self.deployments {
                if let Some((sname, _)) = deployment.servers.first() {
                    return Ok((dname.clone(), sname.clone()));
                }
            }
            return Err(DeployError::NoServers);
        }

        if let Some((dname, sname)) = selector.split_once('.') {
            let deployment = self
                .deployments
                .get(dname)
                .ok_or_else(|| DeployError::UnknownDeployment(dname.to_string()))?;
            if !deployment.servers.contains_key(sname) {
                return Err(DeployError::UnknownServer(selector.to_string()));
            }
            return Ok((dname.to_string(), sname.to_string()));
        }

        let matches: Vec<String> = self
            .deployments
            .iter()
            .filter(|(_, d)| d.servers.contains_key(selector))
            .map(|(dname, _)| dname.clone())
            .collect();
        match matches.as_slice() {
            [] => Err(DeployError::UnknownServer(selector.to_string())),
            [single] => Ok((single.clone(), selector.to_string())),
            _ => Err(DeployError::AmbiguousServer {
                name: selector.to_string(),
                matches,
            }),
        }
    }

    pub fn server(&self, deployment: &str, server: &str) -> Result<&ServerConfig, DeployError> {
        self.deployments
            .get(deployment)
            .ok_or_else(|| DeployError::UnknownDeployment(deployment.to_string()))?
            .servers
            .get(server)
            .ok_or_else(|| DeployError::UnknownServer(format!("{deployment}.{server}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_deployment_config() -> DeploymentConfig {
        let yaml = r#"
deployments:
  development:
    servers:
      dev-server:
        base-url: "http://localhost:8080"
        listeners:
          - addr: "127.0.0.1:8080"
            services: ["user-service"]
  production:
    servers:
      api:
        base-url: "http://api.internal:80"
        listeners: []
      worker:
        base-url: "http://worker.internal:80"
        listeners: []
"#;
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn parses_kebab_case_tree() {
        let config = two_deployment_config();
        let server = config.server("development", "dev-server").unwrap();
        assert_eq!(server.base_url, "http://localhost:8080");
        assert_eq!(server.shutdown_timeout, Duration::from_secs(30));
        assert_eq!(server.listeners[0].services, vec!["user-service"]);
    }

    #[test]
    fn shutdown_timeout_accepts_humantime() {
        let yaml = r#"
deployments:
  d:
    servers:
      s:
        shutdown-timeout: 5s
        listeners: []
"#;
        let config: DeploymentConfig = serde_yaml::from_str(yaml).unwrap();
        let server = config.server("d", "s").unwrap();
        assert_eq!(server.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn selector_shapes() {
        let config = two_deployment_config();
        assert_eq!(
            config.select_server("development.dev-server").unwrap(),
            ("development".to_string(), "dev-server".to_string())
        );
        assert_eq!(
            config.select_server("api").unwrap(),
            ("production".to_string(), "api".to_string())
        );
        assert_eq!(
            config.select_server("first").unwrap(),
            ("development".to_string(), "dev-server".to_string())
        );
        assert!(matches!(
            config.select_server("ghost"),
            Err(DeployError::UnknownServer(_))
        ));
    }

    #[test]
    fn ambiguous_bare_name_is_rejected() {
        let yaml = r#"
deployments:
  a:
    servers:
      web:
        listeners: []
  b:
    servers:
      web:
        listeners: []
"#;
        let config: DeploymentConfig = serde_yaml::from_str(yaml).unwrap();
        match config.select_server("web").unwrap_err() {
            DeployError::AmbiguousServer { matches, .. } => {
                assert_eq!(matches.len(), 2);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }
}
