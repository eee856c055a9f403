//! Lazy per-server flattening of the three-scope definition tree.
//!
//! Invoked once when a server is selected for execution. Deployment-scoped
//! definitions register as `D.name`, server-scoped ones as `D.S.name`;
//! short references inside normalized definitions are rewritten to the
//! most specific scope that declares them (server > deployment > global).
//! Inline definitions of unselected servers are left untouched.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::deploy::config::{
    DeployError, DeploymentConfig, MiddlewareDefinition, ServerConfig, ServiceDefinition,
};

/// Where a service in the dependency closure of the running server lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Local,
    Remote { server: String, base_url: String },
}

/// The flattened view of one selected server.
#[derive(Debug)]
pub struct NormalizedServer {
    pub deployment: String,
    pub server: String,
    /// Server config with listener service references rewritten to their
    /// registered names.
    pub server_config: ServerConfig,
    pub middleware: Vec<(String, MiddlewareDefinition)>,
    pub services: Vec<(String, ServiceDefinition)>,
    /// Source name to registered name, for the selected server's scopes.
    pub renames: BTreeMap<String, String>,
    /// Locality of every service on the dependency closure.
    pub placement: HashMap<String, Placement>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RefKind {
    Service,
    Middleware,
}

/// Scope tables for one `(deployment, server)` pair.
struct Scope<'a> {
    config: &'a DeploymentConfig,
    deployment: &'a str,
    server: &'a str,
    server_services: HashSet<&'a str>,
    server_middleware: HashSet<&'a str>,
    deployment_services: HashSet<&'a str>,
    deployment_middleware: HashSet<&'a str>,
}

impl<'a> Scope<'a> {
    fn for_server(
        config: &'a DeploymentConfig,
        deployment: &'a str,
        server: &'a str,
    ) -> Result<Self, DeployError> {
        let dep = config
            .deployments
            .get(deployment)
            .ok_or_else(|| DeployError::UnknownDeployment(deployment.to_string()))?;
        let srv = dep
            .servers
            .get(server)
            .ok_or_else(|| DeployError::UnknownServer(format!("{deployment}.{server}")))?;
        Ok(Self {
            config,
            deployment,
            server,
            server_services: srv
                .inline_service_definitions
                .keys()
                .map(String::as_str)
                .collect(),
            server_middleware: srv
                .inline_middleware_definitions
                .keys()
                .map(String::as_str)
                .collect(),
            deployment_services: dep
                .inline_service_definitions
                .keys()
                .map(String::as_str)
                .collect(),
            deployment_middleware: dep
                .inline_middleware_definitions
                .keys()
                .map(String::as_str)
                .collect(),
        })
    }

    /// Most-specific-scope lookup; `None` when no scope declares the name.
    fn lookup(&self, name: &str, kind: RefKind) -> Option<String> {
        let (server_set, deployment_set, globals) = match kind {
            RefKind::Service => (
                &self.server_services,
                &self.deployment_services,
                self.config.service_definitions.contains_key(name),
            ),
            RefKind::Middleware => (
                &self.server_middleware,
                &self.deployment_middleware,
                self.config.middleware_definitions.contains_key(name),
            ),
        };
        if server_set.contains(name) {
            return Some(format!("{}.{}.{name}", self.deployment, self.server));
        }
        if deployment_set.contains(name) {
            return Some(format!("{}.{name}", self.deployment));
        }
        if globals {
            return Some(name.to_string());
        }
        // already-qualified references to this server's scopes pass through
        if name.starts_with(&format!("{}.", self.deployment)) {
            let qualified_server = name
                .strip_prefix(&format!("{}.{}.", self.deployment, self.server))
                .map(|short| server_set.contains(short))
                .unwrap_or(false);
            let qualified_deployment = name
                .strip_prefix(&format!("{}.", self.deployment))
                .map(|short| deployment_set.contains(short))
                .unwrap_or(false);
            if qualified_server || qualified_deployment {
                return Some(name.to_string());
            }
        }
        None
    }

    fn resolve(&self, name: &str, kind: RefKind) -> Result<String, DeployError> {
        self.lookup(name, kind).ok_or_else(|| DeployError::UnknownReference {
            name: name.to_string(),
            searched: vec![
                format!("{}.{}.{name}", self.deployment, self.server),
                format!("{}.{name}", self.deployment),
                name.to_string(),
            ],
        })
    }
}

fn rewrite_service_def(
    scope: &Scope<'_>,
    def: &ServiceDefinition,
) -> Result<ServiceDefinition, DeployError> {
    let mut out = def.clone();
    out.depends_on = def
        .depends_on
        .iter()
        .map(|dep| scope.resolve(dep, RefKind::Service))
        .collect::<Result<_, _>>()?;
    out.middlewares = def
        .middlewares
        .iter()
        .map(|mw| scope.resolve(mw, RefKind::Middleware))
        .collect::<Result<_, _>>()?;
    Ok(out)
}

/// Flatten the selected server's definitions and compute service placement.
pub fn normalize_server(
    config: &DeploymentConfig,
    deployment: &str,
    server: &str,
) -> Result<NormalizedServer, DeployError> {
    let scope = Scope::for_server(config, deployment, server)?;
    let dep = &config.deployments[deployment];
    let srv = &dep.servers[server];

    let mut middleware = Vec::new();
    let mut services = Vec::new();
    let mut renames = BTreeMap::new();

    // global definitions register under their own name, references as written
    for (name, def) in &config.middleware_definitions {
        middleware.push((name.clone(), def.clone()));
    }
    for (name, def) in &config.service_definitions {
        services.push((name.clone(), def.clone()));
    }

    // deployment scope: D.<name>
    for (name, def) in &dep.inline_middleware_definitions {
        let full = format!("{deployment}.{name}");
        renames.insert(name.clone(), full.clone());
        middleware.push((full, def.clone()));
    }
    for (name, def) in &dep.inline_service_definitions {
        let full = format!("{deployment}.{name}");
        renames.insert(name.clone(), full.clone());
        services.push((full, rewrite_service_def(&scope, def)?));
    }

    // server scope: D.S.<name>; shadows deployment-scope renames
    for (name, def) in &srv.inline_middleware_definitions {
        let full = format!("{deployment}.{server}.{name}");
        renames.insert(name.clone(), full.clone());
        middleware.push((full, def.clone()));
    }
    for (name, def) in &srv.inline_service_definitions {
        let full = format!("{deployment}.{server}.{name}");
        renames.insert(name.clone(), full.clone());
        services.push((full, rewrite_service_def(&scope, def)?));
    }

    // rewrite listener service references
    let mut server_config = srv.clone();
    for listener in &mut server_config.listeners {
        listener.services = listener
            .services
            .iter()
            .map(|svc| scope.resolve(svc, RefKind::Service))
            .collect::<Result<_, _>>()?;
    }

    let placement = compute_placement(config, deployment, server, &server_config, &services)?;

    tracing::info!(
        deployment = %deployment,
        server = %server,
        services = services.len(),
        middleware = middleware.len(),
        "normalized server definitions"
    );

    Ok(NormalizedServer {
        deployment: deployment.to_string(),
        server: server.to_string(),
        server_config,
        middleware,
        services,
        renames,
        placement,
    })
}

/// Walk the dependency closure of the mounted services and decide, for each
/// member, whether it runs in-process or on another server.
///
/// A service mounted on one of this server's listeners is always local. A
/// dependency mounted on some other server's listener is remote, recorded
/// with that server's base URL. A dependency mounted nowhere is a plain
/// in-process service.
fn compute_placement(
    config: &DeploymentConfig,
    deployment: &str,
    server: &str,
    server_config: &ServerConfig,
    services: &[(String, ServiceDefinition)],
) -> Result<HashMap<String, Placement>, DeployError> {
    let defs: HashMap<&str, &ServiceDefinition> = services
        .iter()
        .map(|(name, def)| (name.as_str(), def))
        .collect();

    let mounted: HashSet<String> = server_config
        .listeners
        .iter()
        .flat_map(|l| l.services.iter().cloned())
        .collect();

    let mut placement = HashMap::new();
    let mut queue: VecDeque<String> = mounted.iter().cloned().collect();
    let mut seen: HashSet<String> = mounted.iter().cloned().collect();

    while let Some(name) = queue.pop_front() {
        if mounted.contains(&name) {
            placement.insert(name.clone(), Placement::Local);
        } else if let Some((target, base_url)) =
            find_mounting_server(config, deployment, server, &name)
        {
            placement.insert(
                name.clone(),
                Placement::Remote {
                    server: target,
                    base_url,
                },
            );
            // a remote dependency's own deps resolve on its host, not here
            continue;
        } else {
            placement.insert(name.clone(), Placement::Local);
        }

        if let Some(def) = defs.get(name.as_str()) {
            for dep in &def.depends_on {
                if seen.insert(dep.clone()) {
                    queue.push_back(dep.clone());
                }
            }
        }
    }

    Ok(placement)
}

/// Scan the whole deployments tree for a server (other than the selected
/// one) whose listeners mount `target`, resolving each listener reference
/// in that server's own scope.
fn find_mounting_server(
    config: &DeploymentConfig,
    selected_deployment: &str,
    selected_server: &str,
    target: &str,
) -> Option<(String, String)> {
    for (dname, dep) in &config.deployments {
        for (sname, srv) in &dep.servers {
            if dname == selected_deployment && sname == selected_server {
                continue;
            }
            let Ok(scope) = Scope::for_server(config, dname, sname) else {
                continue;
            };
            for listener in &srv.listeners {
                for svc in &listener.services {
                    if scope.lookup(svc, RefKind::Service).as_deref() == Some(target) {
                        return Some((format!("{dname}.{sname}"), srv.base_url.clone()));
                    }
                }
            }
        }
    }
    None
}
