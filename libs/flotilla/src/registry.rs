//! Service registry: the single authority for service types, lazy service
//! entries, middleware, named routers, conventions and init hooks.
//!
//! Resolution is lazy and memoized. Each lazy entry resolves at most once
//! per process; concurrent callers collapse behind a per-name single-flight
//! cell, and mid-resolution re-entry on the same name is reported as a
//! cycle carrying the full chain.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::convention::{Convention, ConventionOptions, RestConvention, RouteMeta};
use crate::deploy::config::MiddlewareDefinition;
use crate::deploy::normalize::Placement;
use crate::middleware::{MiddlewareFactory, MiddlewareFn};
use crate::service::{
    downcast, Dependencies, RemoteFactory, RemoteTarget, Service, ServiceFactory, ServiceInstance,
};
use crate::value::take_depends_on;

/// Router metadata attached to a service type.
#[derive(Debug, Clone, Default)]
pub struct RouterSpec {
    pub path_prefix: String,
    pub middleware: Vec<String>,
    pub overrides: BTreeMap<String, RouteMeta>,
    pub route_middleware: BTreeMap<String, Vec<String>>,
    pub convention: Option<String>,
    pub resource_singular: Option<String>,
    pub resource_plural: Option<String>,
}

impl RouterSpec {
    pub fn convention_options(&self) -> ConventionOptions {
        ConventionOptions {
            path_prefix: self.path_prefix.clone(),
            resource_singular: self.resource_singular.clone(),
            resource_plural: self.resource_plural.clone(),
            overrides: self.overrides.clone(),
        }
    }
}

/// Per-type metadata held for a registered factory.
#[derive(Debug)]
pub struct ServiceTypeDescriptor {
    pub name: String,
    pub local: ServiceFactory,
    pub remote: Option<RemoteFactory>,
    /// Declared operation names; feeds the client-side route map for
    /// remote proxies.
    pub operations: Vec<String>,
    pub router: RouterSpec,
}

/// Options merged into a [`ServiceTypeDescriptor`] at registration.
#[derive(Debug, Clone, Default)]
pub struct ServiceTypeOptions {
    pub router: RouterSpec,
    pub operations: Vec<String>,
    pub allow_override: bool,
}

impl ServiceTypeOptions {
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.router.path_prefix = prefix.into();
        self
    }

    pub fn resource(mut self, singular: impl Into<String>, plural: impl Into<String>) -> Self {
        self.router.resource_singular = Some(singular.into());
        self.router.resource_plural = Some(plural.into());
        self
    }

    pub fn convention(mut self, name: impl Into<String>) -> Self {
        self.router.convention = Some(name.into());
        self
    }

    pub fn middleware(mut self, names: &[&str]) -> Self {
        self.router.middleware = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn route(mut self, operation: impl Into<String>, meta: RouteMeta) -> Self {
        self.router.overrides.insert(operation.into(), meta);
        self
    }

    pub fn route_middleware(mut self, operation: impl Into<String>, names: &[&str]) -> Self {
        self.router
            .route_middleware
            .insert(operation.into(), names.iter().map(|n| n.to_string()).collect());
        self
    }

    pub fn operations(mut self, names: &[&str]) -> Self {
        self.operations = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn allow_override(mut self) -> Self {
        self.allow_override = true;
        self
    }
}

/// How a lazy entry finds its factory.
#[derive(Clone)]
pub enum ServiceSource {
    Type(String),
    Inline(ServiceFactory),
}

impl std::fmt::Debug for ServiceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Type(name) => write!(f, "Type({name})"),
            Self::Inline(_) => f.write_str("Inline"),
        }
    }
}

#[derive(Debug)]
pub struct LazyServiceEntry {
    pub name: String,
    pub source: ServiceSource,
    pub config: Value,
    pub depends_on: Vec<String>,
    /// Middleware names from the service definition, appended to the
    /// descriptor chain at mount time.
    pub middleware: Vec<String>,
}

/// Hook run after normalization and before listeners bind, for manual
/// router registration and other server-scoped wiring.
pub type ServerInitHook =
    Arc<dyn Fn(Arc<Registry>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap a plain async function into a [`ServerInitHook`].
pub fn init_hook<F, Fut>(f: F) -> ServerInitHook
where
    F: Fn(Arc<Registry>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |registry| {
        let f = f.clone();
        Box::pin(async move { f(registry).await })
    })
}

type RouterFactoryFn = Arc<dyn Fn() -> axum::Router + Send + Sync>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("service '{0}' is not registered")]
    NotFound(String),
    #[error("service type '{0}' is not registered")]
    TypeNotFound(String),
    #[error("middleware '{0}' is not registered")]
    MiddlewareNotFound(String),
    #[error("router '{0}' is not registered")]
    RouterNotFound(String),
    #[error("convention '{0}' is not registered")]
    ConventionNotFound(String),
    #[error("circular dependency detected: {}", chain.join(" -> "))]
    Cycle { chain: Vec<String> },
    #[error("service type '{0}' is already registered")]
    DuplicateType(String),
    #[error("service '{0}' is already registered")]
    DuplicateService(String),
    #[error("middleware '{0}' is already registered")]
    DuplicateMiddleware(String),
    #[error("router '{0}' is already registered")]
    DuplicateRouter(String),
    #[error("convention '{0}' is already registered")]
    DuplicateConvention(String),
    #[error("registry is sealed; registration is only allowed during bootstrap")]
    Sealed,
    #[error("service '{name}' failed to initialize")]
    Init {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("middleware '{name}' failed to build")]
    MiddlewareBuild {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("service '{0}' is placed remotely but its type has no remote factory")]
    NoRemoteFactory(String),
    #[error("service '{name}' has a typed instance of a different concrete type")]
    TypeMismatch { name: String },
    #[error("service '{0}' exposes no operations to mount")]
    NoOperations(String),
    #[error("operation '{op}' uses an unsupported HTTP method '{method}'")]
    UnsupportedMethod { op: String, method: http::Method },
}

pub struct Registry {
    types: RwLock<HashMap<String, Arc<ServiceTypeDescriptor>>>,
    lazy: RwLock<HashMap<String, Arc<LazyServiceEntry>>>,
    slots: RwLock<HashMap<String, Arc<OnceCell<ServiceInstance>>>>,
    resolved_order: Mutex<Vec<String>>,

    middleware_factories: RwLock<HashMap<String, MiddlewareFactory>>,
    middleware_defs: RwLock<HashMap<String, MiddlewareDefinition>>,
    middleware_cache: RwLock<HashMap<String, MiddlewareFn>>,

    routers: RwLock<HashMap<String, axum::Router>>,
    router_factories: RwLock<HashMap<String, RouterFactoryFn>>,

    conventions: RwLock<HashMap<String, Arc<dyn Convention>>>,
    init_hooks: RwLock<HashMap<String, ServerInitHook>>,
    placement: RwLock<HashMap<String, Placement>>,

    sealed: AtomicBool,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("types", &self.types.read().len())
            .field("lazy", &self.lazy.read().len())
            .field("resolved", &self.resolved_order.lock().len())
            .field("sealed", &self.sealed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        let registry = Self {
            types: RwLock::new(HashMap::new()),
            lazy: RwLock::new(HashMap::new()),
            slots: RwLock::new(HashMap::new()),
            resolved_order: Mutex::new(Vec::new()),
            middleware_factories: RwLock::new(HashMap::new()),
            middleware_defs: RwLock::new(HashMap::new()),
            middleware_cache: RwLock::new(HashMap::new()),
            routers: RwLock::new(HashMap::new()),
            router_factories: RwLock::new(HashMap::new()),
            conventions: RwLock::new(HashMap::new()),
            init_hooks: RwLock::new(HashMap::new()),
            placement: RwLock::new(HashMap::new()),
            sealed: AtomicBool::new(false),
        };
        registry
            .conventions
            .write()
            .insert("rest".to_string(), Arc::new(RestConvention));
        registry
            .middleware_factories
            .write()
            .insert(
                "request-logger".to_string(),
                crate::middleware::request_logger_factory(),
            );
        registry
    }

    /// Flip the registry into the running phase. Registration calls made
    /// after this point fail with [`RegistryError::Sealed`].
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<(), RegistryError> {
        if self.is_sealed() {
            return Err(RegistryError::Sealed);
        }
        Ok(())
    }

    /* ------------------------- registration ------------------------- */

    pub fn register_service_type(
        &self,
        name: impl Into<String>,
        local: ServiceFactory,
        remote: Option<RemoteFactory>,
        options: ServiceTypeOptions,
    ) -> Result<(), RegistryError> {
        self.check_open()?;
        let name = name.into();
        let mut types = self.types.write();
        if types.contains_key(&name) && !options.allow_override {
            return Err(RegistryError::DuplicateType(name));
        }
        let descriptor = ServiceTypeDescriptor {
            name: name.clone(),
            local,
            remote,
            operations: options.operations,
            router: options.router,
        };
        types.insert(name, Arc::new(descriptor));
        Ok(())
    }

    /// Store a lazy entry. A `depends-on` key inside `config` is stripped
    /// and merged into the dependency list.
    pub fn register_lazy_service(
        &self,
        name: impl Into<String>,
        source: ServiceSource,
        mut config: Value,
        depends_on: Vec<String>,
        middleware: Vec<String>,
    ) -> Result<(), RegistryError> {
        self.check_open()?;
        let name = name.into();
        let mut lazy = self.lazy.write();
        if lazy.contains_key(&name) {
            return Err(RegistryError::DuplicateService(name));
        }
        let mut deps = depends_on;
        for extra in take_depends_on(&mut config) {
            if !deps.contains(&extra) {
                deps.push(extra);
            }
        }
        let entry = LazyServiceEntry {
            name: name.clone(),
            source,
            config,
            depends_on: deps,
            middleware,
        };
        lazy.insert(name, Arc::new(entry));
        Ok(())
    }

    pub fn register_middleware_factory(
        &self,
        name: impl Into<String>,
        factory: MiddlewareFactory,
    ) -> Result<(), RegistryError> {
        self.check_open()?;
        let name = name.into();
        let mut factories = self.middleware_factories.write();
        if factories.contains_key(&name) {
            return Err(RegistryError::DuplicateMiddleware(name));
        }
        factories.insert(name, factory);
        Ok(())
    }

    /// Register a named middleware instantiation (factory type + config),
    /// typically produced by normalization of `middleware-definitions`.
    pub fn register_middleware_def(
        &self,
        name: impl Into<String>,
        def: MiddlewareDefinition,
    ) -> Result<(), RegistryError> {
        self.check_open()?;
        let name = name.into();
        let mut defs = self.middleware_defs.write();
        if defs.contains_key(&name) {
            return Err(RegistryError::DuplicateMiddleware(name));
        }
        defs.insert(name, def);
        Ok(())
    }

    pub fn register_router(
        &self,
        name: impl Into<String>,
        router: axum::Router,
    ) -> Result<(), RegistryError> {
        self.check_open()?;
        let name = name.into();
        let mut routers = self.routers.write();
        if routers.contains_key(&name) {
            return Err(RegistryError::DuplicateRouter(name));
        }
        routers.insert(name, router);
        Ok(())
    }

    pub fn register_router_factory<F>(
        &self,
        name: impl Into<String>,
        factory: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn() -> axum::Router + Send + Sync + 'static,
    {
        self.check_open()?;
        let name = name.into();
        let mut factories = self.router_factories.write();
        if factories.contains_key(&name) || self.routers.read().contains_key(&name) {
            return Err(RegistryError::DuplicateRouter(name));
        }
        factories.insert(name, Arc::new(factory));
        Ok(())
    }

    pub fn register_convention(
        &self,
        name: impl Into<String>,
        convention: Arc<dyn Convention>,
    ) -> Result<(), RegistryError> {
        self.check_open()?;
        let name = name.into();
        let mut conventions = self.conventions.write();
        if conventions.contains_key(&name) {
            return Err(RegistryError::DuplicateConvention(name));
        }
        conventions.insert(name, convention);
        Ok(())
    }

    pub fn register_server_init_hook(
        &self,
        name: impl Into<String>,
        hook: ServerInitHook,
    ) -> Result<(), RegistryError> {
        self.check_open()?;
        self.init_hooks.write().insert(name.into(), hook);
        Ok(())
    }

    pub fn set_placement(&self, placement: HashMap<String, Placement>) {
        *self.placement.write() = placement;
    }

    /* --------------------------- lookups ---------------------------- */

    pub fn has_lazy_service(&self, name: &str) -> bool {
        self.lazy.read().contains_key(name)
    }

    pub fn get_service_metadata(&self, type_name: &str) -> Option<Arc<ServiceTypeDescriptor>> {
        self.types.read().get(type_name).cloned()
    }

    pub fn get_service_factory(&self, type_name: &str) -> Option<ServiceFactory> {
        self.types.read().get(type_name).map(|d| d.local.clone())
    }

    pub fn get_remote_factory(&self, type_name: &str) -> Option<RemoteFactory> {
        self.types
            .read()
            .get(type_name)
            .and_then(|d| d.remote.clone())
    }

    pub fn lazy_entry(&self, name: &str) -> Option<Arc<LazyServiceEntry>> {
        self.lazy.read().get(name).cloned()
    }

    pub fn placement_of(&self, name: &str) -> Option<Placement> {
        self.placement.read().get(name).cloned()
    }

    pub fn convention(&self, name: &str) -> Result<Arc<dyn Convention>, RegistryError> {
        self.conventions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::ConventionNotFound(name.to_string()))
    }

    pub fn server_init_hook(&self, name: &str) -> Option<ServerInitHook> {
        self.init_hooks.read().get(name).cloned()
    }

    /// Resolve a middleware name: a named definition wins over a bare
    /// factory; instantiations are cached per name.
    pub fn middleware(&self, name: &str) -> Result<MiddlewareFn, RegistryError> {
        if let Some(cached) = self.middleware_cache.read().get(name) {
            return Ok(cached.clone());
        }
        let def = self.middleware_defs.read().get(name).cloned();
        let built = if let Some(def) = def {
            let factory = self
                .middleware_factories
                .read()
                .get(&def.kind)
                .cloned()
                .ok_or_else(|| RegistryError::MiddlewareNotFound(def.kind.clone()))?;
            factory
                .build(&def.config)
                .map_err(|source| RegistryError::MiddlewareBuild {
                    name: name.to_string(),
                    source,
                })?
        } else {
            let factory = self
                .middleware_factories
                .read()
                .get(name)
                .cloned()
                .ok_or_else(|| RegistryError::MiddlewareNotFound(name.to_string()))?;
            factory
                .build(&Value::Null)
                .map_err(|source| RegistryError::MiddlewareBuild {
                    name: name.to_string(),
                    source,
                })?
        };
        self.middleware_cache
            .write()
            .insert(name.to_string(), built.clone());
        Ok(built)
    }

    /// Look up a named router, or build one from a router factory.
    pub fn router(&self, name: &str) -> Result<axum::Router, RegistryError> {
        if let Some(router) = self.routers.read().get(name) {
            return Ok(router.clone());
        }
        if let Some(factory) = self.router_factories.read().get(name) {
            return Ok(factory());
        }
        Err(RegistryError::RouterNotFound(name.to_string()))
    }

    /* -------------------------- resolution -------------------------- */

    pub async fn get_service(&self, name: &str) -> Result<ServiceInstance, RegistryError> {
        self.resolve(name.to_string(), Vec::new()).await
    }

    /// Resolve and panic on failure. Intended for bootstrap code and tests
    /// where a missing service is unrecoverable.
    pub async fn must_get_service(&self, name: &str) -> ServiceInstance {
        match self.get_service(name).await {
            Ok(instance) => instance,
            Err(err) => panic!("{err}"),
        }
    }

    pub async fn get_typed<T: Service>(&self, name: &str) -> Result<Arc<T>, RegistryError> {
        let instance = self.get_service(name).await?;
        downcast::<T>(&instance).ok_or_else(|| RegistryError::TypeMismatch {
            name: name.to_string(),
        })
    }

    fn resolve(
        &self,
        name: String,
        stack: Vec<String>,
    ) -> BoxFuture<'_, Result<ServiceInstance, RegistryError>> {
        Box::pin(async move {
            if let Some(slot) = self.slots.read().get(&name) {
                if let Some(instance) = slot.get() {
                    return Ok(instance.clone());
                }
            }

            if stack.contains(&name) {
                let mut chain = stack;
                chain.push(name);
                return Err(RegistryError::Cycle { chain });
            }

            let entry = self
                .lazy
                .read()
                .get(&name)
                .cloned()
                .ok_or_else(|| RegistryError::NotFound(name.clone()))?;

            // Dependencies resolve outside the single-flight cell so the
            // cycle stack stays accurate across the whole chain. A service
            // placed remotely gets no local dependencies: its dependency
            // graph lives on the server that mounts it.
            let is_remote = matches!(
                self.placement_of(&name),
                Some(Placement::Remote { .. })
            );
            let mut child_stack = stack;
            child_stack.push(name.clone());
            let mut deps = Dependencies::default();
            if !is_remote {
                for dep in &entry.depends_on {
                    let instance = self.resolve(dep.clone(), child_stack.clone()).await?;
                    deps.insert(dep.clone(), instance);
                }
            }

            let slot = self.slot_for(&name);
            let instance = slot
                .get_or_try_init(|| async {
                    tracing::debug!(service = %name, deps = entry.depends_on.len(), "resolving service");
                    let instance = self.instantiate(&entry, deps).await?;
                    self.resolved_order.lock().push(name.clone());
                    Ok::<_, RegistryError>(instance)
                })
                .await?;
            Ok(instance.clone())
        })
    }

    fn slot_for(&self, name: &str) -> Arc<OnceCell<ServiceInstance>> {
        if let Some(slot) = self.slots.read().get(name) {
            return slot.clone();
        }
        self.slots
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Run the factory for an entry, choosing local or remote per the
    /// placement computed during normalization.
    async fn instantiate(
        &self,
        entry: &LazyServiceEntry,
        deps: Dependencies,
    ) -> Result<ServiceInstance, RegistryError> {
        let wrap = |source: anyhow::Error| RegistryError::Init {
            name: entry.name.clone(),
            source,
        };
        match &entry.source {
            ServiceSource::Inline(factory) => factory
                .call(deps, entry.config.clone())
                .await
                .map_err(wrap),
            ServiceSource::Type(type_name) => {
                let descriptor = self
                    .get_service_metadata(type_name)
                    .ok_or_else(|| RegistryError::TypeNotFound(type_name.clone()))?;
                match self.placement_of(&entry.name) {
                    Some(Placement::Remote { server, base_url }) => {
                        let remote = descriptor
                            .remote
                            .clone()
                            .ok_or_else(|| RegistryError::NoRemoteFactory(entry.name.clone()))?;
                        let target = self.remote_target(&descriptor, server, base_url)?;
                        tracing::debug!(
                            service = %entry.name,
                            target = %target.base_url,
                            "building remote proxy"
                        );
                        remote.call(target, entry.config.clone()).await.map_err(wrap)
                    }
                    _ => descriptor
                        .local
                        .call(deps, entry.config.clone())
                        .await
                        .map_err(wrap),
                }
            }
        }
    }

    /// Compute the client-side route map from the same convention the
    /// server side mounts with.
    pub fn remote_target(
        &self,
        descriptor: &ServiceTypeDescriptor,
        server: String,
        base_url: String,
    ) -> Result<RemoteTarget, RegistryError> {
        let convention_name = descriptor.router.convention.as_deref().unwrap_or("rest");
        let convention = self.convention(convention_name)?;
        let routes = convention.routes(
            &descriptor.operations,
            &descriptor.router.convention_options(),
        );
        Ok(RemoteTarget {
            server,
            base_url,
            path_prefix: descriptor.router.path_prefix.clone(),
            routes,
        })
    }

    /* --------------------------- teardown --------------------------- */

    /// Remove a lazy entry and any cached instance.
    pub fn unregister_service(&self, name: &str) {
        self.lazy.write().remove(name);
        self.slots.write().remove(name);
        self.resolved_order.lock().retain(|n| n != name);
    }

    /// Names of resolved services, in resolution order.
    pub fn resolved_names(&self) -> Vec<String> {
        self.resolved_order.lock().clone()
    }

    /// Invoke every resolved service's shutdown hook, reverse resolution
    /// order, each exactly once. Errors are logged, not propagated.
    pub async fn shutdown_all(&self) {
        let order = {
            let mut order = self.resolved_order.lock();
            std::mem::take(&mut *order)
        };
        for name in order.into_iter().rev() {
            let instance = self
                .slots
                .read()
                .get(&name)
                .and_then(|slot| slot.get().cloned());
            if let Some(instance) = instance {
                tracing::debug!(service = %name, "running shutdown hook");
                if let Err(err) = instance.shutdown().await {
                    tracing::warn!(service = %name, error = %err, "service shutdown failed");
                }
            }
        }
    }
}
