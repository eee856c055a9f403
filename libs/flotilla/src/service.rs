//! Service contract and factory shapes.
//!
//! A service is any `Send + Sync` object held behind an [`Arc`]. The registry
//! stores instances as `Arc<dyn Service>`; typed access goes through
//! `as_any` / `into_any` downcasts. Factories come in three admissible
//! shapes (no arguments, config only, dependencies + config) and are
//! normalized to the canonical two-argument form at construction.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::convention::RouteMeta;
use crate::router::Operation;

/// Shared, non-owning handle to a resolved service instance.
pub type ServiceInstance = Arc<dyn Service>;

/// Core service trait.
///
/// `operations` is empty by default; services that want convention-based
/// HTTP exposure override it. `shutdown` is invoked once, in reverse
/// resolution order, when the lifecycle runner stops.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;

    /// Upcast for `Arc` downcasting; implementations return `self`.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Operation set exposed to the router generator.
    fn operations(&self) -> Vec<Operation> {
        Vec::new()
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl fmt::Debug for dyn Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("dyn Service").finish_non_exhaustive()
    }
}

/// Downcast a shared instance to a concrete service type.
pub fn downcast<T: Service>(instance: &ServiceInstance) -> Option<Arc<T>> {
    Arc::clone(instance).into_any().downcast::<T>().ok()
}

/// Resolved dependencies handed to a factory, keyed by the name used in
/// `depends-on`. Lookup falls back to a unique suffix match so factories
/// written against short names keep working after scope normalization
/// rewrites `cache` into `development.dev-server.cache`.
#[derive(Default, Clone)]
pub struct Dependencies {
    entries: BTreeMap<String, ServiceInstance>,
}

impl Dependencies {
    pub fn insert(&mut self, name: impl Into<String>, instance: ServiceInstance) {
        self.entries.insert(name.into(), instance);
    }

    pub fn get(&self, name: &str) -> Option<ServiceInstance> {
        if let Some(found) = self.entries.get(name) {
            return Some(found.clone());
        }
        let suffix = format!(".{name}");
        let mut matches = self
            .entries
            .iter()
            .filter(|(key, _)| key.ends_with(&suffix));
        match (matches.next(), matches.next()) {
            (Some((_, instance)), None) => Some(instance.clone()),
            _ => None,
        }
    }

    pub fn get_typed<T: Service>(&self, name: &str) -> anyhow::Result<Arc<T>> {
        let instance = self
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("dependency '{name}' was not resolved"))?;
        downcast::<T>(&instance)
            .ok_or_else(|| anyhow::anyhow!("dependency '{name}' has an unexpected type"))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

type FactoryFuture = BoxFuture<'static, anyhow::Result<ServiceInstance>>;
type FactoryFn = dyn Fn(Dependencies, Value) -> FactoryFuture + Send + Sync;

/// A local service factory, normalized to `(deps, config) -> future`.
#[derive(Clone)]
pub struct ServiceFactory {
    f: Arc<FactoryFn>,
}

impl ServiceFactory {
    /// Zero-argument factory.
    pub fn new<S, F>(f: F) -> Self
    where
        S: Service,
        F: Fn() -> anyhow::Result<S> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self {
            f: Arc::new(move |_, _| {
                let f = f.clone();
                Box::pin(async move { f().map(|s| Arc::new(s) as ServiceInstance) })
            }),
        }
    }

    /// Config-only factory.
    pub fn with_config<S, F>(f: F) -> Self
    where
        S: Service,
        F: Fn(Value) -> anyhow::Result<S> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self {
            f: Arc::new(move |_, cfg| {
                let f = f.clone();
                Box::pin(async move { f(cfg).map(|s| Arc::new(s) as ServiceInstance) })
            }),
        }
    }

    /// Canonical two-argument factory.
    pub fn with_deps<S, F>(f: F) -> Self
    where
        S: Service,
        F: Fn(Dependencies, Value) -> anyhow::Result<S> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self {
            f: Arc::new(move |deps, cfg| {
                let f = f.clone();
                Box::pin(async move { f(deps, cfg).map(|s| Arc::new(s) as ServiceInstance) })
            }),
        }
    }

    /// Async two-argument factory, for services that do I/O on construction.
    pub fn with_deps_async<S, F, Fut>(f: F) -> Self
    where
        S: Service,
        F: Fn(Dependencies, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<S>> + Send + 'static,
    {
        let f = Arc::new(f);
        Self {
            f: Arc::new(move |deps, cfg| {
                let f = f.clone();
                Box::pin(async move { f(deps, cfg).await.map(|s| Arc::new(s) as ServiceInstance) })
            }),
        }
    }

    /// Async factory that already produces a shared instance.
    pub fn with_deps_async_arc<F, Fut>(f: F) -> Self
    where
        F: Fn(Dependencies, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ServiceInstance>> + Send + 'static,
    {
        let f = Arc::new(f);
        Self {
            f: Arc::new(move |deps, cfg| {
                let f = f.clone();
                Box::pin(async move { f(deps, cfg).await })
            }),
        }
    }

    pub(crate) fn call(&self, deps: Dependencies, config: Value) -> FactoryFuture {
        (self.f)(deps, config)
    }
}

impl std::fmt::Debug for ServiceFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ServiceFactory")
    }
}

/// Everything a remote factory needs to reach a service mounted on another
/// server: the target's base URL plus the convention output computed from
/// the *same* descriptor the server side mounts with, which keeps client
/// and server URLs symmetric.
#[derive(Debug, Clone)]
pub struct RemoteTarget {
    pub server: String,
    pub base_url: String,
    pub path_prefix: String,
    pub routes: BTreeMap<String, RouteMeta>,
}

type RemoteFactoryFn = dyn Fn(RemoteTarget, Value) -> FactoryFuture + Send + Sync;

/// Factory for the client-side proxy of a service type.
#[derive(Clone)]
pub struct RemoteFactory {
    f: Arc<RemoteFactoryFn>,
}

impl RemoteFactory {
    pub fn new<S, F>(f: F) -> Self
    where
        S: Service,
        F: Fn(RemoteTarget, Value) -> anyhow::Result<S> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self {
            f: Arc::new(move |target, cfg| {
                let f = f.clone();
                Box::pin(async move { f(target, cfg).map(|s| Arc::new(s) as ServiceInstance) })
            }),
        }
    }

    pub(crate) fn call(&self, target: RemoteTarget, config: Value) -> FactoryFuture {
        (self.f)(target, config)
    }
}

impl std::fmt::Debug for RemoteFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RemoteFactory")
    }
}
