//! # Flotilla - declarative multi-server service runtime
//!
//! Flotilla binds YAML deployment descriptions to code-registered service
//! factories, exposes services over HTTP under pluggable routing
//! conventions, and generates matching remote clients for services mounted
//! on other servers.
//!
//! ## Building blocks
//!
//! - **Registry**: lazy, memoized service resolution with cycle detection
//!   and local/remote factory selection driven by deployment topology.
//! - **Normalizer**: flattens global / deployment / server inline
//!   definitions into one unique namespace per running server.
//! - **Conventions**: pure functions from an operation set to a route map;
//!   `"rest"` ships built in.
//! - **Router generation**: mounts a service's operations on axum routes
//!   and builds URL-symmetric remote clients.
//! - **Runtime**: listener binding, graceful drain, reverse-order service
//!   shutdown.
//!
//! ## Example
//!
//! ```rust,ignore
//! let registry = Arc::new(Registry::new());
//! registry.register_service_type(
//!     "user-service",
//!     ServiceFactory::with_deps(|deps, cfg| UserService::build(deps, cfg)),
//!     None,
//!     ServiceTypeOptions::default()
//!         .prefix("/api/v1")
//!         .resource("user", "users"),
//! )?;
//!
//! flotilla::runtime::run(RunOptions {
//!     config,
//!     registry,
//!     server: "first".into(),
//!     shutdown: ShutdownOptions::Signals,
//! })
//! .await
//! ```

pub use anyhow::Result;
pub use async_trait::async_trait;

pub mod convention;
pub mod deploy;
pub mod errors;
pub mod middleware;
pub mod registry;
pub mod remote;
pub mod router;
pub mod runtime;
pub mod service;
pub mod value;

pub use convention::{Convention, ConventionOptions, RestConvention, RouteMeta};
pub use deploy::{DeployError, DeploymentConfig, NormalizedServer, Placement};
pub use errors::{Envelope, ServiceError};
pub use middleware::{MiddlewareFactory, MiddlewareFn};
pub use registry::{
    Registry, RegistryError, RouterSpec, ServiceSource, ServiceTypeDescriptor, ServiceTypeOptions,
};
pub use remote::RemoteClient;
pub use router::{mount_service, Operation, OperationHandler, OperationRequest};
pub use runtime::{run, RunOptions, ShutdownOptions};
pub use service::{
    downcast, Dependencies, RemoteFactory, RemoteTarget, Service, ServiceFactory, ServiceInstance,
};
pub use value::ValueExt;
