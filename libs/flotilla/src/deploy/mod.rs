//! Deployment tree model and per-server normalization.

pub mod config;
pub mod normalize;

pub use config::{
    DeployError, Deployment, DeploymentConfig, ListenerConfig, MiddlewareDefinition,
    ServerConfig, ServiceDefinition,
};
pub use normalize::{normalize_server, NormalizedServer, Placement};
