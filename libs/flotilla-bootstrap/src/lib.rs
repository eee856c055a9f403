//! Bootstrap utilities for flotilla applications: configuration loading
//! with merge + environment substitution, and logging initialization.

pub mod config;
pub mod logging;

pub use config::{
    load_config, load_config_files, AppConfig, ConfigError, DatabaseServerConfig, LogSection,
    LoggingConfig,
};
pub use logging::init_logging;
