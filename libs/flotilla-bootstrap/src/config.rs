//! Configuration loading: YAML file/list/directory merge, environment
//! substitution, and the typed application config.
//!
//! Merge semantics are deep for mappings (override wins at leaves) and
//! replace for lists. `${VAR}` / `${VAR:default}` substitution runs over
//! every string scalar after merging; a missing variable with no default
//! is fatal.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;
use thiserror::Error;

use flotilla::deploy::DeploymentConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("config tree does not match the expected shape")]
    Shape(#[source] serde_yaml::Error),
    #[error("environment variable '{0}' is not set and has no default")]
    MissingEnvVar(String),
    #[error("config path {0} is neither a file nor a directory")]
    NotFound(PathBuf),
    #[error("no .yaml/.yml files found in directory {0}")]
    EmptyDirectory(PathBuf),
}

/// Top-level application config: the deployment tree plus ambient
/// sections for logging and database pools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: Option<LoggingConfig>,
    /// Named pools for the sync-config store, keyed by pool name.
    pub database: HashMap<String, DatabaseServerConfig>,
    #[serde(flatten)]
    pub deployment: DeploymentConfig,
}

/// Logging sections keyed by subsystem name; `"default"` is the catch-all.
pub type LoggingConfig = HashMap<String, LogSection>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_level")]
    pub console_level: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub file_level: String,
    #[serde(default)]
    pub max_backups: Option<usize>,
    #[serde(default)]
    pub max_size_mb: Option<u64>,
}

fn default_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseServerConfig {
    pub dsn: String,
    #[serde(default)]
    pub max_conns: Option<u32>,
}

/// Load from a single file or a directory of `.yaml`/`.yml` files merged
/// in lexicographic order.
pub fn load_config(path: impl AsRef<Path>) -> Result<AppConfig, ConfigError> {
    let path = path.as_ref();
    if path.is_file() {
        return load_config_files(&[path.to_path_buf()]);
    }
    if path.is_dir() {
        let mut files: Vec<PathBuf> = std::fs::read_dir(path)
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.is_file()
                    && matches!(
                        p.extension().and_then(|e| e.to_str()),
                        Some("yaml") | Some("yml")
                    )
            })
            .collect();
        if files.is_empty() {
            return Err(ConfigError::EmptyDirectory(path.to_path_buf()));
        }
        files.sort();
        return load_config_files(&files);
    }
    Err(ConfigError::NotFound(path.to_path_buf()))
}

/// Load and merge an explicit list of files, in order.
pub fn load_config_files(paths: &[PathBuf]) -> Result<AppConfig, ConfigError> {
    let mut merged = YamlValue::Null;
    for path in paths {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let tree: YamlValue = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        merged = merge_values(merged, tree);
        tracing::debug!(path = %path.display(), "merged config file");
    }

    let substituted = substitute_env(merged)?;
    serde_yaml::from_value(substituted).map_err(ConfigError::Shape)
}

/// Deep merge: mappings merge recursively with the overlay winning at
/// leaves; lists and scalars are replaced wholesale.
pub fn merge_values(base: YamlValue, overlay: YamlValue) -> YamlValue {
    match (base, overlay) {
        (YamlValue::Mapping(mut base_map), YamlValue::Mapping(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                let merged = match base_map.remove(&key) {
                    Some(base_value) => merge_values(base_value, overlay_value),
                    None => overlay_value,
                };
                base_map.insert(key, merged);
            }
            YamlValue::Mapping(base_map)
        }
        (base, YamlValue::Null) => base,
        (_, overlay) => overlay,
    }
}

fn env_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::([^}]*))?\}").expect("static pattern")
    })
}

/// Substitute `${VAR}` / `${VAR:default}` in every string scalar.
pub fn substitute_env(value: YamlValue) -> Result<YamlValue, ConfigError> {
    match value {
        YamlValue::String(s) => Ok(YamlValue::String(substitute_str(&s)?)),
        YamlValue::Sequence(items) => Ok(YamlValue::Sequence(
            items
                .into_iter()
                .map(substitute_env)
                .collect::<Result<_, _>>()?,
        )),
        YamlValue::Mapping(map) => {
            let mut out = serde_yaml::Mapping::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key, substitute_env(item)?);
            }
            Ok(YamlValue::Mapping(out))
        }
        other => Ok(other),
    }
}

fn substitute_str(input: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in env_pattern().captures_iter(input) {
        let whole = caps.get(0).expect("capture 0 always present");
        let name = &caps[1];
        out.push_str(&input[last..whole.start()]);
        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => match caps.get(2) {
                Some(default) => out.push_str(default.as_str()),
                None => return Err(ConfigError::MissingEnvVar(name.to_string())),
            },
        }
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn merge_is_deep_for_maps_and_replace_for_lists() {
        let base: YamlValue = serde_yaml::from_str(
            r#"
a:
  x: 1
  y: [1, 2, 3]
b: keep
"#,
        )
        .unwrap();
        let overlay: YamlValue = serde_yaml::from_str(
            r#"
a:
  y: [9]
  z: new
"#,
        )
        .unwrap();
        let merged = merge_values(base, overlay);
        let expected: YamlValue = serde_yaml::from_str(
            r#"
a:
  x: 1
  y: [9]
  z: new
b: keep
"#,
        )
        .unwrap();
        assert_eq!(merged, expected);
    }

    #[test]
    fn env_substitution_with_defaults() {
        std::env::set_var("FLOTILLA_TEST_HOST", "db.internal");
        let value: YamlValue = serde_yaml::from_str(
            r#"
dsn: "postgres://${FLOTILLA_TEST_HOST}:${FLOTILLA_TEST_PORT:5432}/app"
plain: "no vars here"
"#,
        )
        .unwrap();
        let out = substitute_env(value).unwrap();
        let map = out.as_mapping().unwrap();
        assert_eq!(
            map[&YamlValue::from("dsn")],
            YamlValue::from("postgres://db.internal:5432/app")
        );
        assert_eq!(map[&YamlValue::from("plain")], YamlValue::from("no vars here"));
        std::env::remove_var("FLOTILLA_TEST_HOST");
    }

    #[test]
    fn missing_env_var_without_default_is_fatal() {
        let value: YamlValue =
            serde_yaml::from_str(r#"dsn: "${FLOTILLA_TEST_DEFINITELY_UNSET}""#).unwrap();
        match substitute_env(value).unwrap_err() {
            ConfigError::MissingEnvVar(name) => {
                assert_eq!(name, "FLOTILLA_TEST_DEFINITELY_UNSET")
            }
            other => panic!("expected missing env var, got {other:?}"),
        }
    }

    #[test]
    fn directory_merge_is_lexicographic() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("10-base.yaml"),
            r#"
deployments:
  dev:
    servers:
      main:
        base-url: "http://base"
        listeners: []
"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("20-override.yml"),
            r#"
deployments:
  dev:
    servers:
      main:
        base-url: "http://override"
"#,
        )
        .unwrap();
        fs::write(dir.path().join("ignored.txt"), "not yaml").unwrap();

        let config = load_config(dir.path()).unwrap();
        let server = config.deployment.server("dev", "main").unwrap();
        assert_eq!(server.base_url, "http://override");
        // lists replaced, not appended
        assert!(server.listeners.is_empty());
    }

    #[test]
    fn full_tree_parses_with_ambient_sections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.yaml");
        fs::write(
            &path,
            r#"
logging:
  default:
    console_level: debug
    file: "logs/app.log"

database:
  default:
    dsn: "postgres://localhost/app"
    max_conns: 10

middleware-definitions:
  api-logger:
    type: request-logger
    config: { tag: "api" }

service-definitions:
  user-service:
    type: user-service
    config: { greeting: "hi" }
    depends-on: ["cache"]

deployments:
  dev:
    servers:
      main:
        base-url: "http://localhost:8080"
        shutdown-timeout: 10s
        listeners:
          - addr: "127.0.0.1:8080"
            services: ["user-service"]
            routers: ["admin"]
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(
            config.logging.as_ref().unwrap()["default"].console_level,
            "debug"
        );
        assert_eq!(config.database["default"].dsn, "postgres://localhost/app");
        let def = &config.deployment.service_definitions["user-service"];
        assert_eq!(def.kind, "user-service");
        assert_eq!(def.depends_on, vec!["cache"]);
        let mw = &config.deployment.middleware_definitions["api-logger"];
        assert_eq!(mw.kind, "request-logger");
    }

    #[test]
    fn missing_path_reports_not_found() {
        assert!(matches!(
            load_config("/definitely/not/here.yaml"),
            Err(ConfigError::NotFound(_))
        ));
    }
}
