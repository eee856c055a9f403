//! Logging initialization: console output filtered by the `FLOTILLA_LOG`
//! environment variable (falling back to the config's default section) and
//! optional rotating file output per section.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use file_rotate::{
    compression::Compression,
    suffix::{AppendTimestamp, FileLimit},
    ContentLimit, FileRotate,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LogSection, LoggingConfig};

const LOG_ENV_VAR: &str = "FLOTILLA_LOG";

#[derive(Clone)]
struct RotWriter(Arc<Mutex<FileRotate<AppendTimestamp>>>);

impl<'a> fmt::MakeWriter<'a> for RotWriter {
    type Writer = RotWriterHandle;
    fn make_writer(&'a self) -> Self::Writer {
        RotWriterHandle(self.0.clone())
    }
}

#[derive(Clone)]
struct RotWriterHandle(Arc<Mutex<FileRotate<AppendTimestamp>>>);

impl Write for RotWriterHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.0.lock() {
            Ok(mut rot) => rot.write(buf),
            Err(_) => Ok(buf.len()),
        }
    }
    fn flush(&mut self) -> std::io::Result<()> {
        match self.0.lock() {
            Ok(mut rot) => rot.flush(),
            Err(_) => Ok(()),
        }
    }
}

fn resolve_log_path(file: &str, base_dir: &Path) -> PathBuf {
    let path = Path::new(file);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn rotating_writer(section: &LogSection, base_dir: &Path) -> Option<RotWriter> {
    if section.file.is_empty() {
        return None;
    }
    let path = resolve_log_path(&section.file, base_dir);
    if let Some(parent) = path.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            eprintln!("cannot create log directory {}: {err}", parent.display());
            return None;
        }
    }
    let max_bytes = section.max_size_mb.unwrap_or(100) as usize * 1024 * 1024;
    let limit = FileLimit::MaxFiles(section.max_backups.unwrap_or(3));
    let rot = FileRotate::new(
        path,
        AppendTimestamp::default(limit),
        ContentLimit::Bytes(max_bytes),
        Compression::None,
        None,
    );
    Some(RotWriter(Arc::new(Mutex::new(rot))))
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()))
}

/// Initialize the global subscriber. Safe to call once per process;
/// repeated calls (tests) are no-ops.
pub fn init_logging(config: Option<&LoggingConfig>, base_dir: &Path) {
    let empty = HashMap::new();
    let config = config.unwrap_or(&empty);

    let default_section = config.get("default");
    let console_level = default_section
        .map(|s| s.console_level.as_str())
        .unwrap_or("info");

    let console_layer = fmt::layer()
        .with_target(true)
        .with_filter(env_filter(console_level));

    let file_layer = default_section
        .and_then(|section| {
            rotating_writer(section, base_dir).map(|writer| {
                let level = if section.file_level.is_empty() {
                    section.console_level.clone()
                } else {
                    section.file_level.clone()
                };
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer)
                    .with_filter(EnvFilter::new(level))
            })
        });

    let result = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init();
    if result.is_err() {
        tracing::debug!("logging already initialized");
    }
}
