//! Multi-instance configuration store backed by a single PostgreSQL table.
//!
//! Change propagation rides LISTEN/NOTIFY: a table trigger emits a payload
//! for every insert/update/delete, each instance applies incoming payloads
//! to its in-memory cache, and a periodic heartbeat broadcasts the cache
//! CRC so instances that missed notifications can detect drift and
//! reconcile with a full reload.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use sqlx::postgres::{PgListener, PgPool};
use sqlx::Row;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use flotilla::registry::{Registry, RegistryError, ServiceTypeOptions};
use flotilla::service::{Service, ServiceFactory, ServiceInstance};
use flotilla::ServiceError;

pub mod config;
pub mod store;

pub use config::SyncConfigSettings;
pub use store::{ChangeEvent, Notification};

use config::valid_ident;
use store::ConfigCache;

/// The registered service type name.
pub const SERVICE_TYPE: &str = "sync-config";

/// The single pool slice this store consumes from its host application.
#[async_trait]
pub trait PoolProvider: Send + Sync {
    async fn named_pool(&self, name: &str) -> anyhow::Result<PgPool>;
}

type SubscriberFn = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

pub struct SyncConfig {
    pool: PgPool,
    settings: SyncConfigSettings,
    cache: RwLock<ConfigCache>,
    subscribers: DashMap<u64, mpsc::UnboundedSender<ChangeEvent>>,
    next_subscriber: AtomicU64,
    /// Completed-sync counter; lets concurrent `sync()` calls collapse.
    sync_done: AtomicU64,
    sync_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl SyncConfig {
    /// Open the table (creating schema and trigger idempotently), load all
    /// rows, and start the listener and heartbeat workers unless
    /// notifications are disabled.
    pub async fn connect(pool: PgPool, settings: SyncConfigSettings) -> anyhow::Result<Arc<Self>> {
        if !valid_ident(&settings.table) {
            anyhow::bail!("invalid sync-config table name '{}'", settings.table);
        }
        if !valid_ident(&settings.channel) {
            anyhow::bail!("invalid sync-config channel name '{}'", settings.channel);
        }

        ensure_schema(&pool, &settings).await?;
        let entries = load_all(&pool, &settings.table).await?;
        tracing::info!(
            table = %settings.table,
            channel = %settings.channel,
            keys = entries.len(),
            notifications = settings.notifications,
            "sync-config store opened"
        );

        let service = Arc::new(Self {
            pool,
            settings,
            cache: RwLock::new(ConfigCache::from_entries(entries)),
            subscribers: DashMap::new(),
            next_subscriber: AtomicU64::new(1),
            sync_done: AtomicU64::new(0),
            sync_lock: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
        });

        if service.settings.notifications {
            tokio::spawn(listener_task(service.clone()));
            tokio::spawn(heartbeat_task(service.clone()));
        }

        Ok(service)
    }

    /* --------------------------- mutations -------------------------- */

    /// Upsert a key. The table trigger notifies every instance, including
    /// this one; the local cache is updated eagerly and the echoed
    /// notification becomes a no-op.
    pub async fn set(&self, key: &str, value: Value) -> anyhow::Result<()> {
        let sql = format!(
            "INSERT INTO {t} (key, value, updated_at) VALUES ($1, $2, NOW()) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()",
            t = self.settings.table
        );
        sqlx::query(&sql)
            .bind(key)
            .bind(&value)
            .execute(&self.pool)
            .await
            .with_context(|| format!("sync-config set '{key}' failed"))?;
        self.apply_set(key, value);
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let sql = format!("DELETE FROM {t} WHERE key = $1", t = self.settings.table);
        sqlx::query(&sql)
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("sync-config delete '{key}' failed"))?;
        self.apply_delete(key);
        Ok(())
    }

    /// Force a full reload. Concurrent invocations collapse to one
    /// execution whose result every caller observes.
    pub async fn sync(&self) -> anyhow::Result<()> {
        let observed = self.sync_done.load(Ordering::SeqCst);
        let _guard = self.sync_lock.lock().await;
        if self.sync_done.load(Ordering::SeqCst) != observed {
            // another caller completed a sync while we waited
            return Ok(());
        }

        let fresh = load_all(&self.pool, &self.settings.table).await?;
        {
            let mut cache = self.cache.write();
            let events = cache.replace_all(fresh);
            for event in events {
                self.fan_out(event);
            }
        }
        self.sync_done.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(crc = self.crc(), "sync-config full reload complete");
        Ok(())
    }

    /* ----------------------------- reads ---------------------------- */

    pub fn get(&self, key: &str) -> Result<Value, ServiceError> {
        self.cache
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| ServiceError::KeyNotFound(key.to_string()))
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        store::string_or(self.cache.read().get(key), default)
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        store::int_or(self.cache.read().get(key), default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        store::bool_or(self.cache.read().get(key), default)
    }

    pub fn get_all(&self) -> BTreeMap<String, Value> {
        self.cache.read().snapshot()
    }

    pub fn crc(&self) -> u32 {
        self.cache.read().crc()
    }

    /* ------------------------- subscriptions ------------------------ */

    /// Register a local change subscriber. Each subscriber gets its own
    /// forwarding worker, so a slow callback never blocks the data path;
    /// events arrive in cache-apply order.
    pub fn subscribe<F>(&self, callback: F) -> u64
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::unbounded_channel::<ChangeEvent>();
        self.subscribers.insert(id, tx);
        let callback: SubscriberFn = Arc::new(callback);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => callback(event),
                        None => break,
                    },
                }
            }
        });
        id
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.remove(&id);
    }

    /* --------------------------- internals -------------------------- */

    fn apply_set(&self, key: &str, value: Value) {
        let mut cache = self.cache.write();
        if cache.apply_set(key, value.clone()) {
            self.fan_out(ChangeEvent {
                key: key.to_string(),
                value: Some(value),
            });
        }
    }

    fn apply_delete(&self, key: &str) {
        let mut cache = self.cache.write();
        if cache.apply_delete(key) {
            self.fan_out(ChangeEvent {
                key: key.to_string(),
                value: None,
            });
        }
    }

    /// Send an event to every subscriber queue. Called with the cache lock
    /// held so delivery order matches apply order.
    fn fan_out(&self, event: ChangeEvent) {
        self.subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }

}

/// Apply one channel payload to an instance's cache; a heartbeat CRC
/// mismatch schedules a background reconciliation sync.
fn apply_notification(service: &Arc<SyncConfig>, payload: &str) {
    match serde_json::from_str::<Notification>(payload) {
        Ok(Notification::Insert { key, value }) | Ok(Notification::Update { key, value }) => {
            service.apply_set(&key, value);
        }
        Ok(Notification::Delete { key }) => {
            service.apply_delete(&key);
        }
        Ok(Notification::Heartbeat { crc }) => {
            let local = service.crc();
            if crc != local {
                tracing::warn!(remote = crc, local, "sync-config checksum mismatch");
                if service.settings.sync_on_mismatch {
                    let service = service.clone();
                    tokio::spawn(async move {
                        if let Err(err) = service.sync().await {
                            tracing::error!(error = %err, "reconciliation sync failed");
                        }
                    });
                }
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, payload, "ignoring malformed notification");
        }
    }
}

#[async_trait]
impl Service for SyncConfig {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}

/// Register the `sync-config` service type against a pool provider.
pub fn register(registry: &Registry, pools: Arc<dyn PoolProvider>) -> Result<(), RegistryError> {
    let factory = ServiceFactory::with_deps_async_arc(move |_deps, config| {
        let pools = pools.clone();
        async move {
            let settings: SyncConfigSettings = if config.is_null() {
                SyncConfigSettings::default()
            } else {
                serde_json::from_value(config).context("invalid sync-config settings")?
            };
            let pool = pools.named_pool(&settings.pool).await?;
            let service = SyncConfig::connect(pool, settings).await?;
            Ok(service as ServiceInstance)
        }
    });
    registry.register_service_type(SERVICE_TYPE, factory, None, ServiceTypeOptions::default())
}

/* ------------------------- database plumbing ------------------------ */

async fn ensure_schema(pool: &PgPool, settings: &SyncConfigSettings) -> anyhow::Result<()> {
    let table = &settings.table;
    let channel = &settings.channel;

    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            key VARCHAR(255) PRIMARY KEY,
            value JSONB NOT NULL,
            updated_at TIMESTAMP NOT NULL DEFAULT NOW()
        )"
    );
    sqlx::query(&ddl)
        .execute(pool)
        .await
        .context("creating sync-config table")?;

    let index = format!(
        "CREATE INDEX IF NOT EXISTS idx_{table}_updated_at ON {table}(updated_at)"
    );
    sqlx::query(&index)
        .execute(pool)
        .await
        .context("creating sync-config index")?;

    let function = format!(
        r#"CREATE OR REPLACE FUNCTION {table}_notify() RETURNS trigger AS $$
BEGIN
    IF TG_OP = 'DELETE' THEN
        PERFORM pg_notify('{channel}',
            json_build_object('action', 'delete', 'key', OLD.key)::text);
        RETURN OLD;
    END IF;
    PERFORM pg_notify('{channel}',
        json_build_object('action', lower(TG_OP), 'key', NEW.key, 'value', NEW.value)::text);
    RETURN NEW;
END;
$$ LANGUAGE plpgsql"#
    );
    sqlx::query(&function)
        .execute(pool)
        .await
        .context("creating sync-config notify function")?;

    let drop_trigger = format!("DROP TRIGGER IF EXISTS {table}_changed ON {table}");
    sqlx::query(&drop_trigger)
        .execute(pool)
        .await
        .context("dropping stale sync-config trigger")?;

    let trigger = format!(
        "CREATE TRIGGER {table}_changed AFTER INSERT OR UPDATE OR DELETE ON {table} \
         FOR EACH ROW EXECUTE FUNCTION {table}_notify()"
    );
    sqlx::query(&trigger)
        .execute(pool)
        .await
        .context("creating sync-config trigger")?;

    Ok(())
}

async fn load_all(pool: &PgPool, table: &str) -> anyhow::Result<BTreeMap<String, Value>> {
    let sql = format!("SELECT key, value FROM {table}");
    let rows = sqlx::query(&sql)
        .fetch_all(pool)
        .await
        .context("loading sync-config table")?;
    let mut entries = BTreeMap::new();
    for row in rows {
        let key: String = row.try_get("key")?;
        let value: Value = row.try_get("value")?;
        entries.insert(key, value);
    }
    Ok(entries)
}

/// Holds one dedicated connection in LISTEN mode and feeds notifications
/// into the cache. On failure: sleep, reconnect, then full sync to recover
/// anything missed while disconnected.
async fn listener_task(service: Arc<SyncConfig>) {
    let channel = service.settings.channel.clone();
    let reconnect = service.settings.reconnect_interval;
    let cancel = service.cancel.clone();
    let mut recovering = false;

    loop {
        if cancel.is_cancelled() {
            return;
        }

        match PgListener::connect_with(&service.pool).await {
            Ok(mut listener) => match listener.listen(&channel).await {
                Ok(()) => {
                    tracing::info!(channel = %channel, "sync-config listener attached");
                    if recovering {
                        recovering = false;
                        if let Err(err) = service.sync().await {
                            tracing::error!(error = %err, "post-reconnect sync failed");
                        }
                    }
                    loop {
                        tokio::select! {
                            () = cancel.cancelled() => return,
                            notification = listener.recv() => match notification {
                                Ok(notification) => {
                                    apply_notification(&service, notification.payload());
                                }
                                Err(err) => {
                                    tracing::warn!(error = %err, "listener connection lost");
                                    break;
                                }
                            },
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, channel = %channel, "LISTEN failed");
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, "listener connect failed");
            }
        }

        recovering = true;
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(reconnect) => {}
        }
    }
}

/// Broadcasts the local CRC on the shared channel so other instances can
/// detect drift.
async fn heartbeat_task(service: Arc<SyncConfig>) {
    let cancel = service.cancel.clone();
    let mut ticker = tokio::time::interval(service.settings.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // the immediate first tick broadcasts our initial state
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let payload = match serde_json::to_string(&Notification::Heartbeat {
                    crc: service.crc(),
                }) {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::error!(error = %err, "heartbeat serialization failed");
                        continue;
                    }
                };
                let result = sqlx::query("SELECT pg_notify($1, $2)")
                    .bind(&service.settings.channel)
                    .bind(&payload)
                    .execute(&service.pool)
                    .await;
                if let Err(err) = result {
                    tracing::warn!(error = %err, "heartbeat notify failed");
                }
            }
        }
    }
}
