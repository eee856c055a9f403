use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings for one sync-config instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SyncConfigSettings {
    pub table: String,
    pub channel: String,
    /// Named pool requested from the `PoolProvider`.
    pub pool: String,
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    pub sync_on_mismatch: bool,
    /// Single-instance mode: with notifications disabled neither the
    /// listener connection nor the heartbeat worker is started.
    pub notifications: bool,
}

impl Default for SyncConfigSettings {
    fn default() -> Self {
        Self {
            table: "sync_config".to_string(),
            channel: "config_changes".to_string(),
            pool: "default".to_string(),
            reconnect_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5 * 60),
            sync_on_mismatch: true,
            notifications: true,
        }
    }
}

/// SQL identifiers (table, channel) are interpolated into DDL, so they are
/// restricted to plain identifier characters.
pub(crate) fn valid_ident(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = SyncConfigSettings::default();
        assert_eq!(settings.table, "sync_config");
        assert_eq!(settings.channel, "config_changes");
        assert_eq!(settings.reconnect_interval, Duration::from_secs(10));
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(300));
        assert!(settings.sync_on_mismatch);
        assert!(settings.notifications);
    }

    #[test]
    fn settings_parse_from_kebab_case_config() {
        let settings: SyncConfigSettings = serde_json::from_value(serde_json::json!({
            "channel": "app_changes",
            "reconnect-interval": "3s",
            "heartbeat-interval": "1m",
            "sync-on-mismatch": false,
            "notifications": false
        }))
        .unwrap();
        assert_eq!(settings.channel, "app_changes");
        assert_eq!(settings.reconnect_interval, Duration::from_secs(3));
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(60));
        assert!(!settings.sync_on_mismatch);
        assert!(!settings.notifications);
    }

    #[test]
    fn identifier_validation() {
        assert!(valid_ident("sync_config"));
        assert!(valid_ident("_private"));
        assert!(!valid_ident("1bad"));
        assert!(!valid_ident("drop table;"));
        assert!(!valid_ident(""));
    }
}
