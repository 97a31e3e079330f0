//! Helpers for reading and writing connection `settings.sync` payloads.
//!
//! Per-connection overrides for backfill lookback, scheduler cadence, and the entity types
//! a backfill walks. The orchestrator and the scheduler both read them through here.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::warn;

use crate::config::{SchedulerConfig, SyncConfig};

/// Minimum override interval allowed by the scheduler (one minute).
pub const MIN_SYNC_INTERVAL_SECONDS: u64 = 60;

/// Longest lookback a connection may request for its first backfill.
pub const MAX_LOOKBACK_DAYS: u32 = 730;

/// Settings stored under `connections.settings.sync`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConnectionSyncSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookback_days: Option<u32>,
    /// Restricts backfill to these entity types; unknown names are dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_types: Option<Vec<String>>,
}

impl ConnectionSyncSettings {
    /// Parse settings from the connection's JSON, falling back to defaults on errors.
    pub fn from_connection_settings(settings: Option<&JsonValue>) -> Self {
        let Some(settings) = settings else {
            return Self::default();
        };

        match settings {
            JsonValue::Object(obj) => match obj.get("sync") {
                Some(sync_value) => serde_json::from_value::<Self>(sync_value.clone())
                    .unwrap_or_else(|_| {
                        warn!(sync_value = ?sync_value, "Failed to parse sync settings; using defaults");
                        Self::default()
                    }),
                None => Self::default(),
            },
            JsonValue::Null => Self::default(),
            other => {
                warn!(value = ?other, "Unexpected connection settings format; expected object");
                Self::default()
            }
        }
    }

    /// Write back under `sync`, preserving any other keys.
    pub fn into_connection_settings(&self, existing: Option<&JsonValue>) -> JsonValue {
        let mut root = match existing {
            Some(JsonValue::Object(map)) => map.clone(),
            _ => Map::new(),
        };

        if *self == Self::default() {
            root.remove("sync");
        } else {
            let sync_value = serde_json::to_value(self).unwrap_or(JsonValue::Object(Map::new()));
            root.insert("sync".to_string(), sync_value);
        }

        JsonValue::Object(root)
    }

    pub fn effective_interval_seconds(&self, scheduler: &SchedulerConfig) -> u64 {
        self.interval_seconds
            .filter(|value| *value >= MIN_SYNC_INTERVAL_SECONDS)
            .unwrap_or(scheduler.default_interval_seconds)
    }

    pub fn effective_lookback_days(&self, sync: &SyncConfig) -> u32 {
        self.lookback_days
            .filter(|days| (1..=MAX_LOOKBACK_DAYS).contains(days))
            .unwrap_or(sync.lookback_days)
    }

    /// Entity types to backfill, in the adapter's order.
    pub fn select_entity_types(&self, available: &[&'static str]) -> Vec<&'static str> {
        match &self.entity_types {
            Some(wanted) if !wanted.is_empty() => available
                .iter()
                .copied()
                .filter(|entity| wanted.iter().any(|w| w.eq_ignore_ascii_case(entity)))
                .collect(),
            _ => available.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_sync_settings_from_object() {
        let raw = json!({
            "sync": { "interval_seconds": 600, "lookback_days": 7, "entity_types": ["Orders"] },
            "other": { "value": 1 }
        });

        let settings = ConnectionSyncSettings::from_connection_settings(Some(&raw));
        assert_eq!(settings.interval_seconds, Some(600));
        assert_eq!(settings.lookback_days, Some(7));
        assert_eq!(
            settings.select_entity_types(&["orders", "customers"]),
            vec!["orders"]
        );
    }

    #[test]
    fn invalid_payload_falls_back_to_defaults() {
        let raw = json!({ "sync": { "interval_seconds": "soon" } });
        assert_eq!(
            ConnectionSyncSettings::from_connection_settings(Some(&raw)),
            ConnectionSyncSettings::default()
        );
        assert_eq!(
            ConnectionSyncSettings::from_connection_settings(Some(&json!([1, 2]))),
            ConnectionSyncSettings::default()
        );
    }

    #[test]
    fn out_of_range_overrides_use_config() {
        let settings = ConnectionSyncSettings {
            interval_seconds: Some(5),
            lookback_days: Some(0),
            entity_types: Some(vec![]),
        };
        assert_eq!(
            settings.effective_interval_seconds(&SchedulerConfig::default()),
            SchedulerConfig::default().default_interval_seconds
        );
        assert_eq!(settings.effective_lookback_days(&SyncConfig::default()), 30);
        assert_eq!(
            settings.select_entity_types(&["charges", "invoices"]),
            vec!["charges", "invoices"]
        );
    }

    #[test]
    fn round_trip_preserves_unrelated_keys() {
        let existing = json!({ "display_name": "Main shop" });
        let settings = ConnectionSyncSettings {
            lookback_days: Some(14),
            ..Default::default()
        };
        let merged = settings.into_connection_settings(Some(&existing));
        assert_eq!(merged["display_name"], "Main shop");
        assert_eq!(merged["sync"]["lookback_days"], 14);

        let cleared = ConnectionSyncSettings::default().into_connection_settings(Some(&merged));
        assert!(cleared.get("sync").is_none());
    }
}
