//! Session configuration.
//!
//! Reads from environment variables:
//! - `RELSTASH_ALLOW_SCHEMA_CREATION`: create missing tables on demand
//!   (default: "true")
//! - `RELSTASH_MAX_IN_LIST`: cap on ids per `IN (...)` list in bulk deletes
//!   (default: the dialect's limit)
//! - `RELSTASH_JOURNAL_MODE`: SQLite journal mode (default: "WAL")

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Options for opening a [`Session`](crate::Session).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// When false, a missing class table is a hard error instead of being
    /// created.
    pub allow_schema_creation: bool,
    /// Overrides the dialect's maximum `IN (...)` list length.
    pub max_in_list: Option<usize>,
    /// SQLite `journal_mode` pragma value.
    pub journal_mode: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            allow_schema_creation: true,
            max_in_list: None,
            journal_mode: "WAL".to_string(),
        }
    }
}

impl StoreConfig {
    /// Builds a config from the process environment.
    pub fn from_env() -> Result<Self, StorageError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup, falling back to
    /// defaults for absent keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, StorageError> {
        let mut config = StoreConfig::default();
        if let Some(raw) = lookup("RELSTASH_ALLOW_SCHEMA_CREATION") {
            config.allow_schema_creation = parse_bool(&raw).ok_or_else(|| {
                StorageError::Config(format!(
                    "RELSTASH_ALLOW_SCHEMA_CREATION: expected a boolean, got '{raw}'"
                ))
            })?;
        }
        if let Some(raw) = lookup("RELSTASH_MAX_IN_LIST") {
            let limit: usize = raw.trim().parse().map_err(|_| {
                StorageError::Config(format!("RELSTASH_MAX_IN_LIST: expected a number, got '{raw}'"))
            })?;
            if limit == 0 {
                return Err(StorageError::Config(
                    "RELSTASH_MAX_IN_LIST must be at least 1".to_string(),
                ));
            }
            config.max_in_list = Some(limit);
        }
        if let Some(raw) = lookup("RELSTASH_JOURNAL_MODE") {
            config.journal_mode = raw.trim().to_uppercase();
        }
        Ok(config)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = StoreConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, StoreConfig::default());
        assert!(config.allow_schema_creation);
    }

    #[test]
    fn reads_all_keys() {
        let config = StoreConfig::from_lookup(lookup_from(&[
            ("RELSTASH_ALLOW_SCHEMA_CREATION", "no"),
            ("RELSTASH_MAX_IN_LIST", "50"),
            ("RELSTASH_JOURNAL_MODE", "delete"),
        ]))
        .unwrap();
        assert!(!config.allow_schema_creation);
        assert_eq!(config.max_in_list, Some(50));
        assert_eq!(config.journal_mode, "DELETE");
    }

    #[test]
    fn rejects_garbage_values() {
        let err = StoreConfig::from_lookup(lookup_from(&[("RELSTASH_MAX_IN_LIST", "lots")]))
            .unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
        let err = StoreConfig::from_lookup(lookup_from(&[("RELSTASH_MAX_IN_LIST", "0")]))
            .unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));
    }

    #[test]
    fn deserializes_partial_json() {
        let config: StoreConfig = serde_json::from_str(r#"{"max_in_list": 10}"#).unwrap();
        assert_eq!(config.max_in_list, Some(10));
        assert_eq!(config.journal_mode, "WAL");
    }
}
