//! Session configuration.

use serde::Deserialize;

/// Default number of operations submitted to the store per bulk batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Default database addressed by [`crate::Session::c`].
    #[serde(default = "default_database")]
    pub database: String,
    /// Upper bound on operations per bulk sub-batch. Larger bulk runs are
    /// split and their failure indices re-based to the caller's original
    /// submission order.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

fn default_database() -> String {
    "test".to_string()
}

fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            database: default_database(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

impl SessionConfig {
    /// Loads a configuration from a JSON string.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_fields() {
        let config = SessionConfig::from_json(r#"{"database": "mydb"}"#).unwrap();
        assert_eq!(config.database, "mydb");
        assert_eq!(config.max_batch_size, DEFAULT_MAX_BATCH_SIZE);
    }
}
