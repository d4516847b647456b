//! Bind-time configuration for a filter instance.

use serde::{Deserialize, Serialize};

use crate::error::{FilterError, FilterResult};

/// Configuration for a filter instance, supplied once at bind time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Suffix appended to the parent's name to form the device name
    /// (default "filter").
    pub name_suffix: String,
    /// Number of metadata block cache entries (default 256).
    pub cache_entries: usize,
    /// Number of cache hash buckets, a power of two (default 32).
    pub cache_buckets: usize,
    /// Worker iterations between bitmap compression passes (default 65536).
    pub compress_interval: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            name_suffix: "filter".to_string(),
            cache_entries: 256,
            cache_buckets: 32,
            compress_interval: 65536,
        }
    }
}

impl FilterConfig {
    /// Parses a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> FilterResult<Self> {
        let config: FilterConfig = serde_json::from_str(json)
            .map_err(|e| FilterError::invalid(format!("bad filter config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every field is usable.
    pub fn validate(&self) -> FilterResult<()> {
        if self.name_suffix.is_empty() {
            return Err(FilterError::invalid("name_suffix must not be empty"));
        }
        if self.cache_entries == 0 {
            return Err(FilterError::invalid("cache_entries must be non-zero"));
        }
        if !self.cache_buckets.is_power_of_two() {
            return Err(FilterError::invalid(format!(
                "cache_buckets must be a power of two, got {}",
                self.cache_buckets
            )));
        }
        if self.compress_interval == 0 {
            return Err(FilterError::invalid("compress_interval must be non-zero"));
        }
        Ok(())
    }

    /// Device name derived from the parent's name.
    pub fn device_name(&self, parent: &str) -> String {
        format!("{}-{}", parent, self.name_suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FilterConfig::default();
        assert_eq!(config.cache_entries, 256);
        assert_eq!(config.cache_buckets, 32);
        assert_eq!(config.compress_interval, 65536);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config = FilterConfig::from_json(r#"{"name_suffix": "verity", "cache_entries": 16}"#)
            .unwrap();
        assert_eq!(config.name_suffix, "verity");
        assert_eq!(config.cache_entries, 16);
        assert_eq!(config.cache_buckets, 32);
    }

    #[test]
    fn test_from_json_rejects_bad_buckets() {
        let result = FilterConfig::from_json(r#"{"cache_buckets": 12}"#);
        assert!(matches!(result, Err(FilterError::InvalidArgs { .. })));
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        let result = FilterConfig::from_json("not json");
        assert!(matches!(result, Err(FilterError::InvalidArgs { .. })));
    }

    #[test]
    fn test_zero_entries_invalid() {
        let config = FilterConfig {
            cache_entries: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_device_name() {
        let config = FilterConfig::default();
        assert_eq!(config.device_name("ramdisk0"), "ramdisk0-filter");
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = FilterConfig {
            name_suffix: "crypt".to_string(),
            cache_entries: 64,
            cache_buckets: 8,
            compress_interval: 1024,
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: FilterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
