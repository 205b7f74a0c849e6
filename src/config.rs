//! Engine configuration.
//!
//! Settings are read once when a [`Cluster`](crate::cluster::Cluster) is
//! built. They can be supplied as JSON or through `MATVIEW_*` environment
//! variables; every numeric setting has an accepted range that
//! [`EngineConfig::validate`] enforces.

use serde::Deserialize;

use crate::error::MatViewError;

/// Accepted range for `partition_count`.
pub const PARTITION_COUNT_RANGE: (u32, u32) = (1, 1024);

/// Environment variable names.
pub const ENV_PARTITION_COUNT: &str = "MATVIEW_PARTITION_COUNT";
pub const ENV_TEMP_TABLE_ROW_LIMIT: &str = "MATVIEW_TEMP_TABLE_ROW_LIMIT";
pub const ENV_CATCH_UP_ON_INSTALL: &str = "MATVIEW_CATCH_UP_ON_INSTALL";
pub const ENV_TRACE_MERGES: &str = "MATVIEW_TRACE_MERGES";

/// Runtime settings for the execution engine.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Number of partitions, each served by one single-threaded site.
    pub partition_count: u32,

    /// Maximum number of rows a single plan execution may produce.
    ///
    /// Exceeding it raises [`MatViewError::TempTableLimitExceeded`], which
    /// aborts the triggering mutation.
    pub temp_table_row_limit: usize,

    /// Whether newly installed views are populated from existing source data.
    ///
    /// Disable when the caller restores view contents itself (for example
    /// from a snapshot) and will enable the view afterwards.
    pub catch_up_on_install: bool,

    /// Emit a `trace` event for every merged delta row.
    pub trace_merges: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            partition_count: 1,
            temp_table_row_limit: 1_000_000,
            catch_up_on_install: true,
            trace_merges: false,
        }
    }
}

impl EngineConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, MatViewError> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| MatViewError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from defaults overridden by `MATVIEW_*`
    /// environment variables.
    pub fn from_env() -> Result<Self, MatViewError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, MatViewError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = EngineConfig::default();
        if let Some(v) = lookup(ENV_PARTITION_COUNT) {
            config.partition_count = parse_setting(ENV_PARTITION_COUNT, &v)?;
        }
        if let Some(v) = lookup(ENV_TEMP_TABLE_ROW_LIMIT) {
            config.temp_table_row_limit = parse_setting(ENV_TEMP_TABLE_ROW_LIMIT, &v)?;
        }
        if let Some(v) = lookup(ENV_CATCH_UP_ON_INSTALL) {
            config.catch_up_on_install = parse_bool(ENV_CATCH_UP_ON_INSTALL, &v)?;
        }
        if let Some(v) = lookup(ENV_TRACE_MERGES) {
            config.trace_merges = parse_bool(ENV_TRACE_MERGES, &v)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check every setting against its accepted range.
    pub fn validate(&self) -> Result<(), MatViewError> {
        let (min, max) = PARTITION_COUNT_RANGE;
        if !(min..=max).contains(&self.partition_count) {
            return Err(MatViewError::InvalidConfig(format!(
                "partition_count must be between {min} and {max}, got {}",
                self.partition_count
            )));
        }
        if self.temp_table_row_limit == 0 {
            return Err(MatViewError::InvalidConfig(
                "temp_table_row_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_partition_count(mut self, partition_count: u32) -> Self {
        self.partition_count = partition_count;
        self
    }

    pub fn with_temp_table_row_limit(mut self, limit: usize) -> Self {
        self.temp_table_row_limit = limit;
        self
    }

    pub fn with_catch_up_on_install(mut self, enabled: bool) -> Self {
        self.catch_up_on_install = enabled;
        self
    }

    pub fn with_trace_merges(mut self, enabled: bool) -> Self {
        self.trace_merges = enabled;
        self
    }
}

fn parse_setting<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, MatViewError> {
    raw.trim()
        .parse()
        .map_err(|_| MatViewError::InvalidConfig(format!("{name}: cannot parse '{raw}'")))
}

fn parse_bool(name: &str, raw: &str) -> Result<bool, MatViewError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(MatViewError::InvalidConfig(format!(
            "{name}: expected a boolean, got '{raw}'"
        ))),
    }
}
