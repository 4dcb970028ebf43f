use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use projtrack_storage::{HttpClientConfig, SnapshotStore};
use serde::Serialize;
use thiserror::Error;

pub const DEFAULT_DEBUG_DATABASE_URL: &str = "postgres://localhost/covid_projections";
pub const DEFAULT_TABLE: &str = "projections";
pub const DEFAULT_MIN_MODEL_DATE: &str = "2020-04-04";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Debug,
    Production,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set in production mode")]
    Missing(&'static str),
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Process-wide settings, resolved once at start and passed by reference.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub mode: RunMode,
    pub database_url: String,
    pub table_name: String,
    pub min_model_date: NaiveDate,
    pub data_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub request_delay_ms: u64,
    pub cu_dir: Option<PathBuf>,
    pub web_port: u16,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mode = match var("PROJTRACK_MODE").as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("debug") => RunMode::Debug,
            Some("production") | Some("prod") => RunMode::Production,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "PROJTRACK_MODE",
                    value: other.to_string(),
                    reason: "expected `debug` or `production`".to_string(),
                })
            }
        };

        let database_url = match (var("DATABASE_URL"), mode) {
            (Some(url), _) => url,
            (None, RunMode::Debug) => DEFAULT_DEBUG_DATABASE_URL.to_string(),
            (None, RunMode::Production) => return Err(ConfigError::Missing("DATABASE_URL")),
        };

        let table_name = var("PROJTRACK_TABLE").unwrap_or_else(|| DEFAULT_TABLE.to_string());
        validate_identifier(&table_name).map_err(|reason| ConfigError::Invalid {
            var: "PROJTRACK_TABLE",
            value: table_name.clone(),
            reason,
        })?;

        let raw_min_date =
            var("PROJTRACK_MIN_MODEL_DATE").unwrap_or_else(|| DEFAULT_MIN_MODEL_DATE.to_string());
        let min_model_date = NaiveDate::parse_from_str(&raw_min_date, "%Y-%m-%d").map_err(|e| {
            ConfigError::Invalid {
                var: "PROJTRACK_MIN_MODEL_DATE",
                value: raw_min_date.clone(),
                reason: e.to_string(),
            }
        })?;

        Ok(Self {
            mode,
            database_url,
            table_name,
            min_model_date,
            data_dir: var("PROJTRACK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            workspace_root: var("PROJTRACK_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            user_agent: var("PROJTRACK_USER_AGENT")
                .unwrap_or_else(|| format!("projtrack/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: parse_number(&var, "PROJTRACK_HTTP_TIMEOUT_SECS", 20)?,
            request_delay_ms: parse_number(&var, "PROJTRACK_REQUEST_DELAY_MS", 200)?,
            cu_dir: var("PROJTRACK_CU_DIR").map(PathBuf::from),
            web_port: parse_number(&var, "PROJTRACK_WEB_PORT", 8000)?,
        })
    }

    pub fn is_production(&self) -> bool {
        self.mode == RunMode::Production
    }

    /// Default log filter when `RUST_LOG` is unset.
    pub fn default_log_filter(&self) -> &'static str {
        match self.mode {
            RunMode::Debug => "debug",
            RunMode::Production => "info",
        }
    }

    pub fn snapshot_store(&self) -> SnapshotStore {
        SnapshotStore::new(self.data_dir.clone())
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            courtesy_delay: Some(Duration::from_millis(self.request_delay_ms)),
            ..Default::default()
        }
    }
}

fn parse_number<T>(
    var: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var: key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

/// Table names are interpolated into SQL, so only plain identifiers are accepted.
pub fn validate_identifier(name: &str) -> Result<(), String> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err("must not be empty".to_string());
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err("must start with a letter or underscore".to_string());
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err("may only contain letters, digits and underscores".to_string());
    }
    if name.len() > 63 {
        return Err("must be at most 63 characters".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn debug_defaults_apply_without_environment() {
        let config = PipelineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.mode, RunMode::Debug);
        assert_eq!(config.database_url, DEFAULT_DEBUG_DATABASE_URL);
        assert_eq!(config.table_name, "projections");
        assert_eq!(config.min_model_date, NaiveDate::from_ymd_opt(2020, 4, 4).unwrap());
        assert_eq!(config.http_timeout_secs, 20);
        assert_eq!(config.request_delay_ms, 200);
        assert_eq!(config.web_port, 8000);
        assert_eq!(config.default_log_filter(), "debug");
        assert!(config.cu_dir.is_none());
    }

    #[test]
    fn production_requires_a_database_url() {
        let err = PipelineConfig::from_lookup(lookup(&[("PROJTRACK_MODE", "production")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("DATABASE_URL"));

        let config = PipelineConfig::from_lookup(lookup(&[
            ("PROJTRACK_MODE", "Production"),
            ("DATABASE_URL", "postgres://db/prod"),
        ]))
        .unwrap();
        assert!(config.is_production());
        assert_eq!(config.default_log_filter(), "info");
    }

    #[test]
    fn invalid_values_are_rejected_at_start() {
        for (key, value) in [
            ("PROJTRACK_MODE", "staging"),
            ("PROJTRACK_TABLE", "projections; drop table x"),
            ("PROJTRACK_MIN_MODEL_DATE", "04/04/2020"),
            ("PROJTRACK_HTTP_TIMEOUT_SECS", "soon"),
            ("PROJTRACK_WEB_PORT", "70000"),
        ] {
            let err = PipelineConfig::from_lookup(lookup(&[(key, value)])).unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { var, .. } if var == key),
                "{key} should be rejected"
            );
        }
    }

    #[test]
    fn identifiers_are_plain() {
        assert!(validate_identifier("projections_v2").is_ok());
        assert!(validate_identifier("_tmp").is_ok());
        assert!(validate_identifier("2020").is_err());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("a-b").is_err());
    }
}
