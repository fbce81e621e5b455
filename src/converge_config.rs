//! Convergence configuration.
//!
//! All configuration is loaded from environment variables (with `.env`
//! support), making the converger fully configurable without code changes.

use std::{env, path::PathBuf};

use thiserror::Error;

/// Configuration shared by every converger.
#[derive(Clone, Debug)]
pub struct ConvergeConfig {
    /// Region used in ARNs and for new buckets.
    /// Env: `CONVERGE_REGION` (default: "us-east-1")
    pub region: String,

    /// ARN partition.
    /// Env: `CONVERGE_PARTITION` (default: "aws")
    pub partition: String,

    /// Account id; when unset it is resolved through the identity service.
    /// Env: `CONVERGE_ACCOUNT_ID` (optional, 12 digits)
    pub account_id: Option<String>,

    /// Tag key marking a gateway as owned by a network.
    /// Env: `CONVERGE_OWNER_TAG_KEY` (default: "OwnerVPC")
    pub owner_tag_key: String,

    /// Tag keys with this prefix are never deleted.
    /// Env: `CONVERGE_RESERVED_TAG_PREFIX` (default: "aws:", empty disables)
    pub reserved_tag_prefix: Option<String>,

    /// Delete database instances without a final snapshot.
    /// Env: `CONVERGE_SKIP_FINAL_SNAPSHOT` (default: true)
    pub skip_final_snapshot: bool,

    /// Managed-entry store path.
    /// Env: `CONVERGE_STATE_PATH` (default: ".converge_state.json")
    pub state_path: PathBuf,

    /// Sandbox provider state path.
    /// Env: `CONVERGE_SANDBOX_PATH` (default: ".converge_sandbox.json")
    pub sandbox_path: PathBuf,

    /// Tracing filter directive.
    /// Env: `CONVERGE_LOG` (default: "info")
    pub log_filter: String,
}

impl Default for ConvergeConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            partition: "aws".to_string(),
            account_id: None,
            owner_tag_key: "OwnerVPC".to_string(),
            reserved_tag_prefix: Some("aws:".to_string()),
            skip_final_snapshot: true,
            state_path: PathBuf::from(".converge_state.json"),
            sandbox_path: PathBuf::from(".converge_sandbox.json"),
            log_filter: "info".to_string(),
        }
    }
}

impl ConvergeConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional environment variables (with defaults):
    /// - `CONVERGE_REGION`: region (default: "us-east-1")
    /// - `CONVERGE_PARTITION`: ARN partition (default: "aws")
    /// - `CONVERGE_ACCOUNT_ID`: account id (optional)
    /// - `CONVERGE_OWNER_TAG_KEY`: ownership tag key (default: "OwnerVPC")
    /// - `CONVERGE_RESERVED_TAG_PREFIX`: protected tag prefix (default: "aws:")
    /// - `CONVERGE_SKIP_FINAL_SNAPSHOT`: skip final db snapshot (default: true)
    /// - `CONVERGE_STATE_PATH`: managed-entry store (default: ".converge_state.json")
    /// - `CONVERGE_SANDBOX_PATH`: sandbox state (default: ".converge_sandbox.json")
    /// - `CONVERGE_LOG`: tracing filter (default: "info")
    ///
    /// # Errors
    ///
    /// Returns an error if a variable holds an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        let account_id = env::var("CONVERGE_ACCOUNT_ID")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        if let Some(id) = &account_id
            && !is_account_id(id)
        {
            return Err(ConfigError::InvalidEnv {
                key: "CONVERGE_ACCOUNT_ID",
                value: id.clone(),
                reason: "expected 12 digits",
            });
        }

        let reserved_tag_prefix = match env::var("CONVERGE_RESERVED_TAG_PREFIX") {
            Ok(v) if v.is_empty() => None,
            Ok(v) => Some(v),
            Err(_) => defaults.reserved_tag_prefix,
        };

        Ok(Self {
            region: non_empty_env("CONVERGE_REGION", defaults.region)?,
            partition: non_empty_env("CONVERGE_PARTITION", defaults.partition)?,
            account_id,
            owner_tag_key: non_empty_env("CONVERGE_OWNER_TAG_KEY", defaults.owner_tag_key)?,
            reserved_tag_prefix,
            skip_final_snapshot: parse_bool_env("CONVERGE_SKIP_FINAL_SNAPSHOT", true)?,
            state_path: env::var_os("CONVERGE_STATE_PATH")
                .map_or(defaults.state_path, PathBuf::from),
            sandbox_path: env::var_os("CONVERGE_SANDBOX_PATH")
                .map_or(defaults.sandbox_path, PathBuf::from),
            log_filter: env::var("CONVERGE_LOG").unwrap_or(defaults.log_filter),
        })
    }
}

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid environment variable value.
    #[error("invalid env var {key}={value:?}: {reason}")]
    InvalidEnv {
        /// The environment variable key.
        key: &'static str,
        /// The environment variable value.
        value: String,
        /// The reason for invalidity.
        reason: &'static str,
    },
}

/// Whether `s` looks like an account id.
#[must_use]
pub fn is_account_id(s: &str) -> bool {
    s.len() == 12 && s.bytes().all(|b| b.is_ascii_digit())
}

fn non_empty_env(key: &'static str, default: String) -> Result<String, ConfigError> {
    match env::var(key) {
        Ok(v) if v.trim().is_empty() => Err(ConfigError::InvalidEnv {
            key,
            value: v,
            reason: "must not be empty",
        }),
        Ok(v) => Ok(v.trim().to_string()),
        Err(_) => Ok(default),
    }
}

fn parse_bool_env(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    env::var(key).map_or(Ok(default), |v| {
        match v.to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidEnv {
                key,
                value: v,
                reason: "expected a boolean",
            }),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ConvergeConfig::default();
        assert_eq!(cfg.region, "us-east-1");
        assert_eq!(cfg.partition, "aws");
        assert_eq!(cfg.owner_tag_key, "OwnerVPC");
        assert_eq!(cfg.reserved_tag_prefix.as_deref(), Some("aws:"));
        assert!(cfg.skip_final_snapshot);
    }

    #[test]
    fn account_id_shape() {
        assert!(is_account_id("123456789012"));
        assert!(!is_account_id("12345678901"));
        assert!(!is_account_id("12345678901x"));
    }
}
