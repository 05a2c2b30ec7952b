use std::env;
use std::fmt;

use crate::engine::{SameTierPolicy, UserId};

const MAX_COMMIT_MARKER_LEN: usize = 40;
const DEFAULT_MAX_STATUS_ADVANCES: u8 = 16;

/// Distinguishes runtime behavior for different stages of the host service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for a process embedding the rule engine.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub engine: EngineConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("ROUTING_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let commit_marker =
            env::var("ROUTING_COMMIT_SHA").unwrap_or_else(|_| "unknown".to_string());
        let commit_marker = commit_marker.trim().to_string();
        if commit_marker.is_empty() || commit_marker.len() > MAX_COMMIT_MARKER_LEN {
            return Err(ConfigError::InvalidCommitMarker {
                value: commit_marker,
            });
        }

        let same_tier_policy = match env::var("ROUTING_SAME_TIER_POLICY") {
            Ok(raw) => SameTierPolicy::parse(&raw)
                .ok_or(ConfigError::InvalidSameTierPolicy { value: raw })?,
            Err(_) => SameTierPolicy::default(),
        };

        let max_status_advances = match env::var("ROUTING_MAX_STATUS_ADVANCES") {
            Ok(raw) => raw
                .trim()
                .parse::<u8>()
                .map_err(|_| ConfigError::InvalidStatusAdvanceLimit)?,
            Err(_) => DEFAULT_MAX_STATUS_ADVANCES,
        };

        let system_user = env::var("ROUTING_SYSTEM_USER")
            .map(UserId)
            .unwrap_or_else(|_| EngineConfig::default().system_user);

        let log_level = env::var("ROUTING_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            environment,
            engine: EngineConfig {
                commit_marker,
                same_tier_policy,
                max_status_advances,
                system_user,
            },
            telemetry: TelemetryConfig {
                log_level,
                ansi: environment == AppEnvironment::Development,
            },
        })
    }
}

/// Settings consumed by the flagging, routing and history components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Rule-set version stamped on every history record.
    pub commit_marker: String,
    pub same_tier_policy: SameTierPolicy,
    /// Upper bound on automatic status advances within one routing pass.
    pub max_status_advances: u8,
    /// Actor recorded on history produced by the routing engine.
    pub system_user: UserId,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            commit_marker: "unknown".to_string(),
            same_tier_policy: SameTierPolicy::default(),
            max_status_advances: DEFAULT_MAX_STATUS_ADVANCES,
            system_user: UserId("system".to_string()),
        }
    }
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub ansi: bool,
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidCommitMarker { value: String },
    InvalidSameTierPolicy { value: String },
    InvalidStatusAdvanceLimit,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidCommitMarker { value } => write!(
                f,
                "ROUTING_COMMIT_SHA must be 1-{MAX_COMMIT_MARKER_LEN} characters (got '{value}')"
            ),
            ConfigError::InvalidSameTierPolicy { value } => write!(
                f,
                "ROUTING_SAME_TIER_POLICY must be 'most_recent' or 'union' (got '{value}')"
            ),
            ConfigError::InvalidStatusAdvanceLimit => {
                write!(f, "ROUTING_MAX_STATUS_ADVANCES must be a valid u8")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
