use crate::config::ConfigError;
use crate::engine::OrchestratorError;
use crate::telemetry::TelemetryError;
use std::fmt;

/// Umbrella error for hosts wiring configuration, tracing and case transitions together.
#[derive(Debug)]
pub enum AppError {
    Config(ConfigError),
    Telemetry(TelemetryError),
    Orchestrator(OrchestratorError),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(err) => write!(f, "configuration error: {}", err),
            AppError::Telemetry(err) => write!(f, "telemetry error: {}", err),
            AppError::Orchestrator(err) => write!(f, "case transition error: {}", err),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Config(err) => Some(err),
            AppError::Telemetry(err) => Some(err),
            AppError::Orchestrator(err) => Some(err),
        }
    }
}

impl AppError {
    /// Whether the caller should reload the case and try the transition again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Orchestrator(OrchestratorError::ConcurrentCaseMutation { .. })
        )
    }
}

impl From<ConfigError> for AppError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<TelemetryError> for AppError {
    fn from(value: TelemetryError) -> Self {
        Self::Telemetry(value)
    }
}

impl From<OrchestratorError> for AppError {
    fn from(value: OrchestratorError) -> Self {
        Self::Orchestrator(value)
    }
}
