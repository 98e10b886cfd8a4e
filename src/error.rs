//! Error types for shoes-provider
//!
//! There are two error types: `ShoesError` (main error enum) and
//! `ConfigError` (configuration-specific).
//!
//! ## Error Handling Philosophy
//!
//! Library code uses `crate::error::Result<T>` which returns `ShoesError`.
//! The binary uses `anyhow::Result<T>` for top-level error handling, with
//! `anyhow::Error::from` at the boundary so error chains are preserved.
//!
//! ## Taxonomy
//!
//! - `ConfigError`: fatal at startup. Missing required settings, malformed
//!   mapping JSON, unknown tier names. Never produced mid-request because
//!   configuration is snapshotted once and immutable afterwards.
//!
//! - `InvalidArgument`: the caller's request is malformed (bad runner name
//!   or instance ID syntax, unknown resource tier, delete lookup that finds
//!   no instance). Surfaced to the caller, never retried locally.
//!
//! - `Substrate`: any vendor API call failed or a wait timed out. Wrapped
//!   with the step and identifier so the failure can be diagnosed without
//!   re-running. No local retry and no partial-state rollback: the two
//!   lifecycle operations are safe to repeat, so retries belong to the
//!   caller (see the idempotent lookup in `providers::lxd`).

use thiserror::Error;

/// Main error type for shoes-provider
#[derive(Error, Debug)]
pub enum ShoesError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid argument: {field} - {reason}")]
    InvalidArgument { field: String, reason: String },

    #[error("Substrate error: {backend} - {step} failed{}: {message}", fmt_instance(.instance))]
    Substrate {
        backend: &'static str,
        step: &'static str,
        instance: Option<String>,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Timed out after {waited_secs}s waiting for {backend} {step}")]
    WaitTimeout {
        backend: &'static str,
        step: &'static str,
        waited_secs: u64,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

fn fmt_instance(instance: &Option<String>) -> String {
    match instance {
        Some(id) => format!(" (instance: {})", id),
        None => String::new(),
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment value: {0}")]
    MissingEnv(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Unknown resource type in mapping: {0}")]
    UnknownResourceType(String),

    #[error("Failed to parse {field}: {reason}")]
    ParseError { field: String, reason: String },
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ShoesError>;

impl ShoesError {
    /// Shorthand for a vendor-side failure wrapped with step context.
    pub fn substrate(
        backend: &'static str,
        step: &'static str,
        instance: Option<&str>,
        err: impl std::fmt::Display,
    ) -> Self {
        ShoesError::Substrate {
            backend,
            step,
            instance: instance.map(|s| s.to_string()),
            message: err.to_string(),
            source: None,
        }
    }

    /// Shorthand for a malformed caller argument.
    pub fn invalid_argument(field: &str, reason: impl Into<String>) -> Self {
        ShoesError::InvalidArgument {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Wire-level status code for the plugin transport.
    ///
    /// Mirrors the gRPC codes the orchestrator distinguishes: everything
    /// that is not the caller's fault is `internal`.
    pub fn status_code(&self) -> &'static str {
        match self {
            ShoesError::InvalidArgument { .. } => "invalid_argument",
            _ => "internal",
        }
    }
}
