//! Crate-level error type and user-facing message sanitisation
//!
//! Each layer has its own error enum; [`LicenseError`] gathers them for
//! callers that cross layers (the CLI, the service). Anything shown to a
//! user goes through [`sanitize_error_message`] first.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

const MAX_MESSAGE_LEN: usize = 500;
const TRUNCATE_SUFFIX: &str = "...[truncated]";

static SECRET_ASSIGNMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("valid secret pattern")
});

static BEARER_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(bearer)\s+[A-Za-z0-9._~+/=-]+").expect("valid bearer pattern"));

static SENSITIVE_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("valid path pattern")
});

/// Main error type for license client operations
#[derive(Debug, Error)]
pub enum LicenseError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Push channel error: {0}")]
    PubSub(#[from] crate::pubsub::PubSubError),

    #[error("{0}")]
    Coordinator(#[from] crate::purchase::coordinator::CoordinatorError),

    #[error("License API error: {0}")]
    Api(#[from] crate::api::ApiError),

    #[error("Invalid payment QR: {0}")]
    Qr(#[from] crate::api::QrParseError),

    #[error("{0}")]
    Identity(#[from] crate::identity::IdentityError),

    #[error("{0}")]
    Presenter(#[from] crate::purchase::presenter::PresenterError),

    #[error("Service error: {0}")]
    Service(#[from] crate::service::ServiceError),
}

impl LicenseError {
    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            LicenseError::Config(_) => "config_error",
            LicenseError::PubSub(_) => "pubsub_error",
            LicenseError::Coordinator(_) => "already_pending",
            LicenseError::Api(_) => "api_error",
            LicenseError::Qr(_) => "invalid_qr",
            LicenseError::Identity(_) => "identity_unavailable",
            LicenseError::Presenter(_) => "presenter_error",
            LicenseError::Service(_) => "service_error",
        }
    }

    /// Message safe to show to a user or write to an outcome
    pub fn user_message(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

/// Redact credentials and sensitive paths, and cap the length
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = SECRET_ASSIGNMENT.replace_all(message, "${1}=***");
    let sanitized = BEARER_TOKEN.replace_all(&sanitized, "${1} ***");
    let mut sanitized = SENSITIVE_PATH
        .replace_all(&sanitized, "/***REDACTED***/")
        .into_owned();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let mut cut = MAX_MESSAGE_LEN - TRUNCATE_SUFFIX.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(TRUNCATE_SUFFIX);
    }

    sanitized
}

/// Result type for license client operations
pub type LicenseResult<T> = Result<T, LicenseError>;
