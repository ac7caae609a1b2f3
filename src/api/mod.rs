//! License REST API collaborator
//!
//! The purchase flow only sees the [`LicenseApi`] trait; [`HttpLicenseApi`]
//! is the reqwest implementation.

pub mod client;
pub mod models;
pub mod qr;
pub mod signature;

pub use client::HttpLicenseApi;
pub use models::{LicenseRequest, PaymentRequest, PaymentResponse, VerifyLicenseResponse};
pub use qr::{parse_qr_string, QrParseError, QrPayment};
pub use signature::{ResponseVerifier, SignaturePolicy};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// A decoded response together with what is needed to check its signature
#[derive(Debug, Clone)]
pub struct ApiResponse<T> {
    pub status: u16,
    pub body: T,
    /// Body exactly as received
    pub raw_body: Bytes,
    /// Value of the signature header, if any
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("HTTP {code}: {message}")]
    Status { code: u16, message: String },
    #[error("Empty response body (HTTP {code})")]
    EmptyBody { code: u16 },
    #[error("Network error: {0}")]
    Network(String),
    #[error("Invalid response body: {0}")]
    Decode(String),
    #[error("HTTP client error: {0}")]
    Client(String),
}

impl ApiError {
    /// HTTP status, when the server answered at all
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ApiError::Status { code, .. } | ApiError::EmptyBody { code } => Some(*code),
            _ => None,
        }
    }
}

#[async_trait]
pub trait LicenseApi: Send + Sync {
    /// Request a payment QR for `license_uuid`
    async fn pay_license(
        &self,
        license_uuid: &str,
        request: &PaymentRequest,
        access_token: &str,
    ) -> Result<ApiResponse<PaymentResponse>, ApiError>;

    /// Look up the active license for a package on this device
    async fn verify_license(
        &self,
        request: &LicenseRequest,
        access_token: &str,
    ) -> Result<ApiResponse<VerifyLicenseResponse>, ApiError>;
}
