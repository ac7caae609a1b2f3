//! Request and response bodies for the license REST API

use serde::{Deserialize, Serialize};

/// Body of the pay-with-transfermovil request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentRequest {
    pub device: String,
}

/// Body of the verify request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LicenseRequest {
    pub package_name: String,
    pub device: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentResponse {
    /// Raw QR payload for the payment app
    #[serde(default)]
    pub qr: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerifyLicenseResponse {
    /// Name of the active license; empty when nothing has been paid for
    #[serde(default)]
    pub license: String,
}

impl VerifyLicenseResponse {
    pub fn has_paid_license(&self) -> bool {
        !self.license.trim().is_empty()
    }
}
