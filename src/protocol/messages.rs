//! Push message payloads carried inside `MSG` frames
//!
//! Payloads are JSON objects discriminated by their `type` field.

use serde::{Deserialize, Serialize};

/// Application-level push message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PushMessage {
    /// Backend confirmed a payment and issued the license
    PaymentLicense {
        #[serde(default)]
        message: LicenseGranted,
    },
    /// Backend reported a failed payment
    PaymentFailed {
        #[serde(default)]
        message: PaymentRejected,
    },
    /// Any other `type`; logged and dropped
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LicenseGranted {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PaymentRejected {
    #[serde(default)]
    pub reason: String,
}

impl PushMessage {
    /// Wire name of the message type, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            PushMessage::PaymentLicense { .. } => "payment-license",
            PushMessage::PaymentFailed { .. } => "payment-failed",
            PushMessage::Unknown => "unknown",
        }
    }
}
