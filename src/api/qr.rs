//! Payment QR payload parsing
//!
//! The pay endpoint returns the QR content as a loose `key:value` list,
//! not JSON:
//!
//! ```text
//! {id_transaccion:APK00000000004050865,importe:15.0,moneda:CUP,numero_proveedor:57001,version:1}
//! ```

use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

/// Decoded payment QR
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QrPayment {
    pub transaction_id: String,
    pub amount: f64,
    pub currency: String,
    pub provider_number: String,
    pub version: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QrParseError {
    #[error("QR payload is empty")]
    Empty,
    #[error("QR payload has no {0}")]
    MissingField(&'static str),
}

/// Parse the QR payload. Unknown keys are ignored; an unparseable amount
/// reads as zero.
pub fn parse_qr_string(raw: &str) -> Result<QrPayment, QrParseError> {
    let cleaned = raw
        .trim()
        .trim_matches(|c: char| c == '{' || c == '}' || c == '"' || c == '\'' || c.is_whitespace());
    if cleaned.is_empty() {
        return Err(QrParseError::Empty);
    }

    let fields: HashMap<&str, &str> = cleaned
        .split(',')
        .filter_map(|pair| pair.split_once(':'))
        .map(|(key, value)| (key.trim(), value.trim()))
        .collect();

    let transaction_id = fields
        .get("id_transaccion")
        .filter(|value| !value.is_empty())
        .ok_or(QrParseError::MissingField("id_transaccion"))?;

    let text = |key: &str| fields.get(key).map(|v| v.to_string()).unwrap_or_default();

    Ok(QrPayment {
        transaction_id: transaction_id.to_string(),
        amount: fields
            .get("importe")
            .and_then(|value| value.parse().ok())
            .unwrap_or(0.0),
        currency: text("moneda"),
        provider_number: text("numero_proveedor"),
        version: text("version"),
    })
}
