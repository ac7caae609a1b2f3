//! Response signature policy
//!
//! The cryptographic check itself is external; this module only decides
//! whether a response is trusted given what was (or was not) supplied.

use std::sync::Arc;
use tracing::warn;

/// Verifies a response body against its signature header
pub trait ResponseVerifier: Send + Sync {
    fn verify(&self, body: &[u8], signature: &str) -> bool;
}

#[derive(Clone, Default)]
pub struct SignaturePolicy {
    verifier: Option<Arc<dyn ResponseVerifier>>,
    require_signature: bool,
}

impl SignaturePolicy {
    pub fn new(verifier: Option<Arc<dyn ResponseVerifier>>, require_signature: bool) -> Self {
        Self {
            verifier,
            require_signature,
        }
    }

    /// Whether a response with this body and signature header may be used
    pub fn is_trusted(&self, body: &[u8], signature: Option<&str>) -> bool {
        let signature = signature.map(str::trim).filter(|s| !s.is_empty());

        match (signature, &self.verifier) {
            (Some(signature), Some(verifier)) => {
                let valid = verifier.verify(body, signature);
                if !valid {
                    warn!("Response signature did not verify");
                }
                valid
            }
            (None, _) => {
                if self.require_signature {
                    warn!("No signature header found in response");
                }
                !self.require_signature
            }
            (Some(_), None) => {
                if self.require_signature {
                    warn!("Signed response but no verifier configured");
                }
                !self.require_signature
            }
        }
    }
}

impl std::fmt::Debug for SignaturePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignaturePolicy")
            .field("has_verifier", &self.verifier.is_some())
            .field("require_signature", &self.require_signature)
            .finish()
    }
}
