//! Purchase and verify orchestration
//!
//! Ties the identity source, the REST API, the push channel and the payment
//! dialog together. Every path ends in an outcome value; nothing here
//! returns an error to the caller.

use super::coordinator::{OperationResult, PendingOperationCoordinator, WaitHandle};
use super::presenter::{DialogHandle, PaymentPresenter, PaymentPrompt, PAYMENT_APP_PACKAGE};
use crate::api::{
    parse_qr_string, ApiError, LicenseApi, LicenseRequest, PaymentRequest, SignaturePolicy,
};
use crate::config::AppConfig;
use crate::error::sanitize_error_message;
use crate::identity::{AccountIdentity, IdentityProvider};
use crate::pubsub::{ClientEvent, PubSubClient};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

const INVALID_SIGNATURE: &str = "Invalid response signature";

/// Result of [`LicenseService::purchase_license`]
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PurchaseOutcome {
    pub success: bool,
    pub paid: bool,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub username: String,
}

impl PurchaseOutcome {
    pub fn succeeded(license: String, username: String) -> Self {
        Self {
            success: true,
            paid: true,
            license: Some(license),
            username,
            ..Self::default()
        }
    }

    pub fn cancelled(username: String) -> Self {
        Self {
            cancelled: true,
            username,
            ..Self::default()
        }
    }

    pub fn failed(error: &str, status_code: Option<u16>, username: String) -> Self {
        Self {
            error: Some(sanitize_error_message(error)),
            status_code,
            username,
            ..Self::default()
        }
    }
}

/// Result of [`LicenseService::verify_current_license`]
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct VerifyOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    pub paid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub username: String,
}

impl VerifyOutcome {
    pub fn failed(error: &str, status_code: Option<u16>, username: String) -> Self {
        Self {
            error: Some(sanitize_error_message(error)),
            status_code,
            username,
            ..Self::default()
        }
    }
}

/// Timers for the purchase flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurchaseSettings {
    /// How long to wait for a settlement once the dialog is up
    pub timeout: Duration,
    /// How long the push channel may take to open before the dialog is shown
    pub connect_gate: Duration,
}

impl PurchaseSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            timeout: config.purchase.timeout(),
            connect_gate: config.pubsub.connect_timeout(),
        }
    }
}

/// Why a purchase ended before it reached the wait
#[derive(Debug)]
struct FlowFailure {
    message: String,
    status_code: Option<u16>,
}

impl FlowFailure {
    fn new<S: Into<String>>(message: S) -> Self {
        Self {
            message: message.into(),
            status_code: None,
        }
    }
}

impl From<ApiError> for FlowFailure {
    fn from(err: ApiError) -> Self {
        Self {
            status_code: err.status_code(),
            message: err.to_string(),
        }
    }
}

/// Aborts the wrapped task when dropped
struct TaskGuard(JoinHandle<()>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct LicenseService {
    client: Arc<PubSubClient>,
    coordinator: PendingOperationCoordinator,
    api: Arc<dyn LicenseApi>,
    identity: Arc<dyn IdentityProvider>,
    presenter: Arc<dyn PaymentPresenter>,
    signature: SignaturePolicy,
    settings: PurchaseSettings,
}

impl LicenseService {
    pub fn new(
        client: Arc<PubSubClient>,
        api: Arc<dyn LicenseApi>,
        identity: Arc<dyn IdentityProvider>,
        presenter: Arc<dyn PaymentPresenter>,
        signature: SignaturePolicy,
        settings: PurchaseSettings,
    ) -> Self {
        let coordinator = client.router().coordinator().clone();
        Self {
            client,
            coordinator,
            api,
            identity,
            presenter,
            signature,
            settings,
        }
    }

    pub fn coordinator(&self) -> &PendingOperationCoordinator {
        &self.coordinator
    }

    /// Buy `license_id` and wait for the payment to be confirmed
    pub async fn purchase_license(&self, license_id: &str) -> PurchaseOutcome {
        self.run_purchase(license_id)
            .instrument(crate::purchase_span!(license_id))
            .await
    }

    async fn run_purchase(&self, license_id: &str) -> PurchaseOutcome {
        let identity = match self.identity.current_identity().await {
            Ok(identity) => identity,
            Err(err) => {
                warn!(error = %err, "Purchase aborted: no account identity");
                return PurchaseOutcome::failed(&err.to_string(), None, String::new());
            }
        };
        let username = identity.username.clone();

        // reject before touching the shared client's identity
        let handle = match self.coordinator.begin() {
            Ok(handle) => handle,
            Err(err) => {
                warn!(error = %err, "Purchase rejected");
                return PurchaseOutcome::failed(&err.to_string(), None, username);
            }
        };

        if let Err(err) = self.open_push_channel(&identity).await {
            warn!(error = %err, "Purchase aborted: push channel could not be configured");
            return PurchaseOutcome::failed(&err.to_string(), None, username);
        }
        let _watcher = TaskGuard(self.watch_for_faults());

        match self.pay_and_wait(license_id, &identity, handle).await {
            Ok(result) => Self::outcome_for(result, username),
            Err(failure) => {
                warn!(error = %failure.message, status = ?failure.status_code, "Purchase failed");
                PurchaseOutcome::failed(&failure.message, failure.status_code, username)
            }
        }
    }

    async fn open_push_channel(
        &self,
        identity: &AccountIdentity,
    ) -> Result<(), crate::pubsub::PubSubError> {
        self.client
            .configure(&identity.account_code, &identity.device_id)
            .await?;
        self.client.connect()
    }

    /// Settle the purchase as failed on a fault that ends reconnection
    fn watch_for_faults(&self) -> JoinHandle<()> {
        let mut events = self.client.events();
        let coordinator = self.coordinator.clone();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ClientEvent::Error(fault)) if fault.is_terminal() => {
                        warn!(fault = %fault, "Push channel lost for good during purchase");
                        coordinator.settle_transport_failed(fault.to_string());
                        return;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Fault watcher lagged behind client events");
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        })
    }

    async fn pay_and_wait(
        &self,
        license_id: &str,
        identity: &AccountIdentity,
        handle: WaitHandle,
    ) -> Result<OperationResult, FlowFailure> {
        let request = PaymentRequest {
            device: identity.device_id.clone(),
        };
        let response = self
            .api
            .pay_license(license_id, &request, &identity.access_token)
            .await?;

        if !self
            .signature
            .is_trusted(&response.raw_body, response.signature.as_deref())
        {
            return Err(FlowFailure::new(INVALID_SIGNATURE));
        }

        let qr_data = response
            .body
            .qr
            .filter(|qr| !qr.trim().is_empty())
            .ok_or_else(|| FlowFailure::new("Payment response did not include a QR code"))?;
        let payment = parse_qr_string(&qr_data)
            .map_err(|e| FlowFailure::new(format!("Could not read the payment QR: {e}")))?;
        debug!(transaction = %payment.transaction_id, amount = payment.amount, "Payment QR received");

        self.client
            .wait_until_connected(self.settings.connect_gate)
            .await
            .map_err(|e| FlowFailure::new(format!("Push channel unavailable: {e}")))?;

        let prompt = PaymentPrompt {
            payment,
            qr_data,
            payment_app: PAYMENT_APP_PACKAGE.to_string(),
        };
        let dialog = DialogHandle::new(self.coordinator.clone(), handle.id());
        self.presenter
            .present(prompt, dialog)
            .await
            .map_err(|e| FlowFailure::new(e.to_string()))?;

        info!(timeout_secs = self.settings.timeout.as_secs(), "Waiting for payment confirmation");
        Ok(handle.wait(self.settings.timeout).await)
    }

    fn outcome_for(result: OperationResult, username: String) -> PurchaseOutcome {
        match result {
            OperationResult::Success { license_name } => {
                info!(license = %license_name, "License purchased");
                PurchaseOutcome::succeeded(license_name, username)
            }
            OperationResult::UserCancelled => {
                info!("Purchase cancelled by user");
                PurchaseOutcome::cancelled(username)
            }
            OperationResult::Failure { reason } => PurchaseOutcome::failed(&reason, None, username),
            OperationResult::Timeout => PurchaseOutcome::failed(
                "Timed out waiting for payment confirmation",
                None,
                username,
            ),
            OperationResult::TransportFailed { reason } => PurchaseOutcome::failed(
                &format!("Push channel failed: {reason}"),
                None,
                username,
            ),
        }
    }

    /// Look up the license currently active for `package_id`
    pub async fn verify_current_license(&self, package_id: &str) -> VerifyOutcome {
        self.run_verify(package_id)
            .instrument(crate::api_span!("verify", package_id))
            .await
    }

    async fn run_verify(&self, package_id: &str) -> VerifyOutcome {
        let identity = match self.identity.current_identity().await {
            Ok(identity) => identity,
            Err(err) => return VerifyOutcome::failed(&err.to_string(), None, String::new()),
        };
        let username = identity.username.clone();

        let request = LicenseRequest {
            package_name: package_id.to_string(),
            device: identity.device_id.clone(),
        };
        let response = match self
            .api
            .verify_license(&request, &identity.access_token)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "License verification failed");
                return VerifyOutcome::failed(&err.to_string(), err.status_code(), username);
            }
        };

        if !self
            .signature
            .is_trusted(&response.raw_body, response.signature.as_deref())
        {
            return VerifyOutcome::failed(INVALID_SIGNATURE, None, username);
        }

        let paid = response.body.has_paid_license();
        debug!(paid, "License verified");
        VerifyOutcome {
            license: Some(response.body.license),
            paid,
            error: None,
            status_code: None,
            username,
        }
    }
}
