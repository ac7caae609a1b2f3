//! Purchase and verify orchestration tests
//!
//! The push channel runs over the scripted connector; the REST API,
//! identity and dialog are mocks. Each test drives one way a purchase can
//! end.


use license_pubsub::api::{ApiError, SignaturePolicy, VerifyLicenseResponse};
use license_pubsub::identity::{AccountIdentity, IdentityError};
use license_pubsub::pubsub::PubSubClient;
use license_pubsub::purchase::{
    LicenseService, PurchaseOutcome, PurchaseSettings, PAYMENT_APP_PACKAGE,
};
use license_pubsub::testing::mocks::{
    api_response, ApiCall, MockConnector, MockLicenseApi, PresenterScript, ScriptedPresenter,
    StaticIdentityProvider, StaticVerifier,
};
use license_pubsub::transport::{TransportError, TransportErrorKind};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{new_client, test_config, DEVICE_SUBJECT, WAIT};
use tokio::task::JoinHandle;

const QR: &str = "{id_transaccion:TX-42,importe:15.0,moneda:CUP,numero_proveedor:57001,version:1}";
const LICENSE_ID: &str = "5f1c2b9e-license";

struct Harness {
    connector: MockConnector,
    client: Arc<PubSubClient>,
    api: Arc<MockLicenseApi>,
    presenter: Arc<ScriptedPresenter>,
    service: Arc<LicenseService>,
}

struct HarnessBuilder {
    script: PresenterScript,
    identity: StaticIdentityProvider,
    policy: SignaturePolicy,
    timeout: Duration,
    connect_gate: Duration,
}

impl HarnessBuilder {
    fn new() -> Self {
        Self {
            script: PresenterScript::StayOpen,
            identity: StaticIdentityProvider::sample(),
            policy: SignaturePolicy::new(None, false),
            timeout: WAIT,
            connect_gate: WAIT,
        }
    }

    fn script(mut self, script: PresenterScript) -> Self {
        self.script = script;
        self
    }

    fn identity(mut self, identity: StaticIdentityProvider) -> Self {
        self.identity = identity;
        self
    }

    fn policy(mut self, policy: SignaturePolicy) -> Self {
        self.policy = policy;
        self
    }

    fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn connect_gate(mut self, gate: Duration) -> Self {
        self.connect_gate = gate;
        self
    }

    fn build(self) -> Harness {
        let connector = MockConnector::new();
        let client = new_client(&connector, test_config().pubsub);
        let api = Arc::new(MockLicenseApi::new());
        let presenter = Arc::new(ScriptedPresenter::new(self.script));
        let service = Arc::new(LicenseService::new(
            Arc::clone(&client),
            api.clone(),
            Arc::new(self.identity),
            presenter.clone(),
            self.policy,
            PurchaseSettings {
                timeout: self.timeout,
                connect_gate: self.connect_gate,
            },
        ));

        Harness {
            connector,
            client,
            api,
            presenter,
            service,
        }
    }
}

impl Harness {
    fn start_purchase(&self) -> JoinHandle<PurchaseOutcome> {
        let service = Arc::clone(&self.service);
        tokio::spawn(async move { service.purchase_license(LICENSE_ID).await })
    }

    /// Wait until the dialog is up, then deliver `payload` on the device subject
    async fn push_when_presented(&self, payload: &str) {
        assert!(self.presenter.wait_for_prompt(WAIT).await, "dialog never shown");
        let sid = self
            .client
            .subscriptions()
            .into_iter()
            .find(|s| s.subject == DEVICE_SUBJECT)
            .expect("device subject subscribed")
            .subscription_id;
        self.connector
            .latest()
            .expect("connection open")
            .push_message(DEVICE_SUBJECT, &sid, payload);
    }
}

async fn finish(handle: JoinHandle<PurchaseOutcome>) -> PurchaseOutcome {
    tokio::time::timeout(WAIT * 2, handle)
        .await
        .expect("purchase should finish")
        .expect("purchase task panicked")
}

#[tokio::test]
async fn test_purchase_succeeds_on_license_push() {
    // Arrange
    let harness = HarnessBuilder::new().build();
    harness.api.push_qr(QR, None);

    // Act
    let purchase = harness.start_purchase();
    harness
        .push_when_presented(r#"{"type":"payment-license","message":{"name":"Pro Annual"}}"#)
        .await;
    let outcome = finish(purchase).await;

    // Assert
    assert_eq!(
        outcome,
        PurchaseOutcome::succeeded("Pro Annual".to_string(), "alice".to_string())
    );
    assert_eq!(
        harness.api.calls(),
        vec![ApiCall::Pay {
            license_uuid: LICENSE_ID.to_string(),
            request: license_pubsub::api::PaymentRequest {
                device: "dev-1".to_string()
            },
            access_token: "token-1".to_string(),
        }]
    );

    let prompt = &harness.presenter.prompts()[0];
    assert_eq!(prompt.qr_data, QR);
    assert_eq!(prompt.payment.transaction_id, "TX-42");
    assert_eq!(prompt.payment.amount, 15.0);
    assert_eq!(prompt.payment_app, PAYMENT_APP_PACKAGE);
    assert!(!harness.service.coordinator().has_pending());
}

#[tokio::test]
async fn test_purchase_fails_on_payment_failed_push() {
    let harness = HarnessBuilder::new().build();
    harness.api.push_qr(QR, None);

    let purchase = harness.start_purchase();
    harness
        .push_when_presented(r#"{"type":"payment-failed","message":{"reason":"Insufficient funds"}}"#)
        .await;
    let outcome = finish(purchase).await;

    assert!(!outcome.success);
    assert!(!outcome.cancelled);
    assert_eq!(outcome.error.as_deref(), Some("Insufficient funds"));
    assert_eq!(outcome.username, "alice");
}

#[tokio::test]
async fn test_closing_dialog_cancels_purchase() {
    let harness = HarnessBuilder::new()
        .script(PresenterScript::CloseAfter(Duration::from_millis(20)))
        .build();
    harness.api.push_qr(QR, None);

    let outcome = finish(harness.start_purchase()).await;

    assert_eq!(outcome, PurchaseOutcome::cancelled("alice".to_string()));
}

#[tokio::test]
async fn test_first_settlement_wins() {
    let harness = HarnessBuilder::new().build();
    harness.api.push_qr(QR, None);

    let purchase = harness.start_purchase();
    harness
        .push_when_presented(r#"{"type":"payment-license","message":{"name":"Pro"}}"#)
        .await;
    let outcome = finish(purchase).await;
    // a late close from the dialog changes nothing
    if let Some(dialog) = harness.presenter.dialog() {
        dialog.closed_by_user();
    }

    assert!(outcome.success);
    assert_eq!(outcome.license.as_deref(), Some("Pro"));
}

#[tokio::test]
async fn test_purchase_times_out() {
    let harness = HarnessBuilder::new()
        .timeout(Duration::from_millis(100))
        .build();
    harness.api.push_qr(QR, None);

    let outcome = finish(harness.start_purchase()).await;

    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("Timed out"));
    assert!(!harness.service.coordinator().has_pending());
}

#[tokio::test]
async fn test_pay_error_reports_status_code() {
    let harness = HarnessBuilder::new().build();
    harness.api.push_pay(Err(ApiError::Status {
        code: 403,
        message: "License not available".to_string(),
    }));

    let outcome = finish(harness.start_purchase()).await;

    assert!(!outcome.success);
    assert_eq!(outcome.status_code, Some(403));
    assert!(outcome.error.unwrap().contains("License not available"));
    assert!(harness.presenter.prompts().is_empty());
    assert!(!harness.service.coordinator().has_pending());
}

#[tokio::test]
async fn test_untrusted_signature_is_rejected() {
    let harness = HarnessBuilder::new()
        .policy(SignaturePolicy::new(
            Some(Arc::new(StaticVerifier::accepting("good-signature"))),
            true,
        ))
        .build();
    harness.api.push_qr(QR, Some("forged"));
    harness.api.push_qr(QR, None);

    let forged = finish(harness.start_purchase()).await;
    let unsigned = finish(harness.start_purchase()).await;

    for outcome in [forged, unsigned] {
        assert_eq!(outcome.error.as_deref(), Some("Invalid response signature"));
        assert_eq!(outcome.status_code, None);
    }
    assert!(harness.presenter.prompts().is_empty());
}

#[tokio::test]
async fn test_trusted_signature_proceeds() {
    let harness = HarnessBuilder::new()
        .policy(SignaturePolicy::new(
            Some(Arc::new(StaticVerifier::accepting("good-signature"))),
            true,
        ))
        .script(PresenterScript::CloseAfter(Duration::from_millis(10)))
        .build();
    harness.api.push_qr(QR, Some("good-signature"));

    let outcome = finish(harness.start_purchase()).await;

    assert!(outcome.cancelled);
    assert_eq!(harness.presenter.prompts().len(), 1);
}

#[tokio::test]
async fn test_missing_or_invalid_qr_fails() {
    let harness = HarnessBuilder::new().build();
    harness.api.push_pay(Ok(api_response(
        license_pubsub::api::PaymentResponse { qr: None },
        None,
    )));
    harness.api.push_qr("{importe:15.0,moneda:CUP}", None);

    let missing = finish(harness.start_purchase()).await;
    let invalid = finish(harness.start_purchase()).await;

    assert!(missing.error.unwrap().contains("QR"));
    assert!(invalid.error.unwrap().contains("id_transaccion"));
    assert!(harness.presenter.prompts().is_empty());
}

#[tokio::test]
async fn test_concurrent_purchase_is_rejected() {
    let harness = HarnessBuilder::new().build();
    harness.api.push_qr(QR, None);

    let first = harness.start_purchase();
    assert!(harness.presenter.wait_for_prompt(WAIT).await);

    let second = finish(harness.start_purchase()).await;
    assert!(!second.success);
    assert!(second.error.unwrap().contains("already awaiting"));

    harness
        .push_when_presented(r#"{"type":"payment-license","message":{"name":"Pro"}}"#)
        .await;
    assert!(finish(first).await.success);
}

#[tokio::test]
async fn test_rejected_purchase_leaves_subscription_alone() {
    let harness = HarnessBuilder::new().build();
    harness.api.push_qr(QR, None);
    let other_device = LicenseService::new(
        Arc::clone(&harness.client),
        harness.api.clone(),
        Arc::new(StaticIdentityProvider::new(AccountIdentity {
            account_code: "acct".to_string(),
            device_id: "dev-2".to_string(),
            access_token: "token-2".to_string(),
            username: "bob".to_string(),
        })),
        harness.presenter.clone(),
        SignaturePolicy::new(None, false),
        PurchaseSettings {
            timeout: WAIT,
            connect_gate: WAIT,
        },
    );

    let first = harness.start_purchase();
    assert!(harness.presenter.wait_for_prompt(WAIT).await);
    let rejected = other_device.purchase_license(LICENSE_ID).await;

    assert!(rejected.error.unwrap().contains("already awaiting"));
    assert_eq!(harness.client.device_subject().as_deref(), Some(DEVICE_SUBJECT));
    let subjects: Vec<String> = harness
        .client
        .subscriptions()
        .into_iter()
        .map(|s| s.subject)
        .collect();
    assert_eq!(subjects, vec![DEVICE_SUBJECT.to_string()]);

    harness
        .push_when_presented(r#"{"type":"payment-license","message":{"name":"Pro"}}"#)
        .await;
    assert!(finish(first).await.success);
}

#[tokio::test]
async fn test_terminal_transport_fault_fails_purchase() {
    let harness = HarnessBuilder::new().build();
    harness.api.push_qr(QR, None);

    let purchase = harness.start_purchase();
    assert!(harness.presenter.wait_for_prompt(WAIT).await);
    harness
        .connector
        .latest()
        .unwrap()
        .fail(TransportError::fatal(TransportErrorKind::Tls, "certificate revoked"));
    let outcome = finish(purchase).await;

    assert!(!outcome.success);
    let error = outcome.error.unwrap();
    assert!(error.contains("Push channel failed"), "{error}");
    assert!(error.contains("certificate revoked"), "{error}");
}

#[tokio::test]
async fn test_recoverable_fault_keeps_waiting() {
    let harness = HarnessBuilder::new().build();
    harness.api.push_qr(QR, None);

    let purchase = harness.start_purchase();
    assert!(harness.presenter.wait_for_prompt(WAIT).await);
    harness
        .connector
        .latest()
        .unwrap()
        .fail(TransportError::connection_reset("reset by peer"));
    assert!(harness.connector.wait_for_connections(2, WAIT).await);
    harness.client.wait_until_connected(WAIT).await.unwrap();

    harness
        .push_when_presented(r#"{"type":"payment-license","message":{"name":"Pro"}}"#)
        .await;
    assert!(finish(purchase).await.success);
}

#[tokio::test]
async fn test_push_channel_must_connect_before_dialog() {
    let harness = HarnessBuilder::new()
        .connect_gate(Duration::from_millis(150))
        .build();
    harness.connector.fail_always(Some(TransportError::fatal(
        TransportErrorKind::Handshake,
        "401 Unauthorized",
    )));
    harness.api.push_qr(QR, None);

    let outcome = finish(harness.start_purchase()).await;

    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("Push channel unavailable"));
    assert!(harness.presenter.prompts().is_empty());
    assert!(!harness.service.coordinator().has_pending());
}

#[tokio::test]
async fn test_missing_identity_fails_without_network() {
    let harness = HarnessBuilder::new()
        .identity(StaticIdentityProvider::failing(IdentityError::Missing(
            "APKLIS_ACCESS_TOKEN".to_string(),
        )))
        .build();

    let outcome = finish(harness.start_purchase()).await;

    assert!(!outcome.success);
    assert_eq!(outcome.username, "");
    assert!(outcome.error.unwrap().contains("APKLIS_ACCESS_TOKEN"));
    assert!(harness.api.calls().is_empty());
    assert_eq!(harness.connector.attempts(), 0);
}

#[tokio::test]
async fn test_presenter_failure_fails_purchase() {
    let harness = HarnessBuilder::new()
        .script(PresenterScript::Fail("no display".to_string()))
        .build();
    harness.api.push_qr(QR, None);

    let outcome = finish(harness.start_purchase()).await;

    assert!(outcome.error.unwrap().contains("no display"));
    assert!(!harness.service.coordinator().has_pending());
}

#[tokio::test]
async fn test_verify_reports_paid_license() {
    let harness = HarnessBuilder::new().build();
    harness.api.push_verify(Ok(api_response(
        VerifyLicenseResponse {
            license: "Pro Annual".to_string(),
        },
        None,
    )));

    let outcome = harness
        .service
        .verify_current_license("com.example.app")
        .await;

    assert!(outcome.paid);
    assert_eq!(outcome.license.as_deref(), Some("Pro Annual"));
    assert_eq!(outcome.error, None);
    assert_eq!(outcome.username, "alice");
    match &harness.api.calls()[0] {
        ApiCall::Verify { request, access_token } => {
            assert_eq!(request.package_name, "com.example.app");
            assert_eq!(request.device, "dev-1");
            assert_eq!(access_token, "token-1");
        }
        other => panic!("unexpected call {other:?}"),
    }
    // verification never touches the push channel
    assert_eq!(harness.connector.attempts(), 0);
}

#[tokio::test]
async fn test_verify_without_license_is_unpaid() {
    let harness = HarnessBuilder::new().build();
    harness
        .api
        .push_verify(Ok(api_response(VerifyLicenseResponse::default(), None)));

    let outcome = harness
        .service
        .verify_current_license("com.example.app")
        .await;

    assert!(!outcome.paid);
    assert_eq!(outcome.license.as_deref(), Some(""));
}

#[tokio::test]
async fn test_verify_errors_and_signatures() {
    let harness = HarnessBuilder::new()
        .policy(SignaturePolicy::new(None, true))
        .build();
    harness.api.push_verify(Err(ApiError::Status {
        code: 500,
        message: "Internal Server Error".to_string(),
    }));
    harness.api.push_verify(Ok(api_response(
        VerifyLicenseResponse {
            license: "Pro".to_string(),
        },
        None,
    )));

    let failed = harness.service.verify_current_license("pkg").await;
    let unsigned = harness.service.verify_current_license("pkg").await;

    assert_eq!(failed.status_code, Some(500));
    assert!(!failed.paid);
    assert_eq!(unsigned.error.as_deref(), Some("Invalid response signature"));
    assert!(!unsigned.paid);
    assert_eq!(unsigned.license, None);
}

#[tokio::test]
async fn test_outcome_json_shape() {
    let outcome = PurchaseOutcome::failed("HTTP 403: nope", Some(403), "alice".to_string());
    let json = serde_json::to_value(&outcome).unwrap();

    assert_eq!(
        json,
        serde_json::json!({
            "success": false,
            "paid": false,
            "cancelled": false,
            "error": "HTTP 403: nope",
            "status_code": 403,
            "username": "alice"
        })
    );
}
