//! Mock implementations for testing
//!
//! In-memory stand-ins for the socket, the license API, the identity source
//! and the payment dialog, so the client and the purchase flow can be
//! exercised without a broker or a network.

use crate::api::{
    ApiError, ApiResponse, LicenseApi, LicenseRequest, PaymentRequest, PaymentResponse,
    ResponseVerifier, VerifyLicenseResponse,
};
use crate::identity::{AccountIdentity, IdentityError, IdentityProvider};
use crate::purchase::presenter::{DialogHandle, PaymentPresenter, PaymentPrompt, PresenterError};
use crate::transport::{
    Connector, FrameSink, FrameSource, SocketEvent, TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Poll `check` until it holds or `timeout` passes
async fn poll_until<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[derive(Default)]
struct LinkState {
    written: Mutex<Vec<String>>,
    fail_writes: AtomicBool,
    fail_close: AtomicBool,
    write_gate: Option<Arc<Semaphore>>,
    closed_with: Mutex<Option<(u16, String)>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<SocketEvent>>>,
}

/// Test-side view of one connection opened through [`MockConnector`]
#[derive(Clone)]
pub struct MockLink {
    state: Arc<LinkState>,
}

impl MockLink {
    fn open(write_gate: Option<Arc<Semaphore>>, fail_close: bool) -> (Self, MockSink, MockSource) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(LinkState {
            inbound: Mutex::new(Some(tx)),
            write_gate,
            fail_close: AtomicBool::new(fail_close),
            ..LinkState::default()
        });
        (
            Self {
                state: Arc::clone(&state),
            },
            MockSink { state },
            MockSource { rx },
        )
    }

    /// Every line the client wrote, in order
    pub fn written(&self) -> Vec<String> {
        lock(&self.state.written).clone()
    }

    /// Number of written lines that start with `prefix`
    pub fn count_written(&self, prefix: &str) -> usize {
        lock(&self.state.written)
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }

    pub async fn wait_for_written(&self, prefix: &str, count: usize, timeout: Duration) -> bool {
        poll_until(timeout, || self.count_written(prefix) >= count).await
    }

    fn deliver(&self, event: SocketEvent) {
        if let Some(tx) = lock(&self.state.inbound).as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Deliver a text frame from the "server"
    pub fn push_text(&self, text: &str) {
        self.deliver(SocketEvent::Text(text.to_string()));
    }

    /// Deliver a `MSG` frame carrying `payload`
    pub fn push_message(&self, subject: &str, sid: &str, payload: &str) {
        self.push_text(&format!(
            "MSG {subject} {sid} {}\r\n{payload}\r\n",
            payload.len()
        ));
    }

    /// Server closes the socket
    pub fn close(&self, code: u16, reason: &str) {
        self.deliver(SocketEvent::Closed {
            code,
            reason: reason.to_string(),
        });
    }

    /// Socket fails underneath the client
    pub fn fail(&self, err: TransportError) {
        self.deliver(SocketEvent::Failed(err));
    }

    /// End the inbound stream without a close frame
    pub fn end(&self) {
        lock(&self.state.inbound).take();
    }

    /// Make every later write fail with a connection reset
    pub fn fail_writes(&self, fail: bool) {
        self.state.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Close frame sent by the client, if any
    pub fn closed_with(&self) -> Option<(u16, String)> {
        lock(&self.state.closed_with).clone()
    }
}

struct MockSink {
    state: Arc<LinkState>,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        if let Some(gate) = &self.state.write_gate {
            if gate.acquire().await.is_err() {
                return Err(TransportError::connection_reset("mock write gate closed"));
            }
        }
        if self.state.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::connection_reset("mock write failure"));
        }
        lock(&self.state.written).push(text);
        Ok(())
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        *lock(&self.state.closed_with) = Some((code, reason.to_string()));
        lock(&self.state.inbound).take();
        if self.state.fail_close.load(Ordering::SeqCst) {
            return Err(TransportError::connection_reset("mock close failure"));
        }
        Ok(())
    }
}

struct MockSource {
    rx: mpsc::UnboundedReceiver<SocketEvent>,
}

#[async_trait]
impl FrameSource for MockSource {
    async fn next_event(&mut self) -> Option<SocketEvent> {
        self.rx.recv().await
    }
}

#[derive(Default)]
struct ConnectorState {
    attempts: AtomicUsize,
    failures: Mutex<VecDeque<TransportError>>,
    fail_all: Mutex<Option<TransportError>>,
    write_gate: Mutex<Option<Arc<Semaphore>>>,
    fail_closes: AtomicBool,
    links: Mutex<Vec<MockLink>>,
}

/// Scripted connector. Attempts succeed unless a failure was queued.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<ConnectorState>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next attempt with `err`. Queued failures are used in order.
    pub fn fail_next(&self, err: TransportError) {
        lock(&self.state.failures).push_back(err);
    }

    /// Fail every attempt until cleared with `None`
    pub fn fail_always(&self, err: Option<TransportError>) {
        *lock(&self.state.fail_all) = err;
    }

    /// Block writes on connections opened from now on until the returned
    /// semaphore is given permits
    pub fn gate_writes(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *lock(&self.state.write_gate) = Some(Arc::clone(&gate));
        gate
    }

    /// Connections opened from now on report an error from `close`
    pub fn fail_closes(&self, fail: bool) {
        self.state.fail_closes.store(fail, Ordering::SeqCst);
    }

    /// Connection attempts so far, failed ones included
    pub fn attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    /// Successfully opened connections so far
    pub fn connections(&self) -> usize {
        lock(&self.state.links).len()
    }

    pub fn connection(&self, index: usize) -> Option<MockLink> {
        lock(&self.state.links).get(index).cloned()
    }

    pub fn latest(&self) -> Option<MockLink> {
        lock(&self.state.links).last().cloned()
    }

    pub async fn wait_for_connections(&self, count: usize, timeout: Duration) -> bool {
        poll_until(timeout, || self.connections() >= count).await
    }

    pub async fn wait_for_attempts(&self, count: usize, timeout: Duration) -> bool {
        poll_until(timeout, || self.attempts() >= count).await
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), TransportError> {
        self.state.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(err) = lock(&self.state.failures).pop_front() {
            return Err(err);
        }
        if let Some(err) = lock(&self.state.fail_all).clone() {
            return Err(err);
        }

        let gate = lock(&self.state.write_gate).clone();
        let (link, sink, source) =
            MockLink::open(gate, self.state.fail_closes.load(Ordering::SeqCst));
        lock(&self.state.links).push(link);
        Ok((Box::new(sink), Box::new(source)))
    }
}

/// Build an [`ApiResponse`] whose raw body is the JSON of `body`
pub fn api_response<T: Serialize>(body: T, signature: Option<&str>) -> ApiResponse<T> {
    let raw_body = Bytes::from(serde_json::to_vec(&body).unwrap_or_default());
    ApiResponse {
        status: 200,
        body,
        raw_body,
        signature: signature.map(str::to_string),
    }
}

/// Call recorded by [`MockLicenseApi`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    Pay {
        license_uuid: String,
        request: PaymentRequest,
        access_token: String,
    },
    Verify {
        request: LicenseRequest,
        access_token: String,
    },
}

type PayResult = Result<ApiResponse<PaymentResponse>, ApiError>;
type VerifyResult = Result<ApiResponse<VerifyLicenseResponse>, ApiError>;

/// License API with queued responses. An empty queue answers with a
/// network error.
#[derive(Default)]
pub struct MockLicenseApi {
    pay: Mutex<VecDeque<PayResult>>,
    verify: Mutex<VecDeque<VerifyResult>>,
    calls: Mutex<Vec<ApiCall>>,
}

impl MockLicenseApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_pay(&self, result: PayResult) {
        lock(&self.pay).push_back(result);
    }

    /// Queue a pay response carrying `qr`
    pub fn push_qr(&self, qr: &str, signature: Option<&str>) {
        self.push_pay(Ok(api_response(
            PaymentResponse {
                qr: Some(qr.to_string()),
            },
            signature,
        )));
    }

    pub fn push_verify(&self, result: VerifyResult) {
        lock(&self.verify).push_back(result);
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl LicenseApi for MockLicenseApi {
    async fn pay_license(
        &self,
        license_uuid: &str,
        request: &PaymentRequest,
        access_token: &str,
    ) -> PayResult {
        lock(&self.calls).push(ApiCall::Pay {
            license_uuid: license_uuid.to_string(),
            request: request.clone(),
            access_token: access_token.to_string(),
        });
        lock(&self.pay)
            .pop_front()
            .unwrap_or_else(|| Err(ApiError::Network("no scripted pay response".to_string())))
    }

    async fn verify_license(&self, request: &LicenseRequest, access_token: &str) -> VerifyResult {
        lock(&self.calls).push(ApiCall::Verify {
            request: request.clone(),
            access_token: access_token.to_string(),
        });
        lock(&self.verify)
            .pop_front()
            .unwrap_or_else(|| Err(ApiError::Network("no scripted verify response".to_string())))
    }
}

/// Identity source returning a fixed value
#[derive(Debug, Clone)]
pub struct StaticIdentityProvider {
    identity: Result<AccountIdentity, IdentityError>,
}

impl StaticIdentityProvider {
    pub fn new(identity: AccountIdentity) -> Self {
        Self {
            identity: Ok(identity),
        }
    }

    pub fn failing(err: IdentityError) -> Self {
        Self { identity: Err(err) }
    }

    /// Identity with account `acct`, device `dev-1` and user `alice`
    pub fn sample() -> Self {
        Self::new(AccountIdentity {
            account_code: "acct".to_string(),
            device_id: "dev-1".to_string(),
            access_token: "token-1".to_string(),
            username: "alice".to_string(),
        })
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn current_identity(&self) -> Result<AccountIdentity, IdentityError> {
        self.identity.clone()
    }
}

/// What [`ScriptedPresenter`] does once the dialog is shown
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenterScript {
    /// Show the dialog and leave it open
    StayOpen,
    /// User closes the dialog after the delay
    CloseAfter(Duration),
    /// The dialog cannot be shown
    Fail(String),
}

/// Records prompts and follows a fixed script
pub struct ScriptedPresenter {
    script: PresenterScript,
    prompts: Mutex<Vec<PaymentPrompt>>,
    dialog: Mutex<Option<DialogHandle>>,
}

impl ScriptedPresenter {
    pub fn new(script: PresenterScript) -> Self {
        Self {
            script,
            prompts: Mutex::new(Vec::new()),
            dialog: Mutex::new(None),
        }
    }

    pub fn prompts(&self) -> Vec<PaymentPrompt> {
        lock(&self.prompts).clone()
    }

    /// Handle of the last dialog shown
    pub fn dialog(&self) -> Option<DialogHandle> {
        lock(&self.dialog).clone()
    }

    pub async fn wait_for_prompt(&self, timeout: Duration) -> bool {
        poll_until(timeout, || !lock(&self.prompts).is_empty()).await
    }
}

#[async_trait]
impl PaymentPresenter for ScriptedPresenter {
    async fn present(&self, prompt: PaymentPrompt, dialog: DialogHandle) -> Result<(), PresenterError> {
        if let PresenterScript::Fail(reason) = &self.script {
            return Err(PresenterError::Unavailable(reason.clone()));
        }

        lock(&self.prompts).push(prompt);
        *lock(&self.dialog) = Some(dialog.clone());

        if let PresenterScript::CloseAfter(delay) = self.script {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                dialog.closed_by_user();
            });
        }
        Ok(())
    }
}

/// Accepts exactly one signature value
#[derive(Debug, Clone)]
pub struct StaticVerifier {
    accepted: String,
}

impl StaticVerifier {
    pub fn accepting(signature: &str) -> Self {
        Self {
            accepted: signature.to_string(),
        }
    }
}

impl ResponseVerifier for StaticVerifier {
    fn verify(&self, _body: &[u8], signature: &str) -> bool {
        signature == self.accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_connector_scripted_failure() {
        let connector = MockConnector::new();
        connector.fail_next(TransportError::unreachable("refused"));

        assert!(connector.connect("ws://x").await.is_err());
        assert!(connector.connect("ws://x").await.is_ok());
        assert_eq!(connector.attempts(), 2);
        assert_eq!(connector.connections(), 1);
    }

    #[tokio::test]
    async fn test_mock_link_round_trip() {
        let connector = MockConnector::new();
        let (mut sink, mut source) = connector.connect("ws://x").await.unwrap();
        let link = connector.latest().unwrap();

        sink.send_text("PING\r\n".to_string()).await.unwrap();
        assert_eq!(link.written(), vec!["PING\r\n".to_string()]);

        link.push_text("PONG\r\n");
        assert_eq!(
            source.next_event().await,
            Some(SocketEvent::Text("PONG\r\n".to_string()))
        );

        link.fail_writes(true);
        assert!(sink.send_text("x".to_string()).await.is_err());

        link.end();
        assert_eq!(source.next_event().await, None);
    }

    #[tokio::test]
    async fn test_mock_api_records_calls() {
        let api = MockLicenseApi::new();
        api.push_qr("qr-data", None);

        let request = PaymentRequest {
            device: "dev".to_string(),
        };
        assert!(api.pay_license("lic", &request, "tok").await.is_ok());
        assert!(api.pay_license("lic", &request, "tok").await.is_err());
        assert_eq!(api.calls().len(), 2);
    }
}
