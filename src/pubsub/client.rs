//! Reconnecting pub/sub client for the push channel
//!
//! Owns the socket lifecycle: the `CONNECT`/`SUB` handshake, replaying
//! subscriptions after a reconnect, periodic `PING`s, an ordered outbound
//! queue while offline, and capped exponential backoff.
//!
//! All socket writes go through one async mutex ([`LinkSlot`]) so the
//! handshake, the queue flush and later sends never interleave. Control
//! state sits behind a std mutex that is never held across an await.
//! Every connection attempt gets a fresh generation number and anything
//! reported by an older generation is ignored.

use super::connection::{
    ClientEvent, ClientFault, ConnectionPhase, ConnectionState, PubSubError, ReconnectConfig,
    ReconnectState, SendOutcome, Subscription,
};
use super::health_monitor::{HealthMetrics, HealthMonitor, PhaseEvent, ReconnectionDecision};
use super::router::SubscriptionRouter;
use crate::config::PubSubSection;
use crate::protocol::{
    device_subject, validate_subject_token, InboundFrame, ProtocolCodec, SubjectError,
};
use crate::transport::{
    Connector, FrameSink, FrameSource, SocketEvent, TransportError, ABNORMAL_CLOSURE,
    NORMAL_CLOSURE,
};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

const EVENT_CHANNEL_CAPACITY: usize = 64;
/// Missed ping intervals before the link is reported unhealthy
const STALE_PING_INTERVALS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
struct DeviceIdentity {
    account_code: String,
    device_id: String,
    subject: String,
}

/// Write side of the current connection plus the offline queue
#[derive(Default)]
struct LinkSlot {
    sink: Option<Box<dyn FrameSink>>,
    generation: u64,
    open: bool,
    /// Lines accepted while offline, flushed in order on the next open
    pending: VecDeque<String>,
    /// Subscription ids already sent on this connection
    subscribed: HashSet<String>,
}

#[derive(Default)]
struct Control {
    phase: ConnectionPhase,
    generation: u64,
    reconnect: ReconnectState,
    shutdown: bool,
    reader: Option<JoinHandle<()>>,
    pinger: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
    connected_at: Option<Instant>,
    last_frame_at: Option<Instant>,
    opened_once: bool,
    reconnect_count: u32,
}

impl Control {
    fn transition(&mut self, event: PhaseEvent) {
        let next = HealthMonitor::next_phase(self.phase, &event);
        HealthMonitor::log_state_transition(self.phase, next, &event);
        self.phase = next;
    }

    fn begin_attempt(&mut self) -> u64 {
        self.generation += 1;
        self.transition(PhaseEvent::ConnectRequested);
        self.generation
    }

    /// Stop the reader and pinger. The task named by `origin` is the caller
    /// and is only forgotten, never aborted.
    fn stop_tasks(&mut self, origin: TaskOrigin) {
        if let Some(reader) = self.reader.take() {
            if origin != TaskOrigin::Reader {
                reader.abort();
            }
        }
        if let Some(pinger) = self.pinger.take() {
            if origin != TaskOrigin::Pinger {
                pinger.abort();
            }
        }
        self.connected_at = None;
    }

    fn cancel_retry(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOrigin {
    Reader,
    Pinger,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InboundAction {
    Continue,
    /// Server reported a stale session
    Restart,
    /// The link was torn down while handling the frame
    Stop,
}

struct Shared {
    config: PubSubSection,
    reconnect_config: ReconnectConfig,
    connector: Arc<dyn Connector>,
    router: Arc<SubscriptionRouter>,
    identity: StdMutex<Option<DeviceIdentity>>,
    control: StdMutex<Control>,
    link: Mutex<LinkSlot>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ClientEvent>,
}

/// Pub/sub client. Share it behind an `Arc`; dropping it stops every task.
pub struct PubSubClient {
    shared: Arc<Shared>,
}

impl PubSubClient {
    pub fn new(
        config: PubSubSection,
        connector: Arc<dyn Connector>,
        router: Arc<SubscriptionRouter>,
    ) -> Result<Self, PubSubError> {
        let url = url::Url::parse(&config.url)
            .map_err(|e| PubSubError::InvalidUrl(format!("{}: {e}", config.url)))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(PubSubError::InvalidUrl(format!(
                "{}: scheme must be ws or wss",
                config.url
            )));
        }
        validate_subject_token(&config.namespace)?;
        let reconnect_config = ReconnectConfig::from_section(&config.reconnect)?;

        let (state_tx, _) = watch::channel(ConnectionState::initial());
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                reconnect_config,
                connector,
                router,
                identity: StdMutex::new(None),
                control: StdMutex::new(Control::default()),
                link: Mutex::new(LinkSlot::default()),
                state_tx,
                events_tx,
            }),
        })
    }

    /// Set the device identity and register its subject.
    ///
    /// Returns the subject. Changing identity while connected moves the
    /// subscription to the new subject.
    pub async fn configure(
        &self,
        account_code: &str,
        device_id: &str,
    ) -> Result<String, PubSubError> {
        let subject = device_subject(&self.shared.config.namespace, account_code, device_id)?;
        let identity = DeviceIdentity {
            account_code: account_code.to_string(),
            device_id: device_id.to_string(),
            subject: subject.clone(),
        };

        let previous = {
            let mut slot = lock(&self.shared.identity);
            slot.replace(identity)
        };
        self.shared.control().shutdown = false;

        if let Some(previous) = previous.filter(|p| p.subject != subject) {
            debug!(old = %previous.subject, "Device identity changed");
            self.unsubscribe(&previous.subject).await;
        }
        self.subscribe(&subject).await?;

        info!(subject = %subject, "Pub/sub client configured");
        Ok(subject)
    }

    /// Start connecting in the background.
    ///
    /// No-op while connected, connecting or retrying. Resets the retry
    /// counter.
    pub fn connect(&self) -> Result<(), PubSubError> {
        if lock(&self.shared.identity).is_none() {
            return Err(PubSubError::NotConfigured);
        }

        let generation = {
            let mut control = self.shared.control();
            if matches!(
                control.phase,
                ConnectionPhase::Connected | ConnectionPhase::Connecting
            ) {
                debug!(phase = %control.phase, "Connect ignored");
                return Ok(());
            }
            if control.reconnect.in_progress {
                debug!("Connect ignored; reconnection already in progress");
                return Ok(());
            }
            control.shutdown = false;
            control.reconnect = ReconnectState::default();
            control.begin_attempt()
        };

        tokio::spawn(Arc::clone(&self.shared).run_attempt(generation));
        Ok(())
    }

    /// Operator-triggered reconnect after the settling delay.
    ///
    /// Ignored while connected or while a reconnection is already under way.
    pub async fn reconnect(&self) {
        let delay = self.shared.config.manual_reconnect_delay();
        let stale_generation = {
            let mut control = self.shared.control();
            if control.phase == ConnectionPhase::Connected {
                debug!("Reconnect ignored; already connected");
                return;
            }
            if control.reconnect.in_progress {
                debug!("Reconnect ignored; reconnection already in progress");
                return;
            }

            info!(delay_ms = delay.as_millis() as u64, "Manual reconnection requested");
            let stale = control.generation;
            control.shutdown = false;
            control.generation += 1;
            control.stop_tasks(TaskOrigin::External);
            control.cancel_retry();
            control.reconnect = ReconnectState {
                attempt: 0,
                in_progress: true,
            };
            control.phase = ConnectionPhase::Disconnected;
            let token = control.generation;
            control.retry_timer = Some(self.shared.spawn_retry(delay, token));
            stale
        };

        if let Some(mut sink) = self.shared.detach_link(stale_generation).await {
            if let Err(err) = sink.close(NORMAL_CLOSURE, "Manual reconnect").await {
                debug!(error = %err, "Close frame not delivered");
            }
        }
    }

    /// Close the connection for good; no reconnection follows.
    ///
    /// Queued lines are discarded.
    pub async fn disconnect(&self) {
        let generation = {
            let mut control = self.shared.control();
            control.shutdown = true;
            control.generation += 1;
            control.stop_tasks(TaskOrigin::External);
            control.cancel_retry();
            control.reconnect = ReconnectState::default();
            control.transition(PhaseEvent::CloseRequested);
            control.generation
        };

        let sink = {
            let mut link = self.shared.link.lock().await;
            link.open = false;
            link.subscribed.clear();
            let dropped = link.pending.len();
            link.pending.clear();
            if dropped > 0 {
                debug!(dropped, "Discarded queued lines");
            }
            link.sink.take()
        };
        if let Some(mut sink) = sink {
            if let Err(err) = sink.close(NORMAL_CLOSURE, "User requested disconnect").await {
                debug!(error = %err, "Close frame not delivered");
            }
        }

        {
            let mut control = self.shared.control();
            if control.generation == generation {
                control.transition(PhaseEvent::Closed {
                    code: NORMAL_CLOSURE,
                });
            }
        }
        self.shared.publish_disconnected(None);
        self.shared.emit(ClientEvent::Disconnected {
            reason: Some("client disconnect".to_string()),
        });
        info!("Pub/sub client disconnected");
    }

    /// Send a raw protocol line, queueing it while offline
    pub async fn send<S: Into<String>>(&self, line: S) -> SendOutcome {
        let line = line.into();
        let mut link = self.shared.link.lock().await;

        if link.open {
            let generation = link.generation;
            if let Some(sink) = link.sink.as_mut() {
                let result = sink.send_text(line.clone()).await;
                match result {
                    Ok(()) => return SendOutcome::Written,
                    Err(err) => {
                        link.pending.push_back(line);
                        drop(link);
                        warn!(error = %err, "Send failed; line kept for the next connection");
                        self.shared
                            .handle_failure(generation, err, TaskOrigin::External)
                            .await;
                        return SendOutcome::Queued;
                    }
                }
            }
        }

        link.pending.push_back(line);
        debug!(queued = link.pending.len(), "Not connected; line queued");
        SendOutcome::Queued
    }

    /// Subscribe to `subject`. Idempotent.
    ///
    /// While offline the subscription is only recorded; the next handshake
    /// sends it.
    pub async fn subscribe(&self, subject: &str) -> Result<Subscription, PubSubError> {
        validate_subject(subject)?;
        let (subscription, created) = self.shared.router.register(subject);
        if created {
            debug!(subject, sid = %subscription.subscription_id, "Subscribed");
        }

        let mut link = self.shared.link.lock().await;
        if link.open && !link.subscribed.contains(&subscription.subscription_id) {
            let line =
                ProtocolCodec::encode_subscribe(&subscription.subject, &subscription.subscription_id);
            let generation = link.generation;
            if let Some(sink) = link.sink.as_mut() {
                let result = sink.send_text(line).await;
                match result {
                    Ok(()) => {
                        link.subscribed
                            .insert(subscription.subscription_id.clone());
                    }
                    Err(err) => {
                        drop(link);
                        self.shared
                            .handle_failure(generation, err, TaskOrigin::External)
                            .await;
                    }
                }
            }
        }

        Ok(subscription)
    }

    /// Drop a subscription, sending `UNSUB` when connected
    pub async fn unsubscribe(&self, subject: &str) -> Option<Subscription> {
        let subscription = self.shared.router.unregister(subject)?;

        let mut link = self.shared.link.lock().await;
        if link.open && link.subscribed.remove(&subscription.subscription_id) {
            let generation = link.generation;
            if let Some(sink) = link.sink.as_mut() {
                let result = sink
                    .send_text(ProtocolCodec::encode_unsubscribe(&subscription.subscription_id))
                    .await;
                if let Err(err) = result {
                    drop(link);
                    self.shared
                        .handle_failure(generation, err, TaskOrigin::External)
                        .await;
                }
            }
        }

        debug!(subject, "Unsubscribed");
        Some(subscription)
    }

    /// Wait until the connection is open
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<(), PubSubError> {
        let mut rx = self.shared.state_tx.subscribe();
        let wait = async {
            loop {
                if rx.borrow_and_update().connected {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(true) => Ok(()),
            _ => Err(PubSubError::ConnectTimeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events_tx.subscribe()
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.shared.control().phase
    }

    pub fn is_connected(&self) -> bool {
        HealthMonitor::can_send(self.phase())
    }

    pub fn is_reconnecting(&self) -> bool {
        self.shared.control().reconnect.in_progress
    }

    /// Consecutive failed attempts since the last successful open
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.control().reconnect.attempt
    }

    pub async fn pending_len(&self) -> usize {
        self.shared.link.lock().await.pending.len()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.shared.router.subscriptions()
    }

    /// Subject built from the configured identity
    pub fn device_subject(&self) -> Option<String> {
        lock(&self.shared.identity)
            .as_ref()
            .map(|identity| identity.subject.clone())
    }

    pub fn router(&self) -> &Arc<SubscriptionRouter> {
        &self.shared.router
    }

    pub fn health_metrics(&self) -> HealthMetrics {
        let stale_after = self.shared.config.ping_interval() * STALE_PING_INTERVALS;
        let control = self.shared.control();
        HealthMonitor::calculate_health_metrics(
            control.connected_at,
            control.last_frame_at,
            control.reconnect_count,
            stale_after,
        )
    }
}

impl Drop for PubSubClient {
    fn drop(&mut self) {
        let mut control = self.shared.control();
        control.shutdown = true;
        control.generation += 1;
        control.stop_tasks(TaskOrigin::External);
        control.cancel_retry();
    }
}

impl Shared {
    fn control(&self) -> MutexGuard<'_, Control> {
        lock(&self.control)
    }

    fn emit(&self, event: ClientEvent) {
        // no subscribers is fine
        let _ = self.events_tx.send(event);
    }

    fn publish_disconnected(&self, error: Option<String>) {
        let next = {
            let current = self.state_tx.borrow();
            ConnectionState::disconnected(&current, error)
        };
        self.state_tx.send_replace(next);
    }

    fn record_activity(&self) {
        self.control().last_frame_at = Some(Instant::now());
        let next = {
            let current = self.state_tx.borrow();
            ConnectionState::touched(&current)
        };
        self.state_tx.send_replace(next);
    }

    async fn run_attempt(self: Arc<Self>, generation: u64) {
        let span = crate::pubsub_span!(generation, url = %self.config.url);
        self.attempt(generation).instrument(span).await
    }

    async fn attempt(self: Arc<Self>, generation: u64) {
        let timeout = self.config.connect_timeout();
        debug!("Opening pub/sub connection");

        let connected = tokio::time::timeout(timeout, self.connector.connect(&self.config.url)).await;
        match connected {
            Ok(Ok((sink, source))) => self.handle_open(generation, sink, source).await,
            Ok(Err(err)) => {
                self.handle_failure(generation, err, TaskOrigin::External)
                    .await
            }
            Err(_) => {
                let err = TransportError::timeout(format!(
                    "no connection within {}ms",
                    timeout.as_millis()
                ));
                self.handle_failure(generation, err, TaskOrigin::External)
                    .await
            }
        }
    }

    async fn handle_open(
        self: &Arc<Self>,
        generation: u64,
        mut sink: Box<dyn FrameSink>,
        source: Box<dyn FrameSource>,
    ) {
        let mut link = self.link.lock().await;
        if !self.is_current(generation) {
            drop(link);
            debug!(generation, "Discarding superseded connection");
            if let Err(err) = sink.close(NORMAL_CLOSURE, "superseded").await {
                debug!(error = %err, "Close frame not delivered");
            }
            return;
        }

        let subscriptions = self.router.subscriptions();
        let mut handshake = Vec::with_capacity(subscriptions.len() + 1);
        handshake.push(ProtocolCodec::encode_connect(&self.config.connect_options()));
        handshake.extend(
            subscriptions
                .iter()
                .map(|s| ProtocolCodec::encode_subscribe(&s.subject, &s.subscription_id)),
        );

        for line in handshake {
            let result = sink.send_text(line).await;
            if let Err(err) = result {
                drop(link);
                self.handle_failure(generation, err, TaskOrigin::External)
                    .await;
                return;
            }
        }

        let mut flushed = 0usize;
        while let Some(line) = link.pending.front().cloned() {
            let result = sink.send_text(line).await;
            if let Err(err) = result {
                drop(link);
                warn!(flushed, error = %err, "Queue flush failed");
                self.handle_failure(generation, err, TaskOrigin::External)
                    .await;
                return;
            }
            link.pending.pop_front();
            flushed += 1;
        }
        if flushed > 0 {
            debug!(flushed, "Flushed queued lines");
        }

        link.sink = Some(sink);
        link.generation = generation;
        link.open = true;
        link.subscribed = subscriptions
            .into_iter()
            .map(|s| s.subscription_id)
            .collect();

        let superseded = {
            let mut control = self.control();
            if control.generation != generation {
                true
            } else {
                control.transition(PhaseEvent::Opened);
                control.reconnect = ReconnectState::default();
                // the retry timer that ran this attempt has finished
                control.retry_timer = None;
                control.connected_at = Some(Instant::now());
                control.last_frame_at = None;
                if control.opened_once {
                    control.reconnect_count += 1;
                }
                control.opened_once = true;
                control.reader = Some(tokio::spawn(Arc::clone(self).read_loop(generation, source)));
                control.pinger = Some(tokio::spawn(Arc::clone(self).ping_loop(generation)));
                false
            }
        };

        if superseded {
            link.open = false;
            link.subscribed.clear();
            let stale = link.sink.take();
            drop(link);
            if let Some(mut sink) = stale {
                if let Err(err) = sink.close(NORMAL_CLOSURE, "superseded").await {
                    debug!(error = %err, "Close frame not delivered");
                }
            }
            return;
        }
        drop(link);

        self.state_tx.send_replace(ConnectionState::connected());
        self.emit(ClientEvent::Connected);
    }

    async fn read_loop(self: Arc<Self>, generation: u64, mut source: Box<dyn FrameSource>) {
        while let Some(event) = source.next_event().await {
            let action = match event {
                SocketEvent::Text(text) => self.handle_inbound(generation, text.as_bytes()).await,
                SocketEvent::Binary(bytes) => self.handle_inbound(generation, &bytes).await,
                SocketEvent::Closed { code, reason } => {
                    self.handle_close(generation, code, reason, TaskOrigin::Reader)
                        .await;
                    return;
                }
                SocketEvent::Failed(err) => {
                    self.handle_failure(generation, err, TaskOrigin::Reader)
                        .await;
                    return;
                }
            };

            match action {
                InboundAction::Continue => {}
                InboundAction::Restart => {
                    self.restart_now(generation).await;
                    return;
                }
                InboundAction::Stop => return,
            }
        }

        self.handle_close(
            generation,
            ABNORMAL_CLOSURE,
            "stream ended".to_string(),
            TaskOrigin::Reader,
        )
        .await;
    }

    async fn handle_inbound(self: &Arc<Self>, generation: u64, raw: &[u8]) -> InboundAction {
        self.record_activity();

        match ProtocolCodec::decode_frame(raw) {
            Ok(InboundFrame::Message(frame)) => {
                let route = self.router.handle(&frame);
                debug!(subject = %frame.subject, ?route, "Push message routed");
            }
            Ok(InboundFrame::Ping) => {
                if !self
                    .write_line(generation, ProtocolCodec::encode_pong(), TaskOrigin::Reader)
                    .await
                {
                    return InboundAction::Stop;
                }
            }
            Ok(InboundFrame::Pong) => debug!("PONG received"),
            Ok(InboundFrame::Info(info)) => debug!(info = %info, "Server INFO"),
            Ok(InboundFrame::Ack) => debug!("+OK received"),
            Ok(InboundFrame::Error(text)) => {
                if ProtocolCodec::is_stale_connection(&text) {
                    warn!(error = %text, "Server reports a stale connection");
                    return InboundAction::Restart;
                }
                warn!(error = %text, "Server error frame");
            }
            Err(err) => warn!(error = %err, "Ignoring malformed frame"),
        }

        InboundAction::Continue
    }

    async fn ping_loop(self: Arc<Self>, generation: u64) {
        let period = self.config.ping_interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            ticker.tick().await;
            if !self
                .write_line(generation, ProtocolCodec::encode_ping(), TaskOrigin::Pinger)
                .await
            {
                return;
            }
            debug!("PING sent");
        }
    }

    /// Write on the current link. False if the link is gone or the write
    /// failed, in which case the failure path has already run.
    async fn write_line(self: &Arc<Self>, generation: u64, line: String, origin: TaskOrigin) -> bool {
        let mut link = self.link.lock().await;
        if !link.open || link.generation != generation {
            return false;
        }
        let Some(sink) = link.sink.as_mut() else {
            return false;
        };

        let result = sink.send_text(line).await;
        match result {
            Ok(()) => true,
            Err(err) => {
                drop(link);
                self.handle_failure(generation, err, origin).await;
                false
            }
        }
    }

    async fn handle_failure(self: &Arc<Self>, generation: u64, err: TransportError, origin: TaskOrigin) {
        let shutdown = {
            let mut control = self.control();
            if control.generation != generation {
                debug!(generation, error = %err, "Ignoring failure from superseded connection");
                return;
            }
            control.generation += 1;
            control.stop_tasks(origin);
            control.reconnect.in_progress = false;
            control.transition(PhaseEvent::Failed(err.to_string()));
            control.shutdown
        };

        drop(self.detach_link(generation).await);
        self.publish_disconnected(Some(err.to_string()));
        self.emit(ClientEvent::Error(ClientFault::from_transport(err.clone())));

        if shutdown {
            return;
        }
        if err.is_recoverable() {
            self.schedule_reconnect(&err.to_string());
        } else {
            error!(error = %err, "Non-recoverable transport failure; not reconnecting");
        }
    }

    async fn handle_close(self: &Arc<Self>, generation: u64, code: u16, reason: String, origin: TaskOrigin) {
        let shutdown = {
            let mut control = self.control();
            if control.generation != generation {
                return;
            }
            control.generation += 1;
            control.stop_tasks(origin);
            control.transition(PhaseEvent::Closed { code });
            control.shutdown
        };

        drop(self.detach_link(generation).await);
        let normal = code == NORMAL_CLOSURE;
        let description = format!("connection closed ({code}): {reason}");
        self.publish_disconnected((!normal).then(|| description.clone()));
        self.emit(ClientEvent::Disconnected {
            reason: Some(description.clone()),
        });

        if normal {
            info!(reason = %reason, "Server closed the connection normally");
        } else if !shutdown {
            self.schedule_reconnect(&description);
        }
    }

    /// Close a session the server declared stale and reconnect at once
    async fn restart_now(self: &Arc<Self>, generation: u64) {
        {
            let mut control = self.control();
            if control.generation != generation || control.shutdown {
                return;
            }
            control.generation += 1;
            control.stop_tasks(TaskOrigin::Reader);
            control.cancel_retry();
            control.transition(PhaseEvent::Closed {
                code: NORMAL_CLOSURE,
            });
            control.reconnect.in_progress = true;
            let token = control.generation;
            control.retry_timer = Some(self.spawn_retry(Duration::ZERO, token));
        }

        if let Some(mut sink) = self.detach_link(generation).await {
            if let Err(err) = sink.close(NORMAL_CLOSURE, "Stale connection").await {
                debug!(error = %err, "Close frame not delivered");
            }
        }
        self.publish_disconnected(Some("stale connection".to_string()));
        self.emit(ClientEvent::Disconnected {
            reason: Some("stale connection reported by server".to_string()),
        });
    }

    fn schedule_reconnect(self: &Arc<Self>, reason: &str) {
        let exhausted = {
            let mut control = self.control();
            let decision = HealthMonitor::should_attempt_reconnection(
                control.reconnect.attempt,
                &self.reconnect_config,
                control.shutdown,
            );

            match decision {
                ReconnectionDecision::Proceed { attempt, delay_ms } => {
                    debug!(reason, "Reconnect triggered");
                    control.reconnect = ReconnectState {
                        attempt,
                        in_progress: true,
                    };
                    control.transition(PhaseEvent::RetryScheduled { attempt, delay_ms });
                    control.cancel_retry();
                    let token = control.generation;
                    control.retry_timer =
                        Some(self.spawn_retry(Duration::from_millis(delay_ms), token));
                    None
                }
                ReconnectionDecision::AbortShutdownRequested => {
                    control.reconnect.in_progress = false;
                    None
                }
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    let attempts = control.reconnect.attempt;
                    control.reconnect.in_progress = false;
                    control.transition(PhaseEvent::RetryExhausted { attempts });
                    Some(attempts)
                }
            }
        };

        if let Some(attempts) = exhausted {
            self.publish_disconnected(Some(
                PubSubError::RetryExhausted { attempts }.to_string(),
            ));
            self.emit(ClientEvent::Error(ClientFault::RetryExhausted { attempts }));
        }
    }

    fn spawn_retry(self: &Arc<Self>, delay: Duration, token: u64) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).retry_after(delay, token))
    }

    async fn retry_after(self: Arc<Self>, delay: Duration, token: u64) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let generation = {
            let mut control = self.control();
            if control.shutdown || control.generation != token {
                debug!(token, "Retry superseded");
                return;
            }
            if control.phase == ConnectionPhase::Connected {
                return;
            }
            control.retry_timer = None;
            control.begin_attempt()
        };

        self.run_attempt(generation).await;
    }

    fn is_current(&self, generation: u64) -> bool {
        let control = self.control();
        control.generation == generation && !control.shutdown
    }

    /// Take the sink if it still belongs to `generation`
    async fn detach_link(&self, generation: u64) -> Option<Box<dyn FrameSink>> {
        let mut link = self.link.lock().await;
        if link.generation != generation {
            return None;
        }
        link.open = false;
        link.subscribed.clear();
        link.sink.take()
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Subjects passed to `subscribe` may contain wildcards but no whitespace
fn validate_subject(subject: &str) -> Result<(), SubjectError> {
    if subject.is_empty() || subject.split('.').any(str::is_empty) {
        return Err(SubjectError::EmptyToken);
    }
    match subject.chars().find(|c| c.is_whitespace() || c.is_control()) {
        Some(c) => Err(SubjectError::InvalidTokenChar(c)),
        None => Ok(()),
    }
}
