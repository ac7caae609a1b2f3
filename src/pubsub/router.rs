//! Routes decoded `MSG` frames to the pending purchase
//!
//! The router owns the subscription table and is purely reactive: it
//! decodes push payloads, settles the pending operation when a payment
//! message arrives and optionally forwards every decoded message to an
//! observer. Nothing here retries or surfaces errors to the client.

use super::connection::Subscription;
use crate::protocol::{MessageFrame, ProtocolCodec, PushMessage};
use crate::purchase::coordinator::{PendingOperationCoordinator, SettleOutcome};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// A decoded push message together with the subject it arrived on
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutedMessage {
    pub subject: String,
    pub message: PushMessage,
}

/// What the router did with a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageRoute {
    PaymentCompleted { license_name: String },
    PaymentFailed { reason: String },
    /// Decoded, but no handler for this message type
    Unhandled { kind: &'static str },
    NotJson,
    Undecodable(String),
    /// Frame for a subject we never subscribed to
    UnknownSubject,
}

pub struct SubscriptionRouter {
    subscriptions: Mutex<Vec<Subscription>>,
    coordinator: PendingOperationCoordinator,
    forwarder: Mutex<Option<mpsc::Sender<RoutedMessage>>>,
}

impl SubscriptionRouter {
    pub fn new(coordinator: PendingOperationCoordinator) -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
            coordinator,
            forwarder: Mutex::new(None),
        }
    }

    pub fn coordinator(&self) -> &PendingOperationCoordinator {
        &self.coordinator
    }

    /// Forward every decoded push message to `sender`.
    ///
    /// Delivery never blocks the socket reader; messages are dropped when
    /// the observer falls behind.
    pub fn set_message_sender(&self, sender: mpsc::Sender<RoutedMessage>) {
        *lock(&self.forwarder) = Some(sender);
    }

    /// Register `subject`, returning its subscription and whether it is new.
    ///
    /// Registering an existing subject keeps its subscription id.
    pub fn register(&self, subject: &str) -> (Subscription, bool) {
        let mut subscriptions = lock(&self.subscriptions);
        if let Some(existing) = subscriptions.iter().find(|s| s.subject == subject) {
            return (existing.clone(), false);
        }

        let subscription_id = loop {
            let candidate = ProtocolCodec::generate_subscription_id();
            if !subscriptions.iter().any(|s| s.subscription_id == candidate) {
                break candidate;
            }
        };

        let subscription = Subscription {
            subject: subject.to_string(),
            subscription_id,
        };
        debug!(subject, sid = %subscription.subscription_id, "Subscription registered");
        subscriptions.push(subscription.clone());
        (subscription, true)
    }

    pub fn unregister(&self, subject: &str) -> Option<Subscription> {
        let mut subscriptions = lock(&self.subscriptions);
        let index = subscriptions.iter().position(|s| s.subject == subject)?;
        Some(subscriptions.remove(index))
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        lock(&self.subscriptions).clone()
    }

    pub fn is_registered(&self, subject: &str) -> bool {
        lock(&self.subscriptions)
            .iter()
            .any(|s| s.subject == subject)
    }

    /// Decode a push payload. Fails with the route describing why.
    pub fn decode_push(payload: &[u8]) -> Result<PushMessage, MessageRoute> {
        let text = std::str::from_utf8(payload).map_err(|_| MessageRoute::NotJson)?;
        if !ProtocolCodec::is_likely_json(text) {
            return Err(MessageRoute::NotJson);
        }
        serde_json::from_str(text).map_err(|e| MessageRoute::Undecodable(e.to_string()))
    }

    /// Route for an already decoded message
    pub fn route_for(message: &PushMessage) -> MessageRoute {
        match message {
            PushMessage::PaymentLicense { message } if message.name.trim().is_empty() => {
                MessageRoute::Undecodable("payment-license without a license name".to_string())
            }
            PushMessage::PaymentLicense { message } => MessageRoute::PaymentCompleted {
                license_name: message.name.clone(),
            },
            PushMessage::PaymentFailed { message } => MessageRoute::PaymentFailed {
                reason: if message.reason.trim().is_empty() {
                    "Payment failed".to_string()
                } else {
                    message.reason.clone()
                },
            },
            other => MessageRoute::Unhandled { kind: other.kind() },
        }
    }

    /// Handle one inbound `MSG` frame
    pub fn handle(&self, frame: &MessageFrame) -> MessageRoute {
        if !self.is_registered(&frame.subject) {
            warn!(subject = %frame.subject, sid = %frame.subscription_id, "Message for unknown subject dropped");
            return MessageRoute::UnknownSubject;
        }

        let message = match Self::decode_push(&frame.payload) {
            Ok(message) => message,
            Err(route) => {
                warn!(subject = %frame.subject, bytes = frame.payload.len(), ?route, "Dropping push payload");
                return route;
            }
        };

        let route = Self::route_for(&message);
        match &route {
            MessageRoute::PaymentCompleted { license_name } => {
                info!(license = %license_name, "Payment confirmed by push message");
                self.report_settlement(self.coordinator.settle_success(license_name.as_str()));
            }
            MessageRoute::PaymentFailed { reason } => {
                warn!(reason = %reason, "Payment rejected by push message");
                self.report_settlement(self.coordinator.settle_failure(reason.as_str()));
            }
            MessageRoute::Unhandled { kind } => {
                debug!(kind, "No handler for push message type");
            }
            other => {
                warn!(route = ?other, "Dropping push message");
            }
        }

        self.forward(RoutedMessage {
            subject: frame.subject.clone(),
            message,
        });
        route
    }

    fn report_settlement(&self, outcome: SettleOutcome) {
        if outcome == SettleOutcome::NoPendingOperation {
            debug!("Push message arrived with no purchase waiting");
        }
    }

    fn forward(&self, routed: RoutedMessage) {
        let sender = lock(&self.forwarder).clone();
        let Some(sender) = sender else {
            return;
        };

        match sender.try_send(routed) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                warn!(kind = dropped.message.kind(), "Message observer is behind; dropping");
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Message observer gone; removing forwarder");
                *lock(&self.forwarder) = None;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    const SUBJECT: &str = "APKLIS_DEVICES_TEST.acct.dev";

    fn frame(subject: &str, payload: &str) -> MessageFrame {
        MessageFrame {
            subject: subject.to_string(),
            subscription_id: "12345".to_string(),
            reply_to: None,
            payload: Bytes::from(payload.to_string()),
        }
    }

    fn router() -> SubscriptionRouter {
        let router = SubscriptionRouter::new(PendingOperationCoordinator::new());
        router.register(SUBJECT);
        router
    }

    #[test]
    fn test_register_is_idempotent() {
        let router = SubscriptionRouter::new(PendingOperationCoordinator::new());

        let (first, created) = router.register(SUBJECT);
        assert!(created);
        let (second, created) = router.register(SUBJECT);
        assert!(!created);

        assert_eq!(first, second);
        assert_eq!(router.subscriptions().len(), 1);
    }

    #[test]
    fn test_unregister() {
        let router = router();
        assert!(router.unregister(SUBJECT).is_some());
        assert!(router.unregister(SUBJECT).is_none());
        assert!(router.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_payment_license_settles_success() {
        let router = router();
        let handle = router.coordinator().begin().unwrap();

        let route = router.handle(&frame(
            SUBJECT,
            r#"{"type":"payment-license","message":{"name":"Pro"}}"#,
        ));

        assert_eq!(
            route,
            MessageRoute::PaymentCompleted {
                license_name: "Pro".to_string()
            }
        );
        let result = handle.wait(Duration::from_secs(1)).await;
        assert_eq!(
            result,
            crate::purchase::coordinator::OperationResult::Success {
                license_name: "Pro".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_payment_failed_settles_failure() {
        let router = router();
        let handle = router.coordinator().begin().unwrap();

        router.handle(&frame(
            SUBJECT,
            r#"{"type":"payment-failed","message":{"reason":"insufficient funds"}}"#,
        ));

        let result = handle.wait(Duration::from_secs(1)).await;
        assert_eq!(
            result,
            crate::purchase::coordinator::OperationResult::Failure {
                reason: "insufficient funds".to_string()
            }
        );
    }

    #[test]
    fn test_unusable_payloads_are_dropped_without_settling() {
        let router = router();
        let _handle = router.coordinator().begin().unwrap();

        assert_eq!(router.handle(&frame(SUBJECT, "hello")), MessageRoute::NotJson);
        assert!(matches!(
            router.handle(&frame(SUBJECT, "{not json}")),
            MessageRoute::Undecodable(_)
        ));
        assert_eq!(
            router.handle(&frame(SUBJECT, r#"{"type":"device-update"}"#)),
            MessageRoute::Unhandled { kind: "unknown" }
        );
        assert!(matches!(
            router.handle(&frame(SUBJECT, r#"{"type":"payment-license","message":{}}"#)),
            MessageRoute::Undecodable(_)
        ));

        // Nothing above resolved the purchase
        assert_eq!(
            router.coordinator().settle_user_cancelled(),
            SettleOutcome::Settled
        );
    }

    #[test]
    fn test_unknown_subject_is_ignored() {
        let router = router();
        let route = router.handle(&frame(
            "OTHER.acct.dev",
            r#"{"type":"payment-license","message":{"name":"Pro"}}"#,
        ));
        assert_eq!(route, MessageRoute::UnknownSubject);
    }

    #[tokio::test]
    async fn test_forwarder_receives_decoded_messages() {
        let router = router();
        let (tx, mut rx) = mpsc::channel(4);
        router.set_message_sender(tx);

        router.handle(&frame(
            SUBJECT,
            r#"{"type":"payment-license","message":{"name":"Pro"}}"#,
        ));

        let routed = rx.recv().await.unwrap();
        assert_eq!(routed.subject, SUBJECT);
        assert_eq!(routed.message.kind(), "payment-license");
    }

    #[test]
    fn test_push_without_pending_purchase_is_harmless() {
        let router = router();
        let route = router.handle(&frame(
            SUBJECT,
            r#"{"type":"payment-license","message":{"name":"Pro"}}"#,
        ));
        assert!(matches!(route, MessageRoute::PaymentCompleted { .. }));
        assert!(!router.coordinator().has_pending());
    }
}
