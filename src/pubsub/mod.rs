//! Push channel client
//!
//! [`PubSubClient`] keeps a subscription alive on the broker and hands
//! every inbound `MSG` frame to the [`SubscriptionRouter`].

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod router;

pub use client::PubSubClient;
pub use connection::{
    ClientEvent, ClientFault, ConnectionPhase, ConnectionState, PubSubError, ReconnectConfig,
    ReconnectState, SendOutcome, Subscription,
};
pub use health_monitor::{HealthMetrics, HealthMonitor, PhaseEvent, ReconnectionDecision};
pub use router::{MessageRoute, RoutedMessage, SubscriptionRouter};
