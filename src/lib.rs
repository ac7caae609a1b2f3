//! License push channel client
//!
//! A NATS-style pub/sub client over WebSocket that listens for license
//! payment notifications, plus the purchase flow that waits on them.
//!
//! # Overview
//!
//! - [`protocol`]: text protocol codec, push payloads and subject rules
//! - [`transport`]: socket seam with a `tokio-tungstenite` implementation
//! - [`pubsub`]: reconnecting client, subscription router and health
//! - [`purchase`]: pending-operation coordinator, payment dialog seam and
//!   the purchase/verify orchestration
//! - [`api`]: license REST API client
//! - [`service`]: explicit owner of the shared client
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use license_pubsub::config::AppConfig;
//! use license_pubsub::purchase::PendingOperationCoordinator;
//! use license_pubsub::service::PubSubService;
//! use license_pubsub::transport::WebSocketConnector;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::default();
//! let service = PubSubService::new(
//!     config.pubsub.clone(),
//!     Arc::new(WebSocketConnector::new()),
//!     PendingOperationCoordinator::new(),
//! );
//!
//! let client = service.start("account-code", "device-id").await?;
//! client.wait_until_connected(Duration::from_secs(10)).await?;
//! println!("listening on {:?}", client.device_subject());
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod identity;
pub mod observability;
pub mod protocol;
pub mod pubsub;
pub mod purchase;
pub mod service;
pub mod testing;
pub mod transport;

pub use config::AppConfig;
pub use error::{LicenseError, LicenseResult};
pub use pubsub::PubSubClient;
pub use purchase::{LicenseService, PendingOperationCoordinator, PurchaseOutcome, VerifyOutcome};
pub use service::{PubSubService, ServiceStatus};
