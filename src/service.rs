//! Process-wide owner of the push channel
//!
//! [`PubSubService`] builds one [`PubSubClient`] on first start, keeps it
//! for later starts and turns client events into a coarse
//! [`ServiceStatus`] for whoever is hosting it.

use crate::config::PubSubSection;
use crate::pubsub::{ClientEvent, PubSubClient, PubSubError, SubscriptionRouter};
use crate::purchase::coordinator::PendingOperationCoordinator;
use crate::transport::Connector;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Connected,
    Disconnected,
    Error(String),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Service is not running")]
    NotRunning,
    #[error("Push channel lost: {0}")]
    ConnectionLost(String),
    #[error(transparent)]
    Client(#[from] PubSubError),
}

struct Running {
    client: Arc<PubSubClient>,
    monitor: JoinHandle<()>,
}

pub struct PubSubService {
    config: PubSubSection,
    connector: Arc<dyn Connector>,
    coordinator: PendingOperationCoordinator,
    running: Mutex<Option<Running>>,
    status_tx: watch::Sender<ServiceStatus>,
}

impl PubSubService {
    pub fn new(
        config: PubSubSection,
        connector: Arc<dyn Connector>,
        coordinator: PendingOperationCoordinator,
    ) -> Self {
        let (status_tx, _) = watch::channel(ServiceStatus::Stopped);
        Self {
            config,
            connector,
            coordinator,
            running: Mutex::new(None),
            status_tx,
        }
    }

    /// Start (or re-point) the push channel for this device.
    ///
    /// The first call builds the client; later calls reuse it, moving the
    /// subscription if the identity changed.
    pub async fn start(
        &self,
        account_code: &str,
        device_id: &str,
    ) -> Result<Arc<PubSubClient>, ServiceError> {
        let client = {
            let mut running = self.running.lock().await;
            match running.as_ref() {
                Some(running) => Arc::clone(&running.client),
                None => {
                    let router = Arc::new(SubscriptionRouter::new(self.coordinator.clone()));
                    let client = Arc::new(PubSubClient::new(
                        self.config.clone(),
                        Arc::clone(&self.connector),
                        router,
                    )?);
                    let monitor = spawn_status_monitor(client.events(), self.status_tx.clone());
                    *running = Some(Running {
                        client: Arc::clone(&client),
                        monitor,
                    });
                    client
                }
            }
        };

        if !client.is_connected() {
            self.status_tx.send_replace(ServiceStatus::Starting);
        }
        let subject = client.configure(account_code, device_id).await?;
        client.connect()?;
        info!(subject = %subject, "Push channel service started");
        Ok(client)
    }

    /// Disconnect and drop the client
    pub async fn stop(&self) -> Result<(), ServiceError> {
        let running = self
            .running
            .lock()
            .await
            .take()
            .ok_or(ServiceError::NotRunning)?;

        running.monitor.abort();
        running.client.disconnect().await;
        self.status_tx.send_replace(ServiceStatus::Stopped);
        info!("Push channel service stopped");
        Ok(())
    }

    pub async fn client(&self) -> Option<Arc<PubSubClient>> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| Arc::clone(&running.client))
    }

    pub fn coordinator(&self) -> &PendingOperationCoordinator {
        &self.coordinator
    }

    pub fn status(&self) -> ServiceStatus {
        self.status_tx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ServiceStatus> {
        self.status_tx.subscribe()
    }
}

fn status_for(event: &ClientEvent) -> ServiceStatus {
    match event {
        ClientEvent::Connected => ServiceStatus::Connected,
        ClientEvent::Disconnected { .. } => ServiceStatus::Disconnected,
        ClientEvent::Error(fault) if fault.is_terminal() => ServiceStatus::Error(fault.to_string()),
        ClientEvent::Error(_) => ServiceStatus::Disconnected,
    }
}

fn spawn_status_monitor(
    mut events: broadcast::Receiver<ClientEvent>,
    status_tx: watch::Sender<ServiceStatus>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let status = status_for(&event);
                    debug!(?status, "Service status");
                    status_tx.send_replace(status);
                }
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "Status monitor lagged"),
                Err(RecvError::Closed) => return,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::ClientFault;
    use crate::testing::mocks::MockConnector;
    use std::time::Duration;

    fn service(connector: &MockConnector) -> PubSubService {
        PubSubService::new(
            crate::config::AppConfig::test_config().pubsub,
            Arc::new(connector.clone()),
            PendingOperationCoordinator::new(),
        )
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&ClientEvent::Connected), ServiceStatus::Connected);
        assert_eq!(
            status_for(&ClientEvent::Error(ClientFault::RetryExhausted { attempts: 3 })),
            ServiceStatus::Error("gave up reconnecting after 3 attempts".to_string())
        );
        assert_eq!(
            status_for(&ClientEvent::Error(ClientFault::Recoverable(
                crate::transport::TransportError::timeout("slow")
            ))),
            ServiceStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn test_start_connects_and_reuses_client() {
        let connector = MockConnector::new();
        let service = service(&connector);
        let mut status = service.watch_status();

        let first = service.start("acct", "dev-1").await.unwrap();
        first
            .wait_until_connected(Duration::from_secs(2))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), status.wait_for(|s| *s == ServiceStatus::Connected))
            .await
            .unwrap()
            .unwrap();

        let second = service.start("acct", "dev-2").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connector.connections(), 1);
        assert_eq!(
            second.device_subject().as_deref(),
            Some("TEST_DEVICES.acct.dev-2")
        );
    }

    #[tokio::test]
    async fn test_stop_without_start_fails() {
        let service = service(&MockConnector::new());
        assert!(matches!(service.stop().await, Err(ServiceError::NotRunning)));
    }

    #[tokio::test]
    async fn test_stop_disconnects() {
        let connector = MockConnector::new();
        let service = service(&connector);

        let client = service.start("acct", "dev-1").await.unwrap();
        client
            .wait_until_connected(Duration::from_secs(2))
            .await
            .unwrap();

        service.stop().await.unwrap();
        assert_eq!(service.status(), ServiceStatus::Stopped);
        assert!(!client.is_connected());
        assert!(service.client().await.is_none());
    }
}
