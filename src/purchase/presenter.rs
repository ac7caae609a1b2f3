//! Payment dialog seam
//!
//! The purchase flow hands the decoded QR to a [`PaymentPresenter`] along
//! with a [`DialogHandle`]. The presenter reports user actions through the
//! handle; closing the dialog cancels the purchase.

use super::coordinator::{PendingOperationCoordinator, SettleOutcome};
use crate::api::QrPayment;
use async_trait::async_trait;
use std::io::{BufRead, Write};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Package of the mobile payment app the QR is meant for
pub const PAYMENT_APP_PACKAGE: &str = "cu.etecsa.cubacel.tr.tm";

/// What the user did with the dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogEvent {
    OpenedPaymentApp,
    Closed,
}

/// Everything a presenter needs to show the payment
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentPrompt {
    pub payment: QrPayment,
    /// QR content exactly as returned by the API
    pub qr_data: String,
    pub payment_app: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PresenterError {
    #[error("Could not show payment dialog: {0}")]
    Unavailable(String),
}

/// Presenter's line back into the purchase flow.
///
/// Bound to the operation it was shown for, so a dialog closed after its
/// purchase ended cannot cancel the next one.
#[derive(Clone)]
pub struct DialogHandle {
    coordinator: PendingOperationCoordinator,
    operation_id: Uuid,
}

impl DialogHandle {
    pub fn new(coordinator: PendingOperationCoordinator, operation_id: Uuid) -> Self {
        Self {
            coordinator,
            operation_id,
        }
    }

    pub fn operation_id(&self) -> Uuid {
        self.operation_id
    }

    pub fn report(&self, event: DialogEvent) {
        match event {
            DialogEvent::OpenedPaymentApp => info!("User opened the payment app"),
            DialogEvent::Closed => {
                let outcome = self.coordinator.settle_user_cancelled_for(self.operation_id);
                if outcome == SettleOutcome::Settled {
                    info!("Payment dialog closed by user");
                } else {
                    debug!("Payment dialog closed after the purchase settled");
                }
            }
        }
    }

    pub fn opened_payment_app(&self) {
        self.report(DialogEvent::OpenedPaymentApp);
    }

    pub fn closed_by_user(&self) {
        self.report(DialogEvent::Closed);
    }
}

#[async_trait]
pub trait PaymentPresenter: Send + Sync {
    /// Show the payment. Returns once the dialog is up; user actions arrive
    /// later through `dialog`.
    async fn present(&self, prompt: PaymentPrompt, dialog: DialogHandle) -> Result<(), PresenterError>;
}

/// Prints the payment to the terminal and reads commands from stdin:
/// `o` marks the payment app as opened, `q` or end of input closes the
/// dialog.
#[derive(Debug, Clone, Default)]
pub struct TerminalPresenter;

#[async_trait]
impl PaymentPresenter for TerminalPresenter {
    async fn present(&self, prompt: PaymentPrompt, dialog: DialogHandle) -> Result<(), PresenterError> {
        let mut stdout = std::io::stdout().lock();
        writeln!(
            stdout,
            "Pay {:.2} {} (transaction {}) with {}",
            prompt.payment.amount,
            prompt.payment.currency,
            prompt.payment.transaction_id,
            prompt.payment_app
        )
        .and_then(|_| writeln!(stdout, "QR: {}", prompt.qr_data))
        .and_then(|_| writeln!(stdout, "[o] opened payment app  [q] cancel"))
        .map_err(|e| PresenterError::Unavailable(e.to_string()))?;
        drop(stdout);

        // Plain thread: a blocked stdin read must not hold up runtime shutdown
        std::thread::Builder::new()
            .name("payment-dialog".to_string())
            .spawn(move || {
                for line in std::io::stdin().lock().lines() {
                    match line.as_deref().map(str::trim) {
                        Ok("o") => dialog.opened_payment_app(),
                        Ok("q") | Err(_) => break,
                        Ok(_) => {}
                    }
                }
                dialog.closed_by_user();
            })
            .map_err(|e| PresenterError::Unavailable(e.to_string()))?;

        Ok(())
    }
}
