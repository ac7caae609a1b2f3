//! License purchase flow
//!
//! A purchase opens one pending operation in the
//! [`PendingOperationCoordinator`], shows the payment QR, then waits for
//! whichever comes first: a push message, the user closing the dialog, a
//! push channel failure or the timeout.

pub mod coordinator;
pub mod flow;
pub mod presenter;

pub use coordinator::{
    CoordinatorError, OperationResult, PendingOperationCoordinator, SettleOutcome, WaitHandle,
};
pub use flow::{LicenseService, PurchaseOutcome, PurchaseSettings, VerifyOutcome};
pub use presenter::{
    DialogEvent, DialogHandle, PaymentPresenter, PaymentPrompt, PresenterError, TerminalPresenter,
    PAYMENT_APP_PACKAGE,
};
