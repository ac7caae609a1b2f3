//! Pure connection state, reconnect policy and client events
//!
//! Nothing in here performs I/O; the client in [`super::client`] drives these
//! types from its tasks.

use crate::config::ReconnectSection;
use crate::protocol::SubjectError;
use crate::transport::TransportError;
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

/// Fixed-point scale for the backoff multiplier (per-mille)
const MULTIPLIER_SCALE: u64 = 1_000;
/// Extra fractional precision carried while compounding the delay
const DELAY_PRECISION: u128 = 1_000_000;

/// Observable connection snapshot.
///
/// Replaced wholesale on every change, never mutated in place.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
    pub connected: bool,
    pub last_error: Option<String>,
    pub last_activity: DateTime<Utc>,
}

impl ConnectionState {
    pub fn initial() -> Self {
        Self {
            connected: false,
            last_error: None,
            last_activity: Utc::now(),
        }
    }

    pub fn connected() -> Self {
        Self {
            connected: true,
            last_error: None,
            last_activity: Utc::now(),
        }
    }

    /// Disconnected snapshot carrying the previous activity time forward
    pub fn disconnected(previous: &ConnectionState, error: Option<String>) -> Self {
        Self {
            connected: false,
            last_error: error,
            last_activity: previous.last_activity,
        }
    }

    /// Same snapshot with the activity time bumped to now
    pub fn touched(previous: &ConnectionState) -> Self {
        Self {
            last_activity: Utc::now(),
            ..previous.clone()
        }
    }
}

/// Lifecycle phase of the socket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionPhase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Failed,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionPhase::Disconnected => "disconnected",
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Connected => "connected",
            ConnectionPhase::Closing => "closing",
            ConnectionPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Reconnect policy.
///
/// The delay for attempt `k` is `min(initial_delay_ms * multiplier^k,
/// max_delay_ms)`, computed in integer fixed point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Backoff multiplier in thousandths (1500 = 1.5x)
    pub multiplier_permille: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier_permille: 1_500,
        }
    }
}

impl ReconnectConfig {
    pub fn from_section(section: &ReconnectSection) -> Result<Self, PubSubError> {
        if !section.multiplier.is_finite() || section.multiplier < 1.0 {
            return Err(PubSubError::InvalidReconnectConfig(format!(
                "multiplier must be >= 1.0, got {}",
                section.multiplier
            )));
        }

        let config = Self {
            max_attempts: section.max_attempts,
            initial_delay_ms: section.initial_delay_ms,
            max_delay_ms: section.max_delay_ms,
            multiplier_permille: (section.multiplier * MULTIPLIER_SCALE as f64).round() as u64,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PubSubError> {
        if self.max_attempts == 0 {
            return Err(PubSubError::InvalidReconnectConfig(
                "max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.initial_delay_ms == 0 {
            return Err(PubSubError::InvalidReconnectConfig(
                "initial_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(PubSubError::InvalidReconnectConfig(
                "max_delay_ms must not be below initial_delay_ms".to_string(),
            ));
        }
        if self.multiplier_permille < MULTIPLIER_SCALE {
            return Err(PubSubError::InvalidReconnectConfig(
                "multiplier must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }

    /// Backoff delay in milliseconds for the given attempt number
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let cap = u128::from(self.max_delay_ms) * DELAY_PRECISION;
        let mut scaled = u128::from(self.initial_delay_ms) * DELAY_PRECISION;

        if scaled >= cap {
            return self.max_delay_ms;
        }
        if self.multiplier_permille <= MULTIPLIER_SCALE {
            return self.initial_delay_ms;
        }

        for _ in 0..attempt {
            scaled = scaled * u128::from(self.multiplier_permille) / u128::from(MULTIPLIER_SCALE);
            if scaled >= cap {
                return self.max_delay_ms;
            }
        }

        (scaled / DELAY_PRECISION) as u64
    }

    /// Sum of all delays if every attempt fails
    pub fn calculate_max_total_time(&self) -> u64 {
        (1..=self.max_attempts)
            .map(|attempt| self.calculate_backoff_delay(attempt))
            .sum()
    }
}

/// Reconnect bookkeeping owned by the client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectState {
    /// Consecutive failed attempts since the last successful open
    pub attempt: u32,
    /// A retry timer or retry attempt is outstanding
    pub in_progress: bool,
}

/// A subject the client is subscribed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub subject: String,
    pub subscription_id: String,
}

/// Result of handing a line to [`super::PubSubClient::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Written,
    /// Held until the next successful open
    Queued,
}

/// Connectivity fault surfaced to observers
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFault {
    /// Transient failure; a reconnect has been or will be scheduled
    Recoverable(TransportError),
    /// Non-retryable transport failure
    Fatal(TransportError),
    /// Reconnect attempts are used up
    RetryExhausted { attempts: u32 },
}

impl ClientFault {
    pub fn from_transport(err: TransportError) -> Self {
        if err.is_recoverable() {
            ClientFault::Recoverable(err)
        } else {
            ClientFault::Fatal(err)
        }
    }

    /// No further automatic reconnection will happen
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ClientFault::Recoverable(_))
    }
}

impl fmt::Display for ClientFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientFault::Recoverable(err) => write!(f, "recoverable transport error: {err}"),
            ClientFault::Fatal(err) => write!(f, "fatal transport error: {err}"),
            ClientFault::RetryExhausted { attempts } => {
                write!(f, "gave up reconnecting after {attempts} attempts")
            }
        }
    }
}

/// Lifecycle notifications broadcast by the client
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Disconnected { reason: Option<String> },
    Error(ClientFault),
}

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("Client has no device identity; call configure() first")]
    NotConfigured,
    #[error("Invalid broker URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid subject: {0}")]
    InvalidSubject(#[from] SubjectError),
    #[error("Invalid reconnect configuration: {0}")]
    InvalidReconnectConfig(String),
    #[error("Not connected within {timeout_ms}ms")]
    ConnectTimeout { timeout_ms: u64 },
    #[error("Reconnect attempts exhausted after {attempts} tries")]
    RetryExhausted { attempts: u32 },
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
