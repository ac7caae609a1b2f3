//! Pure health monitoring and reconnection logic for the pub/sub client
//!
//! This module contains pure functions for reconnection decisions,
//! phase transitions and connection health tracking.

use super::connection::{ConnectionPhase, ReconnectConfig};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether another reconnect attempt may be scheduled (pure function)
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if current_attempts >= config.max_attempts {
            return ReconnectionDecision::AbortMaxAttemptsExceeded;
        }

        let attempt = current_attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.calculate_backoff_delay(attempt),
        }
    }

    /// Determine next phase after a connection event (pure function)
    pub fn next_phase(current: ConnectionPhase, event: &PhaseEvent) -> ConnectionPhase {
        match event {
            PhaseEvent::ConnectRequested => ConnectionPhase::Connecting,
            PhaseEvent::Opened => ConnectionPhase::Connected,
            PhaseEvent::CloseRequested => ConnectionPhase::Closing,
            PhaseEvent::Closed { .. } => ConnectionPhase::Disconnected,
            PhaseEvent::Failed(_) => ConnectionPhase::Failed,
            PhaseEvent::RetryScheduled { .. } => match current {
                // a failed socket waits for its retry in Disconnected
                ConnectionPhase::Failed | ConnectionPhase::Disconnected => {
                    ConnectionPhase::Disconnected
                }
                other => other,
            },
            PhaseEvent::RetryExhausted { .. } => ConnectionPhase::Failed,
        }
    }

    /// Whether outbound lines can go straight to the socket (pure function)
    pub fn can_send(phase: ConnectionPhase) -> bool {
        phase == ConnectionPhase::Connected
    }

    /// Calculate health metrics for connection (pure function)
    pub fn calculate_health_metrics(
        connect_time: Option<Instant>,
        last_frame_time: Option<Instant>,
        reconnect_count: u32,
        stale_after: Duration,
    ) -> HealthMetrics {
        let now = Instant::now();

        let uptime = connect_time.map(|t| now.duration_since(t));
        let time_since_last_frame = last_frame_time.map(|t| now.duration_since(t));

        HealthMetrics {
            uptime,
            time_since_last_frame,
            reconnect_count,
            is_healthy: Self::determine_health_status(uptime, time_since_last_frame, stale_after),
        }
    }

    fn determine_health_status(
        uptime: Option<Duration>,
        time_since_last_frame: Option<Duration>,
        stale_after: Duration,
    ) -> bool {
        match (uptime, time_since_last_frame) {
            (Some(_), None) => true,
            (Some(_), Some(last_frame)) => last_frame < stale_after,
            _ => false,
        }
    }

    /// Log connection phase transition (pure logging function)
    pub fn log_state_transition(from: ConnectionPhase, to: ConnectionPhase, event: &PhaseEvent) {
        match (from, to, event) {
            (ConnectionPhase::Connecting, ConnectionPhase::Connected, _) => {
                info!("Pub/sub connection established");
            }
            (ConnectionPhase::Connected, ConnectionPhase::Disconnected, PhaseEvent::Closed { code }) => {
                warn!(code, "Pub/sub connection closed");
            }
            (_, ConnectionPhase::Failed, PhaseEvent::Failed(reason)) => {
                warn!(reason = %reason, "Pub/sub connection failed");
            }
            (_, _, PhaseEvent::RetryScheduled { attempt, delay_ms }) => {
                info!(attempt, delay_ms, "Reconnection scheduled");
            }
            (_, _, PhaseEvent::RetryExhausted { attempts }) => {
                error!(attempts, "Pub/sub reconnection attempts exhausted");
            }
            _ => {
                debug!("Pub/sub phase: {} -> {}", from, to);
            }
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// Connection events that trigger phase transitions
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseEvent {
    ConnectRequested,
    Opened,
    CloseRequested,
    Closed { code: u16 },
    Failed(String),
    RetryScheduled { attempt: u32, delay_ms: u64 },
    RetryExhausted { attempts: u32 },
}

/// Health metrics for connection monitoring
#[derive(Debug, Clone)]
pub struct HealthMetrics {
    /// Time since the current connection opened
    pub uptime: Option<Duration>,
    /// Time since the last inbound frame
    pub time_since_last_frame: Option<Duration>,
    /// Successful re-opens after the first connection
    pub reconnect_count: u32,
    pub is_healthy: bool,
}
