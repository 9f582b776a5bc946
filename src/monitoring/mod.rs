//! Error notification and monitoring events
//!
//! Transport-level errors are never silently dropped: every component
//! forwards them to an [`ErrorNotifier`]. The writer can additionally emit
//! [`RelayEvent`]s over a bounded channel for operational visibility.

use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tracing::{error, warn};

/// Error-notification capability
///
/// Implemented by whichever component wants custom observability; the
/// default [`TracingNotifier`] logs through `tracing`.
pub trait ErrorNotifier: Send + Sync {
    fn notify(&self, error: anyhow::Error);
}

/// Default notifier: logs every forwarded error.
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

impl ErrorNotifier for TracingNotifier {
    fn notify(&self, error: anyhow::Error) {
        error!(error = %error, "Transport error");
    }
}

/// Configuration for the monitoring event channel
#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    /// Whether event emission is enabled
    pub enabled: bool,
    /// Size of the event channel buffer
    pub channel_size: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_size: 1000,
        }
    }
}

/// A monitoring event from the relay
#[derive(Debug, Clone)]
pub struct RelayEvent {
    /// When the event occurred
    pub timestamp: SystemTime,
    /// The type of event and its details
    pub event_type: RelayEventType,
}

/// The different types of events emitted during relaying
#[derive(Debug, Clone)]
pub enum RelayEventType {
    /// One query's batch resolved its flush
    BatchFlushed {
        query: String,
        stored: usize,
        failed: usize,
        duration: Duration,
    },
    /// A message was forwarded to the dead-letter destination
    DeadLettered { reason: String },
    /// A consumer re-established its broker-side consume
    ConsumerRecovered { queue: String },
    /// A transport-level error was reported to the notifier
    TransportError { message: String },
}

impl RelayEvent {
    pub fn batch_flushed(query: String, stored: usize, failed: usize, duration: Duration) -> Self {
        Self {
            timestamp: SystemTime::now(),
            event_type: RelayEventType::BatchFlushed {
                query,
                stored,
                failed,
                duration,
            },
        }
    }

    pub fn dead_lettered(reason: String) -> Self {
        Self {
            timestamp: SystemTime::now(),
            event_type: RelayEventType::DeadLettered { reason },
        }
    }

    pub fn consumer_recovered(queue: String) -> Self {
        Self {
            timestamp: SystemTime::now(),
            event_type: RelayEventType::ConsumerRecovered { queue },
        }
    }

    pub fn transport_error(message: String) -> Self {
        Self {
            timestamp: SystemTime::now(),
            event_type: RelayEventType::TransportError { message },
        }
    }
}

/// Notifier decorator that mirrors every forwarded error onto the
/// monitoring event channel.
pub struct EventEmittingNotifier {
    inner: std::sync::Arc<dyn ErrorNotifier>,
    events_tx: mpsc::Sender<RelayEvent>,
}

impl EventEmittingNotifier {
    pub fn new(inner: std::sync::Arc<dyn ErrorNotifier>, events_tx: mpsc::Sender<RelayEvent>) -> Self {
        Self { inner, events_tx }
    }
}

impl ErrorNotifier for EventEmittingNotifier {
    fn notify(&self, error: anyhow::Error) {
        if let Err(e) = self
            .events_tx
            .try_send(RelayEvent::transport_error(error.to_string()))
        {
            warn!(error = %e, "Failed to send monitoring event");
        }
        self.inner.notify(error);
    }
}

/// Send an event without ever blocking the emitting component.
pub(crate) fn emit(tx: &Option<mpsc::Sender<RelayEvent>>, event: RelayEvent) {
    if let Some(tx) = tx {
        if let Err(e) = tx.try_send(event) {
            warn!(error = %e, "Failed to send monitoring event");
        }
    }
}
