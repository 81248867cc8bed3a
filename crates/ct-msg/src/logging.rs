//! ---
//! ct_section: "02-messaging-ipc-data-model"
//! ct_subsection: "module"
//! ct_type: "source"
//! ct_scope: "code"
//! ct_description: "Message envelopes, exchanges and request dispatch."
//! ct_version: "v0.0.0-prealpha"
//! ct_owner: "tbd"
//! ---
use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};
use tracing::debug;

use crate::types::Message;

/// Direction of the message movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Message handed to the transport by a dispatcher.
    Outbound,
    /// Message delivered to a dispatcher.
    Inbound,
    /// Message relayed by the router to another connection.
    Forwarded,
    /// Message refused by the router (unbound connection, unknown destination).
    Rejected,
}

/// Emit a structured log entry for message activity.
pub fn log_message(direction: MessageDirection, message: &Message) {
    debug!(
        message_id = message.id(),
        kind = message.kind(),
        request = message.request_name(),
        correlation_id = message.correlation_id,
        destination_id = message.destination_id,
        sender_id = message.sender_id,
        sent = %message.sent,
        direction = ?direction,
        "messaging activity"
    );
}

/// Prometheus metric handles for messaging activity.
pub struct MessagingMetricsExporter {
    sent: IntCounter,
    received: IntCounter,
    forwarded: IntCounter,
    rejected: IntCounter,
    completed: IntCounter,
    timed_out: IntCounter,
    latency: Histogram,
}

impl MessagingMetricsExporter {
    /// Register messaging metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let counter = IntCounter::with_opts(Opts::new(name, help))?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let sent = counter("ct_messages_sent_total", "Messages handed to the transport")?;
        let received = counter("ct_messages_received_total", "Messages delivered to a dispatcher")?;
        let forwarded = counter(
            "ct_messages_forwarded_total",
            "Messages relayed between application connections",
        )?;
        let rejected = counter(
            "ct_messages_rejected_total",
            "Messages refused by the router",
        )?;
        let completed = counter(
            "ct_exchanges_completed_total",
            "Exchanges completed by a correlated response",
        )?;
        let timed_out = counter(
            "ct_exchanges_timed_out_total",
            "Exchanges expired without a response",
        )?;
        let latency = Histogram::with_opts(HistogramOpts::new(
            "ct_exchange_roundtrip_latency_seconds",
            "Observed latency between request and correlated response",
        ))?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self {
            sent,
            received,
            forwarded,
            rejected,
            completed,
            timed_out,
            latency,
        })
    }

    /// Record a sent message.
    pub fn observe_sent(&self) {
        self.sent.inc();
    }

    /// Record a received message.
    pub fn observe_received(&self) {
        self.received.inc();
    }

    /// Record a forwarded message.
    pub fn observe_forwarded(&self) {
        self.forwarded.inc();
    }

    /// Record a rejected message.
    pub fn observe_rejected(&self) {
        self.rejected.inc();
    }

    /// Record an exchange completed by its response, with its round-trip time.
    pub fn observe_completed(&self, latency: Duration) {
        self.completed.inc();
        self.latency.observe(latency.as_secs_f64());
    }

    /// Record expired exchanges.
    pub fn observe_timed_out(&self, count: u64) {
        self.timed_out.inc_by(count);
    }
}
