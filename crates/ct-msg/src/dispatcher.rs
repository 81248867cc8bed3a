//! ---
//! ct_section: "02-messaging-ipc-data-model"
//! ct_subsection: "module"
//! ct_type: "source"
//! ct_scope: "code"
//! ct_description: "Message envelopes, exchanges and request dispatch."
//! ct_version: "v0.0.0-prealpha"
//! ct_owner: "tbd"
//! ---
//! Per-node dispatcher composing the pending-exchange table and the handler table.
//!
//! Both tables sit behind `parking_lot` locks. No lock is ever held while a
//! handler runs or while a message is handed to the outbound sink, so handlers
//! and sinks may re-enter the dispatcher (for example a router delivering a
//! message addressed to the local node straight back into [`Dispatcher::receive`]).

use std::any::type_name;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::codec::encode_payload;
use crate::exchange::{Exchange, ExchangeCell, PendingExchange, PendingTable};
use crate::handler::{
    canonical_request_name, HandlerEntry, HandlerKey, HandlerTable, Invocation, Request,
    RequestHandler, Response,
};
use crate::logging::{log_message, MessageDirection, MessagingMetricsExporter};
use crate::types::{InstanceId, Message, MessageId};
use crate::{MessagingError, Result};

/// Time an exchange waits for its response unless configured otherwise.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(1000);

/// Sink receiving every message a dispatcher emits.
pub trait Outbound: Send + Sync + 'static {
    /// Hand a message to the transport or router.
    fn dispatch(&self, message: Message);
}

impl<F> Outbound for F
where
    F: Fn(Message) + Send + Sync + 'static,
{
    fn dispatch(&self, message: Message) {
        self(message)
    }
}

struct Inner {
    label: String,
    outbound: Box<dyn Outbound>,
    pending: Arc<PendingTable>,
    handlers: RwLock<HandlerTable>,
    timeout: Duration,
    metrics: Option<Arc<MessagingMetricsExporter>>,
}

/// Builder for [`Dispatcher`].
#[derive(Default)]
pub struct DispatcherBuilder {
    label: Option<String>,
    timeout: Option<Duration>,
    metrics: Option<Arc<MessagingMetricsExporter>>,
}

impl DispatcherBuilder {
    /// Start a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Name used in log entries emitted by this dispatcher.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Default timeout for exchanges created by [`Dispatcher::send`].
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Record messaging metrics.
    pub fn metrics(mut self, metrics: Arc<MessagingMetricsExporter>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Finish the dispatcher around the given outbound sink.
    pub fn build(self, outbound: impl Outbound) -> Dispatcher {
        Dispatcher {
            inner: Arc::new(Inner {
                label: self.label.unwrap_or_else(|| "node".to_owned()),
                outbound: Box::new(outbound),
                pending: Arc::new(Mutex::new(HashMap::new())),
                handlers: RwLock::new(HandlerTable::default()),
                timeout: self.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
                metrics: self.metrics,
            }),
        }
    }
}

/// Request/response engine for one node.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    /// Dispatcher with default settings around `outbound`.
    pub fn new(outbound: impl Outbound) -> Self {
        DispatcherBuilder::new().build(outbound)
    }

    /// Start configuring a dispatcher.
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    /// Default exchange timeout.
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Number of exchanges still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Send a request and return the exchange tracking its response.
    ///
    /// Never blocks: await [`Exchange::wait`] or attach callbacks to observe the
    /// outcome.
    pub fn send<T, P>(&self, destination: InstanceId, request_name: &str, payload: &P) -> Result<Exchange<T>>
    where
        T: DeserializeOwned + Send + Sync + 'static,
        P: Serialize + ?Sized,
    {
        self.send_with_timeout(destination, request_name, payload, self.inner.timeout)
    }

    /// [`Dispatcher::send`] with an explicit timeout.
    pub fn send_with_timeout<T, P>(
        &self,
        destination: InstanceId,
        request_name: &str,
        payload: &P,
        timeout: Duration,
    ) -> Result<Exchange<T>>
    where
        T: DeserializeOwned + Send + Sync + 'static,
        P: Serialize + ?Sized,
    {
        let message = self.build_request(destination, request_name, payload)?;
        let cell = Arc::new(ExchangeCell::<T>::new(message.id(), message.sent, timeout));
        self.inner
            .pending
            .lock()
            .insert(message.id(), cell.clone() as Arc<dyn PendingExchange>);
        let exchange = Exchange::new(cell, Arc::downgrade(&self.inner.pending));
        self.emit(message);
        Ok(exchange)
    }

    /// Send a request without tracking a response. Returns the message id.
    pub fn notify<P>(&self, destination: InstanceId, request_name: &str, payload: &P) -> Result<MessageId>
    where
        P: Serialize + ?Sized,
    {
        let message = self.build_request(destination, request_name, payload)?;
        let id = message.id();
        self.emit(message);
        Ok(id)
    }

    fn build_request<P>(&self, destination: InstanceId, request_name: &str, payload: &P) -> Result<Message>
    where
        P: Serialize + ?Sized,
    {
        if request_name.trim().is_empty() {
            return Err(MessagingError::InvalidMessage(
                "request name must not be empty".to_owned(),
            ));
        }
        let payload = encode_payload(payload)?;
        Ok(Message::request(destination, request_name, payload))
    }

    fn emit(&self, message: Message) {
        log_message(MessageDirection::Outbound, &message);
        if let Some(metrics) = &self.inner.metrics {
            metrics.observe_sent();
        }
        self.inner.outbound.dispatch(message);
    }

    /// Process one inbound message.
    ///
    /// Responses complete their pending exchange, or are dropped when it already
    /// completed. Requests run every handler registered for the name, highest
    /// priority first; only the first response produced is sent back.
    pub fn receive(&self, mut message: Message) {
        let now = Utc::now();
        self.sweep_at(now);

        message.received = Some(now);
        log_message(MessageDirection::Inbound, &message);
        if let Some(metrics) = &self.inner.metrics {
            metrics.observe_received();
        }

        if message.is_response() {
            self.complete(&message, now);
        } else {
            self.dispatch_request(&message, now);
        }
    }

    fn complete(&self, message: &Message, now: DateTime<Utc>) {
        let pending = self.inner.pending.lock().remove(&message.correlation_id);
        let Some(exchange) = pending else {
            debug!(
                node = %self.inner.label,
                correlation_id = message.correlation_id,
                "dropping response without a pending exchange"
            );
            return;
        };
        if exchange.complete_from(message, now) {
            if let Some(metrics) = &self.inner.metrics {
                let latency = (now - exchange.requested()).to_std().unwrap_or_default();
                metrics.observe_completed(latency);
            }
        }
    }

    fn dispatch_request(&self, message: &Message, now: DateTime<Utc>) {
        let handlers = self.inner.handlers.read().lookup(message.request_name());
        if handlers.is_empty() {
            debug!(
                node = %self.inner.label,
                request = message.request_name(),
                sender_id = message.sender_id,
                "no handler registered for request"
            );
            return;
        }

        let mut answered_by: Option<&str> = None;
        for entry in &handlers {
            match entry.invoke(message, now) {
                Invocation::Skipped(reason) => warn!(
                    node = %self.inner.label,
                    handler = %entry.label,
                    request = message.request_name(),
                    %reason,
                    "handler skipped"
                ),
                Invocation::NoReply => {}
                Invocation::Reply {
                    success,
                    details,
                    payload,
                } => {
                    if let Some(first) = answered_by {
                        debug!(
                            node = %self.inner.label,
                            handler = %entry.label,
                            answered_by = first,
                            request = message.request_name(),
                            "suppressing additional response"
                        );
                        continue;
                    }
                    answered_by = Some(&entry.label);
                    self.emit(Message::response(
                        message.id(),
                        message.sender_id,
                        success,
                        details,
                        payload,
                    ));
                }
            }
        }
    }

    /// Register a typed handler. Registering the same handler type under the
    /// same name again is a no-op returning the same key.
    pub fn register<H: RequestHandler>(&self, handler: H) -> Result<HandlerKey> {
        let label = type_name::<H>();
        let name = canonical_request_name(label, handler.name())?;
        let key = HandlerKey::typed::<H>(&name);
        let owner = handler.owner().map(str::to_owned);
        let priority = handler.priority();
        let handler = Arc::new(handler);
        let entry = HandlerEntry::new::<H::Request, H::Response, _>(
            key.clone(),
            label,
            owner,
            priority,
            move |request, response| handler.handle(request, response),
        );
        self.insert(entry, &name);
        Ok(key)
    }

    /// Register a closure or fn item as a handler for `request_name`.
    /// Registering the same function under the same name again is a no-op.
    pub fn register_fn<Req, Resp, F>(&self, request_name: &str, priority: i32, handler: F) -> Result<HandlerKey>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Request<Req>, &mut Response<Resp>) + Send + Sync + 'static,
    {
        let label = format!("fn:{request_name}");
        let name = canonical_request_name(&label, request_name)?;
        let key = HandlerKey::typed::<F>(&name);
        self.insert(
            HandlerEntry::new::<Req, Resp, F>(key.clone(), label, None, priority, handler),
            &name,
        );
        Ok(key)
    }

    fn insert(&self, entry: HandlerEntry, name: &str) {
        let label = entry.label.clone();
        let priority = entry.priority;
        if self.inner.handlers.write().insert(entry) {
            info!(node = %self.inner.label, handler = %label, request = name, priority, "registered handler");
        } else {
            debug!(node = %self.inner.label, handler = %label, request = name, "handler already registered");
        }
    }

    /// Whether a handler with `key` is currently registered.
    pub fn is_registered(&self, key: &HandlerKey) -> bool {
        self.inner.handlers.read().contains(key)
    }

    /// Drop all handlers owned by `owner`.
    pub fn unregister_owner(&self, owner: &str) -> usize {
        self.inner.handlers.write().remove_owner(owner)
    }

    /// Expire every pending exchange older than its timeout. Returns how many expired.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<_> = {
            let mut pending = self.inner.pending.lock();
            let ids: Vec<MessageId> = pending
                .iter()
                .filter(|(_, exchange)| exchange.is_expired(now))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };

        let count = expired
            .into_iter()
            .filter(|exchange| exchange.expire_at(now))
            .count();
        if count > 0 {
            debug!(node = %self.inner.label, expired = count, "expired pending exchanges");
            if let Some(metrics) = &self.inner.metrics {
                metrics.observe_timed_out(count as u64);
            }
        }
        count
    }

    /// Periodically sweep expired exchanges until the dispatcher is dropped.
    pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Dispatcher { inner }.sweep_expired();
            }
        })
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("label", &self.inner.label)
            .field("timeout", &self.inner.timeout)
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Empty;

    fn capture() -> (Dispatcher, Arc<Mutex<Vec<Message>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = sent.clone();
        let dispatcher = Dispatcher::builder()
            .label("test")
            .timeout(Duration::from_millis(50))
            .build(move |message: Message| sink.lock().push(message));
        (dispatcher, sent)
    }

    #[test]
    fn send_registers_exchange_and_emits_request() {
        let (dispatcher, sent) = capture();
        let exchange: Exchange<Empty> = dispatcher.send(7, "Ping", &Empty).expect("send");

        let outbound = sent.lock();
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].request_name(), "ping");
        assert_eq!(outbound[0].payload, None);
        assert_eq!(exchange.correlation_id(), outbound[0].id());
        assert_eq!(exchange.requested(), outbound[0].sent);
        assert_eq!(dispatcher.pending_count(), 1);
    }

    #[test]
    fn notify_tracks_nothing() {
        let (dispatcher, sent) = capture();
        dispatcher.notify(7, "update", &Empty).expect("notify");
        assert_eq!(dispatcher.pending_count(), 0);
        assert_eq!(sent.lock().len(), 1);
    }

    #[test]
    fn empty_request_names_are_rejected() {
        let (dispatcher, _) = capture();
        assert!(dispatcher.send::<Empty, _>(7, " ", &Empty).is_err());
    }

    #[test]
    fn invalid_handler_names_fail_at_registration() {
        let (dispatcher, _) = capture();
        let err = dispatcher
            .register_fn::<Empty, Empty, _>("no spaces", 0, |_, _| {})
            .expect_err("invalid name");
        assert!(matches!(err, MessagingError::Registration(_)));
    }

    #[test]
    fn unknown_responses_are_dropped() {
        let (dispatcher, sent) = capture();
        dispatcher.receive(Message::response(999_999, 1, true, None, None));
        assert!(sent.lock().is_empty());
    }

    #[test]
    fn sweep_expires_old_exchanges() {
        let (dispatcher, _) = capture();
        let exchange: Exchange<Empty> = dispatcher.send(7, "slow", &Empty).expect("send");
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(dispatcher.sweep_expired(), 1);
        let outcome = exchange.outcome().expect("expired");
        assert!(outcome.timed_out);
        assert_eq!(dispatcher.pending_count(), 0);
    }
}
