//! ---
//! ct_section: "03-application-registry-routing"
//! ct_subsection: "module"
//! ct_type: "source"
//! ct_scope: "code"
//! ct_description: "Connection binding, instance registry and message routing."
//! ct_version: "v0.0.0-prealpha"
//! ct_owner: "tbd"
//! ---
//! Connection binding and destination routing.
//!
//! Per connection the router is a two-state machine: `Unbound` until a
//! subscription handshake succeeds, then `Bound(instance)` until the transport
//! reports a disconnect. Only the handshake is accepted from unbound connections.

use std::sync::{Arc, Weak};
use std::time::Duration;

use ct_msg::{
    decode_message, decode_payload, encode_message, encode_payload, log_message, ConnectionHandler,
    ConnectionId, Dispatcher, Message, MessageDirection, MessagingMetricsExporter, Transport,
    DEFAULT_REQUEST_TIMEOUT, SERVICE_ID,
};
use tracing::{debug, info, warn};

use crate::registry::{InstanceRecord, InstanceRegistry, RegistryError};
use crate::subscription::{SubscriptionPayload, SubscriptionRequest, SubscriptionResponse, SUBSCRIBE_REQUEST};

/// Details of the failure response for unresolvable destinations.
pub const NO_SUCH_DESTINATION: &str = "No such destination";

const DEFAULT_SERVICE_NAME: &str = "coffeetable";

/// Builder for [`Router`].
pub struct RouterBuilder {
    registry: Arc<dyn InstanceRegistry>,
    transport: Arc<dyn Transport>,
    service_name: String,
    timeout: Duration,
    metrics: Option<Arc<MessagingMetricsExporter>>,
}

impl RouterBuilder {
    pub fn new(registry: Arc<dyn InstanceRegistry>, transport: Arc<dyn Transport>) -> Self {
        Self {
            registry,
            transport,
            service_name: DEFAULT_SERVICE_NAME.to_owned(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            metrics: None,
        }
    }

    /// Sender name stamped on service-originated messages.
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Timeout of exchanges started by the service.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn metrics(mut self, metrics: Arc<MessagingMetricsExporter>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the router together with the service's own dispatcher, whose
    /// outbound sink is [`Router::route_from_self`].
    pub fn build(self) -> Arc<Router> {
        Arc::new_cyclic(|router: &Weak<Router>| {
            let back = router.clone();
            let mut dispatcher = Dispatcher::builder()
                .label(self.service_name.clone())
                .timeout(self.timeout);
            if let Some(metrics) = &self.metrics {
                dispatcher = dispatcher.metrics(metrics.clone());
            }
            let dispatcher = dispatcher.build(move |message: Message| {
                if let Some(router) = back.upgrade() {
                    router.route_from_self(message);
                }
            });
            Router {
                registry: self.registry,
                transport: self.transport,
                dispatcher,
                service_name: self.service_name,
                metrics: self.metrics,
            }
        })
    }
}

/// Star-topology router between application connections and the service.
pub struct Router {
    registry: Arc<dyn InstanceRegistry>,
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
    service_name: String,
    metrics: Option<Arc<MessagingMetricsExporter>>,
}

impl Router {
    pub fn builder(registry: Arc<dyn InstanceRegistry>, transport: Arc<dyn Transport>) -> RouterBuilder {
        RouterBuilder::new(registry, transport)
    }

    /// The service's own dispatcher; register service handlers here.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<dyn InstanceRegistry> {
        &self.registry
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Handle one frame received on `connection`.
    pub fn on_message_received(&self, connection: ConnectionId, raw: &[u8]) {
        let message = match decode_message(raw) {
            Ok(message) => message,
            Err(err) => {
                warn!(connection, error = %err, "dropping undecodable frame");
                self.observe_rejected();
                return;
            }
        };

        match self.registry.by_connection(connection) {
            Some(sender) => self.route_from_instance(&sender, message),
            None => self.handle_unbound(connection, message),
        }
    }

    /// Release every instance bound to `connection`.
    ///
    /// Simulated instances have no process behind them and are removed, which
    /// raises one change notification; launched instances keep running and only
    /// lose their binding.
    pub fn on_client_disconnected(&self, connection: ConnectionId) {
        let released = self.registry.unbind_connection(connection);
        if released.is_empty() {
            debug!(connection, "unbound connection closed");
            return;
        }
        let mut removed = 0;
        for record in &released {
            if record.is_simulated {
                if self.registry.remove(record.id).is_some() {
                    removed += 1;
                }
                info!(connection, instance_id = record.id, app = %record.app.name, "removed simulated instance");
            } else {
                info!(connection, instance_id = record.id, app = %record.app.name, "instance disconnected");
            }
        }
        if removed > 0 {
            self.registry.notify_changed();
        }
    }

    /// Outbound sink of the service dispatcher.
    ///
    /// A request addressed to an instance that is not connected is answered
    /// locally with a failure so the pending exchange resolves immediately.
    pub fn route_from_self(&self, mut message: Message) {
        message.sender_id = SERVICE_ID;
        message.sender_name = Some(self.service_name.clone());

        if let Some(connection) = self.connection_of(message.destination_id) {
            self.deliver(connection, &message, MessageDirection::Outbound);
            return;
        }

        log_message(MessageDirection::Rejected, &message);
        self.observe_rejected();
        if message.is_request() {
            debug!(
                destination_id = message.destination_id,
                request = message.request_name(),
                "service request has no connected destination"
            );
            let mut failure = Message::failure(message.id(), SERVICE_ID, NO_SUCH_DESTINATION);
            failure.sender_id = SERVICE_ID;
            failure.sender_name = Some(self.service_name.clone());
            self.dispatcher.receive(failure);
        }
    }

    fn route_from_instance(&self, sender: &InstanceRecord, mut message: Message) {
        message.sender_id = sender.id;
        message.sender_name = Some(sender.app.name.clone());

        if message.destination_id == SERVICE_ID {
            self.dispatcher.receive(message);
            return;
        }

        match self.connection_of(message.destination_id) {
            Some(connection) => {
                if let Some(metrics) = &self.metrics {
                    metrics.observe_forwarded();
                }
                self.deliver(connection, &message, MessageDirection::Forwarded);
            }
            None => {
                log_message(MessageDirection::Rejected, &message);
                self.observe_rejected();
                // Nobody waits on an answer to a response.
                if !message.is_request() {
                    return;
                }
                if let Some(connection) = sender.connection {
                    let failure = Message::failure(message.id(), sender.id, NO_SUCH_DESTINATION);
                    self.reply(connection, failure);
                }
            }
        }
    }

    fn handle_unbound(&self, connection: ConnectionId, message: Message) {
        if message.is_response() {
            warn!(connection, correlation_id = message.correlation_id, "dropping response from unsubscribed client");
            self.observe_rejected();
            return;
        }

        if message.request_name() != SUBSCRIBE_REQUEST {
            log_message(MessageDirection::Rejected, &message);
            self.observe_rejected();
            let failure = Message::failure(
                message.id(),
                0,
                format!(
                    "Cannot perform request '{}' because the client is not subscribed to the service.",
                    message.request_name()
                ),
            );
            self.reply(connection, failure);
            return;
        }

        let request = match decode_payload::<SubscriptionPayload>(message.payload.as_deref()) {
            Ok(payload) => SubscriptionRequest::from(payload),
            Err(err) => {
                warn!(connection, error = %err, "malformed subscription request");
                self.reply(
                    connection,
                    Message::failure(message.id(), 0, format!("Invalid subscription request: {err}")),
                );
                return;
            }
        };

        match self.subscribe(connection, &request) {
            Ok(record) => {
                info!(
                    connection,
                    instance_id = record.id,
                    app = %record.app.name,
                    simulated = record.is_simulated,
                    "client subscribed"
                );
                let response = SubscriptionResponse {
                    apps_manifest: self.registry.manifest(),
                    subscriber_id: record.id,
                };
                match encode_payload(&response) {
                    Ok(payload) => {
                        self.reply(connection, Message::response(message.id(), record.id, true, None, payload));
                    }
                    Err(err) => {
                        warn!(connection, error = %err, "failed to encode subscription response");
                    }
                }
                self.registry.notify_changed();
            }
            Err(err) => {
                info!(connection, error = %err, "subscription rejected");
                self.reply(connection, Message::failure(message.id(), 0, err.to_string()));
            }
        }
    }

    fn subscribe(&self, connection: ConnectionId, request: &SubscriptionRequest) -> Result<InstanceRecord, RegistryError> {
        if request.is_simulator {
            let manifest = request.simulated_application.as_ref().ok_or_else(|| {
                RegistryError::InvalidManifest("simulator subscription without an application manifest".to_owned())
            })?;
            let record = self.registry.create_simulated(manifest)?;
            return self.registry.bind(record.id, connection).inspect_err(|_| {
                self.registry.remove(record.id);
            });
        }

        let process_id = request
            .process_id
            .ok_or_else(|| RegistryError::InvalidManifest("subscription without a process id".to_owned()))?;
        let record = self
            .registry
            .by_process_id(process_id)
            .ok_or(RegistryError::UnknownProcess(process_id))?;
        self.registry.bind(record.id, connection)
    }

    fn connection_of(&self, id: ct_msg::InstanceId) -> Option<ConnectionId> {
        self.registry.by_id(id).and_then(|record| record.connection)
    }

    /// Service-originated reply straight to a connection.
    fn reply(&self, connection: ConnectionId, mut message: Message) {
        message.sender_id = SERVICE_ID;
        message.sender_name = Some(self.service_name.clone());
        self.deliver(connection, &message, MessageDirection::Outbound);
    }

    fn deliver(&self, connection: ConnectionId, message: &Message, direction: MessageDirection) {
        log_message(direction, message);
        let frame = match encode_message(message) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(connection, message_id = message.id(), error = %err, "failed to encode message");
                return;
            }
        };
        if let Err(err) = self.transport.send(connection, frame) {
            warn!(
                connection,
                transport = self.transport.name(),
                message_id = message.id(),
                error = %err,
                "failed to deliver message"
            );
        }
    }

    fn observe_rejected(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.observe_rejected();
        }
    }
}

impl ConnectionHandler for Router {
    fn on_frame(&self, connection: ConnectionId, frame: &[u8]) {
        self.on_message_received(connection, frame);
    }

    fn on_disconnected(&self, connection: ConnectionId) {
        self.on_client_disconnected(connection);
    }
}
