//! ---
//! ct_section: "02-messaging-ipc-data-model"
//! ct_subsection: "module"
//! ct_type: "source"
//! ct_scope: "code"
//! ct_description: "Message envelopes, exchanges and request dispatch."
//! ct_version: "v0.0.0-prealpha"
//! ct_owner: "tbd"
//! ---
//! Request/response messaging for the coffee table service.
//!
//! Every node (the service and each application) owns one [`Dispatcher`]. Outbound
//! requests produce an [`Exchange`] that completes exactly once, either when the
//! correlated response arrives or when its deadline passes. Inbound requests are
//! fanned out to the handlers registered for the request name, highest priority
//! first.
#![warn(missing_docs)]

pub mod codec;
pub mod dispatcher;
pub mod exchange;
pub mod handler;
pub mod logging;
pub mod transport;
pub mod types;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors surfaced by the messaging layer.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// Wrapper for JSON serialization or deserialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// A decoded envelope violates the request/response shape.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    /// The transport connection is no longer open.
    #[error("connection {0} is closed")]
    ConnectionClosed(transport::ConnectionId),
    /// A handler could not be registered.
    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

/// Configuration-time failures raised while registering request handlers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    /// The request name is empty or contains characters outside `[A-Za-z0-9_-]`.
    #[error(
        "handler {handler} has an invalid request name {name:?}; request names are \
         case-insensitive and must consist only of alphanumeric characters, hyphens and underscores"
    )]
    InvalidRequestName {
        /// Type or label of the offending handler.
        handler: String,
        /// The rejected request name.
        name: String,
    },
}

pub use codec::{decode_message, decode_payload, encode_message, encode_payload};
pub use dispatcher::{Dispatcher, DispatcherBuilder, Outbound, DEFAULT_REQUEST_TIMEOUT};
pub use exchange::{Exchange, ExchangeOutcome, TIMEOUT_DETAILS};
pub use handler::{HandlerKey, Request, RequestHandler, Response};
pub use logging::{log_message, MessageDirection, MessagingMetricsExporter};
pub use transport::{ConnectionHandler, ConnectionId, InMemoryTransport, Transport};
pub use types::{Empty, InstanceId, Message, MessageId, NoReply, SERVICE_ID};
