//! ---
//! ct_section: "02-messaging-ipc-data-model"
//! ct_subsection: "module"
//! ct_type: "source"
//! ct_scope: "code"
//! ct_description: "Message envelopes, exchanges and request dispatch."
//! ct_version: "v0.0.0-prealpha"
//! ct_owner: "tbd"
//! ---
use std::any::TypeId;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{MessagingError, Result};

/// Logical identity of a message endpoint (an application instance or the service).
pub type InstanceId = u32;

/// Node-local message identifier; `0` is reserved to mean "not a response".
///
/// Allocated from a 64-bit counter, so ids are not reused within a process lifetime.
pub type MessageId = u64;

/// Well-known identity of the service process itself.
pub const SERVICE_ID: InstanceId = 1;

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

fn next_message_id() -> MessageId {
    NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Payload type for requests or responses that carry no data.
///
/// A handler answering with `Response<Empty>` still sends a response; an
/// `Exchange<Empty>` never fails payload decoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty;

/// Response type for handlers that never answer.
///
/// No response message is produced for a handler declaring `Response<NoReply>`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoReply;

/// Whether `T` is one of the payload-less sentinels.
pub(crate) fn is_sentinel<T: 'static>() -> bool {
    let id = TypeId::of::<T>();
    id == TypeId::of::<Empty>() || id == TypeId::of::<NoReply>()
}

pub(crate) fn is_no_reply<T: 'static>() -> bool {
    TypeId::of::<T>() == TypeId::of::<NoReply>()
}

/// Wire-level envelope exchanged between nodes.
///
/// A message is either a request (`request_name` set, `correlation_id == 0`) or a
/// response (`correlation_id` names the answered message, no request name). Field
/// names on the wire are PascalCase to stay compatible with existing clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Message {
    /// Target identity.
    pub destination_id: InstanceId,
    /// Serialized payload, opaque at this layer.
    #[serde(rename = "Data", default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    id: MessageId,
    /// Case-folded request name; only present on requests.
    #[serde(rename = "Request", default, skip_serializing_if = "Option::is_none")]
    pub request_name: Option<String>,
    /// Id of the answered request; `0` on requests.
    #[serde(default)]
    pub correlation_id: MessageId,
    /// Outcome flag carried by responses.
    #[serde(default)]
    pub success: bool,
    /// Human-readable outcome detail carried by responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Creation timestamp.
    pub sent: DateTime<Utc>,
    /// Stamped by the receiving dispatcher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received: Option<DateTime<Utc>>,
    /// Stamped by the router, never trusted from the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Stamped by the router, never trusted from the sender.
    #[serde(default)]
    pub sender_id: InstanceId,
}

impl Message {
    /// Construct a request addressed to `destination`. The request name is case-folded.
    pub fn request(
        destination: InstanceId,
        request_name: impl AsRef<str>,
        payload: Option<String>,
    ) -> Self {
        Self {
            destination_id: destination,
            payload,
            id: next_message_id(),
            request_name: Some(request_name.as_ref().to_lowercase()),
            correlation_id: 0,
            success: false,
            details: None,
            sent: Utc::now(),
            received: None,
            sender_name: None,
            sender_id: 0,
        }
    }

    /// Construct a response to the message `answering`, addressed to `destination`.
    pub fn response(
        answering: MessageId,
        destination: InstanceId,
        success: bool,
        details: Option<String>,
        payload: Option<String>,
    ) -> Self {
        Self {
            destination_id: destination,
            payload,
            id: next_message_id(),
            request_name: None,
            correlation_id: answering,
            success,
            details,
            sent: Utc::now(),
            received: None,
            sender_name: None,
            sender_id: 0,
        }
    }

    /// Terminal failure response answering `answering`.
    pub fn failure(
        answering: MessageId,
        destination: InstanceId,
        details: impl Into<String>,
    ) -> Self {
        Self::response(answering, destination, false, Some(details.into()), None)
    }

    /// Identifier assigned at construction.
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// True when this message answers an earlier request.
    pub fn is_response(&self) -> bool {
        self.correlation_id > 0
    }

    /// True when this message asks a handler to run.
    pub fn is_request(&self) -> bool {
        !self.is_response()
    }

    /// Request name or an empty string for responses.
    pub fn request_name(&self) -> &str {
        self.request_name.as_deref().unwrap_or_default()
    }

    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        if self.is_response() {
            "response"
        } else {
            "request"
        }
    }

    /// Check the exactly-one-of {request name, correlation id} invariant.
    pub fn validate(&self) -> Result<()> {
        match (self.request_name.as_deref(), self.correlation_id) {
            (Some(name), 0) if !name.is_empty() => Ok(()),
            (None, correlation) if correlation > 0 => Ok(()),
            (Some(_), correlation) if correlation > 0 => Err(MessagingError::InvalidMessage(
                format!(
                    "message {} is both a request and a response to {}",
                    self.id, correlation
                ),
            )),
            _ => Err(MessagingError::InvalidMessage(format!(
                "message {} is neither a request nor a response",
                self.id
            ))),
        }
    }
}
