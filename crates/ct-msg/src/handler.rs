//! ---
//! ct_section: "02-messaging-ipc-data-model"
//! ct_subsection: "module"
//! ct_type: "source"
//! ct_scope: "code"
//! ct_description: "Message envelopes, exchanges and request dispatch."
//! ct_version: "v0.0.0-prealpha"
//! ct_owner: "tbd"
//! ---
//! Request handler contracts and the per-node handler table.
//!
//! Handlers are registered explicitly, either by implementing [`RequestHandler`]
//! or by handing a typed closure to [`crate::Dispatcher::register_fn`]. Both paths
//! validate the request name up front and build a typed invocation thunk, so a
//! handler that registers successfully can never fail on shape at request time.

use std::any::{type_name, TypeId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{decode_payload, encode_payload};
use crate::types::{is_no_reply, is_sentinel, InstanceId, Message};
use crate::RegistrationError;

/// Context handed to a handler for one inbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request<T> {
    /// Identity of the sending node, stamped by the router.
    pub sender_id: InstanceId,
    /// Name of the sending application, stamped by the router.
    pub sender_name: Option<String>,
    /// When the sender created the request.
    pub sent: DateTime<Utc>,
    /// When this node received it.
    pub received: DateTime<Utc>,
    /// Decoded request payload.
    pub data: T,
}

/// Mutable response context filled in by a handler.
///
/// `success` starts out `true`; a handler only touches it to report failure.
#[derive(Debug, Clone, PartialEq)]
pub struct Response<T> {
    /// Outcome reported to the caller.
    pub success: bool,
    /// Optional human-readable detail.
    pub details: Option<String>,
    /// Response payload; `None` sends a response without data.
    pub data: Option<T>,
}

impl<T> Default for Response<T> {
    fn default() -> Self {
        Self {
            success: true,
            details: None,
            data: None,
        }
    }
}

impl<T> Response<T> {
    /// Set the payload and keep the success flag.
    pub fn reply(&mut self, data: T) {
        self.data = Some(data);
    }

    /// Mark the response as failed with a reason.
    pub fn fail(&mut self, details: impl Into<String>) {
        self.success = false;
        self.details = Some(details.into());
    }
}

/// A typed request handler.
///
/// The request and response payload types are fixed at compile time. Use
/// [`crate::Empty`] for a request or response without data and
/// [`crate::NoReply`] as the response type of a handler that never answers.
pub trait RequestHandler: Send + Sync + 'static {
    /// Payload decoded from inbound requests.
    type Request: DeserializeOwned + Send + 'static;
    /// Payload serialized into the response.
    type Response: Serialize + Send + 'static;

    /// Request name this handler answers; matched case-insensitively.
    fn name(&self) -> &str;

    /// Handlers with higher priority run first.
    fn priority(&self) -> i32 {
        0
    }

    /// Application owning this handler, if it is bound to one.
    fn owner(&self) -> Option<&str> {
        None
    }

    /// Handle one request. Runs synchronously on the receive path.
    fn handle(&self, request: Request<Self::Request>, response: &mut Response<Self::Response>);
}

/// Identity of a registered handler; registering the same key twice is a no-op.
///
/// Keys combine the handler's type with its canonical request name, so the same
/// handler type or the same fn item/closure definition registers only once per name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerKey {
    handler: TypeId,
    name: String,
}

impl HandlerKey {
    pub(crate) fn typed<H: 'static>(name: &str) -> Self {
        Self {
            handler: TypeId::of::<H>(),
            name: name.to_owned(),
        }
    }

    /// Canonical (case-folded) request name the handler is registered under.
    pub fn request_name(&self) -> &str {
        &self.name
    }
}

/// Validate and case-fold a request name.
pub(crate) fn canonical_request_name(handler: &str, name: &str) -> Result<String, RegistrationError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(RegistrationError::InvalidRequestName {
            handler: handler.to_owned(),
            name: name.to_owned(),
        });
    }
    Ok(name.to_lowercase())
}

/// Result of running one handler against one request.
pub(crate) enum Invocation {
    /// The handler ran and produced a response.
    Reply {
        success: bool,
        details: Option<String>,
        payload: Option<String>,
    },
    /// The handler ran and declares no response.
    NoReply,
    /// The handler could not run or its response could not be encoded.
    Skipped(String),
}

type Thunk = Box<dyn Fn(&Message, DateTime<Utc>) -> Invocation + Send + Sync>;

/// Registered handler with its typed invocation thunk.
pub(crate) struct HandlerEntry {
    pub(crate) key: HandlerKey,
    pub(crate) label: String,
    pub(crate) owner: Option<String>,
    pub(crate) priority: i32,
    sequence: u64,
    invoke: Thunk,
}

impl HandlerEntry {
    pub(crate) fn new<Req, Resp, F>(
        key: HandlerKey,
        label: impl Into<String>,
        owner: Option<String>,
        priority: i32,
        handler: F,
    ) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Request<Req>, &mut Response<Resp>) + Send + Sync + 'static,
    {
        let invoke: Thunk = Box::new(move |message: &Message, received: DateTime<Utc>| {
            let payload = if is_sentinel::<Req>() {
                None
            } else {
                message.payload.as_deref()
            };
            let data = match decode_payload::<Req>(payload) {
                Ok(data) => data,
                Err(err) => {
                    return Invocation::Skipped(format!(
                        "request payload is not a {}: {}",
                        type_name::<Req>(),
                        err
                    ))
                }
            };
            let request = Request {
                sender_id: message.sender_id,
                sender_name: message.sender_name.clone(),
                sent: message.sent,
                received,
                data,
            };
            let mut response = Response::<Resp>::default();
            handler(request, &mut response);

            if is_no_reply::<Resp>() {
                return Invocation::NoReply;
            }
            let payload = match response.data.as_ref() {
                Some(data) => match encode_payload(data) {
                    Ok(payload) => payload,
                    Err(err) => {
                        return Invocation::Skipped(format!("response payload could not be encoded: {err}"))
                    }
                },
                None => None,
            };
            Invocation::Reply {
                success: response.success,
                details: response.details,
                payload,
            }
        });

        Self {
            key,
            label: label.into(),
            owner,
            priority,
            sequence: 0,
            invoke,
        }
    }

    pub(crate) fn invoke(&self, message: &Message, received: DateTime<Utc>) -> Invocation {
        (self.invoke)(message, received)
    }
}

/// Request name to ordered handler list.
#[derive(Default)]
pub(crate) struct HandlerTable {
    by_name: HashMap<String, Vec<Arc<HandlerEntry>>>,
    keys: HashSet<HandlerKey>,
    sequence: u64,
}

impl HandlerTable {
    /// Insert an entry, keeping descending priority then registration order.
    /// Returns `false` when the key was already registered.
    pub(crate) fn insert(&mut self, mut entry: HandlerEntry) -> bool {
        if !self.keys.insert(entry.key.clone()) {
            return false;
        }
        self.sequence += 1;
        entry.sequence = self.sequence;

        let handlers = self.by_name.entry(entry.key.name.clone()).or_default();
        let position = handlers
            .iter()
            .position(|existing| existing.priority < entry.priority)
            .unwrap_or(handlers.len());
        handlers.insert(position, Arc::new(entry));
        debug_assert!(handlers.windows(2).all(|pair| {
            pair[0].priority > pair[1].priority
                || (pair[0].priority == pair[1].priority && pair[0].sequence < pair[1].sequence)
        }));
        true
    }

    /// Snapshot of the handlers for `name`, in invocation order.
    pub(crate) fn lookup(&self, name: &str) -> Vec<Arc<HandlerEntry>> {
        self.by_name
            .get(&name.to_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn contains(&self, key: &HandlerKey) -> bool {
        self.keys.contains(key)
    }

    /// Remove every handler owned by `owner`, returning how many were dropped.
    pub(crate) fn remove_owner(&mut self, owner: &str) -> usize {
        let mut removed = 0;
        for handlers in self.by_name.values_mut() {
            handlers.retain(|entry| {
                let keep = entry.owner.as_deref() != Some(owner);
                if !keep {
                    self.keys.remove(&entry.key);
                    removed += 1;
                }
                keep
            });
        }
        self.by_name.retain(|_, handlers| !handlers.is_empty());
        removed
    }
}
