//! ---
//! ct_section: "02-messaging-ipc-data-model"
//! ct_subsection: "module"
//! ct_type: "source"
//! ct_scope: "code"
//! ct_description: "Message envelopes, exchanges and request dispatch."
//! ct_version: "v0.0.0-prealpha"
//! ct_owner: "tbd"
//! ---
//! JSON codecs for envelopes and the payloads they carry.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::types::Message;
use crate::Result;

const JSON_NULL: &str = "null";

/// Serialize a payload value. `None` is returned for values that encode to JSON
/// `null` so that absent payloads are omitted from the envelope.
pub fn encode_payload<T: Serialize + ?Sized>(value: &T) -> Result<Option<String>> {
    let encoded = serde_json::to_string(value)?;
    if encoded == JSON_NULL {
        Ok(None)
    } else {
        Ok(Some(encoded))
    }
}

/// Deserialize a payload into `T`. An absent payload is decoded as JSON `null`,
/// which succeeds for [`crate::Empty`], `Option<_>` and unit-like types.
pub fn decode_payload<T: DeserializeOwned>(payload: Option<&str>) -> Result<T> {
    Ok(serde_json::from_str(payload.unwrap_or(JSON_NULL))?)
}

/// Serialize an envelope into the bytes handed to a transport.
pub fn encode_message(message: &Message) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

/// Decode raw transport bytes into a validated envelope.
pub fn decode_message(raw: &[u8]) -> Result<Message> {
    let message: Message = serde_json::from_slice(raw)?;
    message.validate()?;
    Ok(message)
}
