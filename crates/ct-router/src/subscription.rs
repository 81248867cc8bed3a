//! ---
//! ct_section: "03-application-registry-routing"
//! ct_subsection: "module"
//! ct_type: "source"
//! ct_scope: "code"
//! ct_description: "Connection binding, instance registry and message routing."
//! ct_version: "v0.0.0-prealpha"
//! ct_owner: "tbd"
//! ---
use ct_msg::InstanceId;
use serde::{Deserialize, Serialize};

use crate::manifest::{ApplicationManifest, ApplicationsManifest};

/// The only request an unbound connection may send.
pub const SUBSCRIBE_REQUEST: &str = "subscribe";

/// Payload of the subscription handshake.
///
/// A launched application identifies itself by process id; a simulator instead
/// sets `is_simulator` and describes the application it pretends to be.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubscriptionRequest {
    #[serde(default)]
    pub is_simulator: bool,
    #[serde(default)]
    pub process_id: Option<u32>,
    #[serde(default)]
    pub simulated_application: Option<ApplicationManifest>,
}

impl SubscriptionRequest {
    pub fn for_process(process_id: u32) -> Self {
        Self {
            process_id: Some(process_id),
            ..Self::default()
        }
    }

    pub fn simulator(manifest: ApplicationManifest) -> Self {
        Self {
            is_simulator: true,
            process_id: None,
            simulated_application: Some(manifest),
        }
    }
}

/// Older clients send a bare process id instead of a request object.
#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum SubscriptionPayload {
    ProcessId(u32),
    Request(SubscriptionRequest),
}

impl From<SubscriptionPayload> for SubscriptionRequest {
    fn from(payload: SubscriptionPayload) -> Self {
        match payload {
            SubscriptionPayload::ProcessId(pid) => SubscriptionRequest::for_process(pid),
            SubscriptionPayload::Request(request) => request,
        }
    }
}

/// Successful handshake reply: the current manifest and the subscriber's id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubscriptionResponse {
    pub apps_manifest: ApplicationsManifest,
    pub subscriber_id: InstanceId,
}
