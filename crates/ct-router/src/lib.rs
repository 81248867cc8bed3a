//! ---
//! ct_section: "03-application-registry-routing"
//! ct_subsection: "module"
//! ct_type: "source"
//! ct_scope: "code"
//! ct_description: "Connection binding, instance registry and message routing."
//! ct_version: "v0.0.0-prealpha"
//! ct_owner: "tbd"
//! ---
//! Star-topology routing for the coffee table service.
//!
//! Applications connect to the service over a byte transport. The [`Router`]
//! binds each connection to an application instance through the subscription
//! handshake, stamps the sender identity on every inbound message and delivers
//! it either to the service's own dispatcher or to the destination instance's
//! connection.

pub mod manifest;
pub mod registry;
pub mod router;
pub mod service;
pub mod store;
pub mod subscription;

pub use manifest::{
    ApplicationInfo, ApplicationInstanceInfo, ApplicationManifest, ApplicationState,
    ApplicationType, ApplicationsManifest, ConnectionStatus,
};
pub use registry::{
    InstanceRecord, InstanceRegistry, RegistryChanged, RegistryError, FIRST_INSTANCE_ID,
    HOMESCREEN_ID, LEFT_SIDEBAR_ID, RIGHT_SIDEBAR_ID,
};
pub use router::{Router, RouterBuilder, NO_SUCH_DESTINATION};
pub use service::{
    broadcast_update, register_builtin_handlers, spawn_change_broadcaster, APPS_REQUEST,
    PING_REQUEST, UPDATE_NOTIFICATION,
};
pub use store::{ApplicationStore, InstalledApplication};
pub use subscription::{SubscriptionRequest, SubscriptionResponse, SUBSCRIBE_REQUEST};
