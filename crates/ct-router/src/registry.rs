//! ---
//! ct_section: "03-application-registry-routing"
//! ct_subsection: "module"
//! ct_type: "source"
//! ct_scope: "code"
//! ct_description: "Connection binding, instance registry and message routing."
//! ct_version: "v0.0.0-prealpha"
//! ct_owner: "tbd"
//! ---
use ct_msg::{ConnectionId, InstanceId};

use crate::manifest::{
    ApplicationInfo, ApplicationInstanceInfo, ApplicationManifest, ApplicationState,
    ApplicationsManifest, ConnectionStatus,
};

/// Reserved for the left sidebar surface.
pub const LEFT_SIDEBAR_ID: InstanceId = 2;
/// Reserved for the right sidebar surface.
pub const RIGHT_SIDEBAR_ID: InstanceId = 3;
/// Reserved for the home screen surface.
pub const HOMESCREEN_ID: InstanceId = 4;
/// First id handed to application instances.
pub const FIRST_INSTANCE_ID: InstanceId = 5;

/// Failures raised by registry lookups and mutations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("no instance with id {0}")]
    UnknownInstance(InstanceId),
    #[error("no registered instance for process id {0}")]
    UnknownProcess(u32),
    #[error("no installed application named {0:?}")]
    UnknownApplication(String),
    #[error("instance {0} is already subscribed")]
    AlreadySubscribed(InstanceId),
    #[error("invalid application manifest: {0}")]
    InvalidManifest(String),
    #[error("failed to read applications directory {path}: {reason}")]
    Directory { path: String, reason: String },
}

/// One application instance known to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub app: ApplicationInfo,
    pub connection: Option<ConnectionId>,
    pub process_id: Option<u32>,
    pub is_simulated: bool,
    pub state: ApplicationState,
}

impl InstanceRecord {
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn to_info(&self) -> ApplicationInstanceInfo {
        ApplicationInstanceInfo {
            app_info: self.app.clone(),
            destination_id: self.id,
            connection: ConnectionStatus::from_binding(self.connection),
            state: self.state,
            is_simulator: self.is_simulated,
        }
    }
}

/// Emitted on the registry's change channel whenever instances or bindings change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryChanged {
    /// Monotonic counter of notifications.
    pub generation: u64,
}

/// Lookup table the router consults to resolve connections and destinations.
///
/// Mutations never notify on their own; the caller batches them and calls
/// [`InstanceRegistry::notify_changed`] once per logical change.
pub trait InstanceRegistry: Send + Sync {
    /// Instance currently bound to `connection`.
    fn by_connection(&self, connection: ConnectionId) -> Option<InstanceRecord>;

    fn by_id(&self, id: InstanceId) -> Option<InstanceRecord>;

    fn by_process_id(&self, process_id: u32) -> Option<InstanceRecord>;

    /// Bind `connection` to instance `id` and mark it running.
    fn bind(&self, id: InstanceId, connection: ConnectionId) -> Result<InstanceRecord, RegistryError>;

    /// Clear the binding of every instance bound to `connection`, returning them
    /// as they were before the binding was cleared.
    fn unbind_connection(&self, connection: ConnectionId) -> Vec<InstanceRecord>;

    /// Synthesize a running, unbound simulated instance from a client-supplied manifest.
    fn create_simulated(&self, manifest: &ApplicationManifest) -> Result<InstanceRecord, RegistryError>;

    fn remove(&self, id: InstanceId) -> Option<InstanceRecord>;

    /// Instances with a live connection binding.
    fn connected(&self) -> Vec<InstanceRecord>;

    /// Announce one change to external listeners.
    fn notify_changed(&self);

    /// Installed applications and running instances.
    fn manifest(&self) -> ApplicationsManifest;
}
