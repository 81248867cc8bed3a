//! ---
//! ct_section: "03-application-registry-routing"
//! ct_subsection: "module"
//! ct_type: "source"
//! ct_scope: "code"
//! ct_description: "Connection binding, instance registry and message routing."
//! ct_version: "v0.0.0-prealpha"
//! ct_owner: "tbd"
//! ---
//! Application and instance manifests shared with clients.
//!
//! Field names are PascalCase on the wire and enums travel as their variant
//! names, matching the JSON the table applications already exchange.

use ct_msg::{ConnectionId, InstanceId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApplicationType {
    #[default]
    Application,
    Sidebar,
    Homescreen,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApplicationState {
    #[default]
    Starting,
    Running,
    Destroyed,
}

/// Contents of an application's `manifest.json`, also carried by simulator subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApplicationManifest {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "Type", default)]
    pub app_type: ApplicationType,
    #[serde(default)]
    pub launch_in_fullscreen: bool,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Relative to the application's folder.
    #[serde(default)]
    pub executable_path: Option<String>,
    #[serde(default)]
    pub launcher_name: Option<String>,
}

/// Installed application as announced to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApplicationInfo {
    pub app_id: u32,
    pub name: String,
    #[serde(rename = "Type")]
    pub app_type: ApplicationType,
    pub author: Option<String>,
    pub description: Option<String>,
    pub icon_path: Option<String>,
    pub launch_in_fullscreen: bool,
}

impl ApplicationInfo {
    pub fn from_manifest(app_id: u32, manifest: &ApplicationManifest, icon_path: Option<String>) -> Self {
        Self {
            app_id,
            name: manifest.name.clone(),
            app_type: manifest.app_type,
            author: manifest.author.clone(),
            description: manifest.description.clone(),
            icon_path,
            launch_in_fullscreen: manifest.launch_in_fullscreen,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectionStatus {
    pub is_client_connected: bool,
    pub service_client_id: ConnectionId,
}

impl ConnectionStatus {
    pub fn from_binding(connection: Option<ConnectionId>) -> Self {
        Self {
            is_client_connected: connection.is_some(),
            service_client_id: connection.unwrap_or_default(),
        }
    }
}

/// Running application instance as announced to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApplicationInstanceInfo {
    pub app_info: ApplicationInfo,
    pub destination_id: InstanceId,
    pub connection: ConnectionStatus,
    pub state: ApplicationState,
    pub is_simulator: bool,
}

/// Snapshot of installed applications and running instances.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ApplicationsManifest {
    pub installed_applications: Vec<ApplicationInfo>,
    pub running_applications: Vec<ApplicationInstanceInfo>,
}
