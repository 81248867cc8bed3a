//! ---
//! ct_section: "03-application-registry-routing"
//! ct_subsection: "module"
//! ct_type: "source"
//! ct_scope: "code"
//! ct_description: "Connection binding, instance registry and message routing."
//! ct_version: "v0.0.0-prealpha"
//! ct_owner: "tbd"
//! ---
//! In-memory [`InstanceRegistry`] backed by the installed applications directory.
//!
//! Each installed application lives in `<root>/<folder>/` with a `manifest.json`,
//! an `icon.*` file and the executable named by the manifest. Folders that do not
//! satisfy all three are skipped with a warning.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use ct_msg::{ConnectionId, InstanceId};
use indexmap::IndexMap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::manifest::{ApplicationInfo, ApplicationManifest, ApplicationState, ApplicationsManifest};
use crate::registry::{
    InstanceRecord, InstanceRegistry, RegistryChanged, RegistryError, FIRST_INSTANCE_ID,
};

const MANIFEST_FILE_NAME: &str = "manifest.json";
const ICON_FILE_STEM: &str = "icon";
const CHANGE_CHANNEL_CAPACITY: usize = 64;
const INVALID_NAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Application discovered in the applications directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledApplication {
    pub info: ApplicationInfo,
    pub manifest: ApplicationManifest,
    pub directory: PathBuf,
    pub executable: PathBuf,
}

pub struct ApplicationStore {
    applications: RwLock<IndexMap<String, InstalledApplication>>,
    instances: RwLock<BTreeMap<InstanceId, InstanceRecord>>,
    next_app_id: AtomicU32,
    next_instance_id: AtomicU32,
    generation: AtomicU64,
    changes: broadcast::Sender<RegistryChanged>,
}

impl Default for ApplicationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ApplicationStore {
    /// Empty store without installed applications.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            applications: RwLock::new(IndexMap::new()),
            instances: RwLock::new(BTreeMap::new()),
            next_app_id: AtomicU32::new(1),
            next_instance_id: AtomicU32::new(FIRST_INSTANCE_ID),
            generation: AtomicU64::new(0),
            changes,
        }
    }

    /// Receive one [`RegistryChanged`] per [`InstanceRegistry::notify_changed`] call.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryChanged> {
        self.changes.subscribe()
    }

    /// Scan `root` for installed applications. Returns how many were added.
    ///
    /// A missing root is not an error; it simply holds no applications.
    pub fn load_from_directory(&self, root: &Path) -> Result<usize, RegistryError> {
        if !root.is_dir() {
            info!(path = %root.display(), "applications directory not found; no applications installed");
            return Ok(0);
        }
        let entries = fs::read_dir(root).map_err(|err| RegistryError::Directory {
            path: root.display().to_string(),
            reason: err.to_string(),
        })?;

        let mut folders: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        folders.sort();

        let mut added = 0;
        for folder in folders {
            match self.read_application(&folder) {
                Ok((manifest, executable, icon)) => {
                    let key = manifest.name.to_lowercase();
                    let mut applications = self.applications.write();
                    if applications.contains_key(&key) {
                        warn!(
                            folder = %folder.display(),
                            name = %manifest.name,
                            "skipping application with a duplicate name"
                        );
                        continue;
                    }
                    let app_id = self.next_app_id.fetch_add(1, Ordering::Relaxed);
                    let info = ApplicationInfo::from_manifest(
                        app_id,
                        &manifest,
                        Some(icon.display().to_string()),
                    );
                    info!(name = %info.name, app_id, "registered application");
                    applications.insert(
                        key,
                        InstalledApplication {
                            info,
                            manifest,
                            directory: folder,
                            executable,
                        },
                    );
                    added += 1;
                }
                Err(reason) => {
                    warn!(folder = %folder.display(), %reason, "failed to register application");
                }
            }
        }
        Ok(added)
    }

    fn read_application(&self, folder: &Path) -> Result<(ApplicationManifest, PathBuf, PathBuf), String> {
        let files: Vec<PathBuf> = fs::read_dir(folder)
            .map_err(|err| format!("unreadable folder: {err}"))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();

        let manifest_path = files
            .iter()
            .find(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.eq_ignore_ascii_case(MANIFEST_FILE_NAME))
            })
            .ok_or_else(|| format!("no {MANIFEST_FILE_NAME} file"))?;
        let raw = fs::read_to_string(manifest_path).map_err(|err| format!("unreadable manifest: {err}"))?;
        let manifest: ApplicationManifest =
            serde_json::from_str(&raw).map_err(|err| format!("manifest is not valid JSON: {err}"))?;

        validate_name(&manifest.name)?;

        let icon = files
            .iter()
            .find(|path| {
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .is_some_and(|stem| stem.eq_ignore_ascii_case(ICON_FILE_STEM))
            })
            .cloned()
            .ok_or_else(|| "no icon file in the application folder".to_owned())?;

        let executable = manifest
            .executable_path
            .as_deref()
            .filter(|path| !path.trim().is_empty())
            .map(|path| folder.join(path))
            .filter(|path| path.is_file())
            .ok_or_else(|| "manifest does not name an existing executable".to_owned())?;

        Ok((manifest, executable, icon))
    }

    /// Installed applications in discovery order.
    pub fn applications(&self) -> Vec<InstalledApplication> {
        self.applications.read().values().cloned().collect()
    }

    /// Installed application by case-insensitive name.
    pub fn application(&self, name: &str) -> Option<InstalledApplication> {
        self.applications.read().get(&name.to_lowercase()).cloned()
    }

    /// Record an instance launched for `app_name` whose process will subscribe later.
    pub fn register_instance(&self, app_name: &str, process_id: u32) -> Result<InstanceRecord, RegistryError> {
        let app = self
            .application(app_name)
            .ok_or_else(|| RegistryError::UnknownApplication(app_name.to_owned()))?;
        let record = InstanceRecord {
            id: self.next_instance_id.fetch_add(1, Ordering::Relaxed),
            app: app.info,
            connection: None,
            process_id: Some(process_id),
            is_simulated: false,
            state: ApplicationState::Starting,
        };
        self.instances.write().insert(record.id, record.clone());
        info!(instance_id = record.id, app = %record.app.name, process_id, "registered application instance");
        self.notify_changed();
        Ok(record)
    }

    pub fn instances(&self) -> Vec<InstanceRecord> {
        self.instances.read().values().cloned().collect()
    }
}

fn validate_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("manifest has an empty application name".to_owned());
    }
    if name.chars().any(|c| c.is_control() || INVALID_NAME_CHARS.contains(&c)) {
        return Err(format!("application name {name:?} is not a valid folder name"));
    }
    Ok(())
}

impl InstanceRegistry for ApplicationStore {
    fn by_connection(&self, connection: ConnectionId) -> Option<InstanceRecord> {
        self.instances
            .read()
            .values()
            .find(|record| record.connection == Some(connection))
            .cloned()
    }

    fn by_id(&self, id: InstanceId) -> Option<InstanceRecord> {
        self.instances.read().get(&id).cloned()
    }

    fn by_process_id(&self, process_id: u32) -> Option<InstanceRecord> {
        self.instances
            .read()
            .values()
            .find(|record| record.process_id == Some(process_id))
            .cloned()
    }

    fn bind(&self, id: InstanceId, connection: ConnectionId) -> Result<InstanceRecord, RegistryError> {
        let mut instances = self.instances.write();
        let record = instances.get_mut(&id).ok_or(RegistryError::UnknownInstance(id))?;
        if record.connection.is_some() {
            return Err(RegistryError::AlreadySubscribed(id));
        }
        record.connection = Some(connection);
        record.state = ApplicationState::Running;
        debug!(instance_id = id, connection, "bound connection");
        Ok(record.clone())
    }

    fn unbind_connection(&self, connection: ConnectionId) -> Vec<InstanceRecord> {
        let mut released = Vec::new();
        for record in self.instances.write().values_mut() {
            if record.connection == Some(connection) {
                released.push(record.clone());
                record.connection = None;
            }
        }
        released
    }

    fn create_simulated(&self, manifest: &ApplicationManifest) -> Result<InstanceRecord, RegistryError> {
        validate_name(&manifest.name).map_err(RegistryError::InvalidManifest)?;
        let app_id = self.next_app_id.fetch_add(1, Ordering::Relaxed);
        let record = InstanceRecord {
            id: self.next_instance_id.fetch_add(1, Ordering::Relaxed),
            app: ApplicationInfo::from_manifest(app_id, manifest, None),
            connection: None,
            process_id: None,
            is_simulated: true,
            state: ApplicationState::Running,
        };
        self.instances.write().insert(record.id, record.clone());
        info!(instance_id = record.id, app = %record.app.name, "created simulated instance");
        Ok(record)
    }

    fn remove(&self, id: InstanceId) -> Option<InstanceRecord> {
        self.instances.write().remove(&id)
    }

    fn connected(&self) -> Vec<InstanceRecord> {
        self.instances
            .read()
            .values()
            .filter(|record| record.is_connected())
            .cloned()
            .collect()
    }

    fn notify_changed(&self) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        // No receivers is fine: nobody is listening yet.
        let _ = self.changes.send(RegistryChanged { generation });
    }

    fn manifest(&self) -> ApplicationsManifest {
        ApplicationsManifest {
            installed_applications: self
                .applications
                .read()
                .values()
                .map(|app| app.info.clone())
                .collect(),
            running_applications: self
                .instances
                .read()
                .values()
                .map(InstanceRecord::to_info)
                .collect(),
        }
    }
}
