//! ---
//! ct_section: "03-application-registry-routing"
//! ct_subsection: "module"
//! ct_type: "source"
//! ct_scope: "code"
//! ct_description: "Connection binding, instance registry and message routing."
//! ct_version: "v0.0.0-prealpha"
//! ct_owner: "tbd"
//! ---
//! Requests answered by the service itself and the change broadcaster.

use std::sync::Arc;

use ct_msg::{Empty, MessagingError, Request, RequestHandler, Response};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::manifest::ApplicationsManifest;
use crate::registry::{InstanceRegistry, RegistryChanged};
use crate::router::Router;

/// Liveness probe; answers with an empty success.
pub const PING_REQUEST: &str = "ping";
/// Returns the current [`ApplicationsManifest`].
pub const APPS_REQUEST: &str = "apps";
/// Pushed to every connected instance when the registry changes.
pub const UPDATE_NOTIFICATION: &str = "update";

struct PingHandler;

impl RequestHandler for PingHandler {
    type Request = Empty;
    type Response = Empty;

    fn name(&self) -> &str {
        PING_REQUEST
    }

    fn handle(&self, request: Request<Empty>, _response: &mut Response<Empty>) {
        debug!(sender_id = request.sender_id, "ping");
    }
}

struct AppsHandler {
    registry: Arc<dyn InstanceRegistry>,
}

impl RequestHandler for AppsHandler {
    type Request = Empty;
    type Response = ApplicationsManifest;

    fn name(&self) -> &str {
        APPS_REQUEST
    }

    fn handle(&self, _request: Request<Empty>, response: &mut Response<ApplicationsManifest>) {
        response.reply(self.registry.manifest());
    }
}

/// Register `ping` and `apps` on the router's dispatcher.
pub fn register_builtin_handlers(router: &Router) -> Result<(), MessagingError> {
    let dispatcher = router.dispatcher();
    dispatcher.register(PingHandler)?;
    dispatcher.register(AppsHandler {
        registry: router.registry().clone(),
    })?;
    Ok(())
}

/// Send an `update` carrying the running instances to every connected instance.
/// Returns how many notifications were sent.
pub fn broadcast_update(router: &Router) -> usize {
    let running = router.registry().manifest().running_applications;
    let mut sent = 0;
    for instance in router.registry().connected() {
        match router
            .dispatcher()
            .notify(instance.id, UPDATE_NOTIFICATION, &running)
        {
            Ok(_) => sent += 1,
            Err(err) => warn!(instance_id = instance.id, error = %err, "failed to send update"),
        }
    }
    sent
}

/// Forward every registry change to connected instances until the change
/// channel closes.
pub fn spawn_change_broadcaster(
    router: Arc<Router>,
    mut changes: broadcast::Receiver<RegistryChanged>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => {
                    let sent = broadcast_update(&router);
                    debug!(generation = change.generation, sent, "broadcast registry update");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "change broadcaster lagged behind; sending latest state");
                    broadcast_update(&router);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        info!("change broadcaster stopped");
    })
}
