//! ---
//! ct_section: "15-testing-qa-runbook"
//! ct_subsection: "integration-tests"
//! ct_type: "source"
//! ct_scope: "code"
//! ct_description: "Integration and validation tests for connection binding and routing."
//! ct_version: "v0.0.0-prealpha"
//! ct_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use ct_msg::{
    decode_message, encode_message, ConnectionId, Dispatcher, Empty, Exchange, InMemoryTransport,
    InstanceId, Message, NoReply, SERVICE_ID,
};
use ct_router::{
    register_builtin_handlers, spawn_change_broadcaster, ApplicationInstanceInfo,
    ApplicationManifest, ApplicationStore, ApplicationsManifest, InstanceRegistry, Router,
    SubscriptionRequest, SubscriptionResponse, FIRST_INSTANCE_ID, NO_SUCH_DESTINATION,
    SUBSCRIBE_REQUEST,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Point {
    x: i32,
}

/// Service plus in-process clients wired through the in-memory transport.
struct Table {
    store: Arc<ApplicationStore>,
    transport: InMemoryTransport,
    router: Arc<Router>,
    clients: Mutex<Vec<(ConnectionId, Dispatcher)>>,
}

impl Table {
    fn new() -> Self {
        Self::with_store(ApplicationStore::new())
    }

    fn with_store(store: ApplicationStore) -> Self {
        let store = Arc::new(store);
        let transport = InMemoryTransport::new();
        let router = Router::builder(store.clone(), Arc::new(transport.clone()))
            .service_name("CoffeeTable")
            .request_timeout(Duration::from_millis(200))
            .build();
        register_builtin_handlers(&router).expect("builtin handlers");
        Self {
            store,
            transport,
            router,
            clients: Mutex::new(Vec::new()),
        }
    }

    fn connect(&self, connection: ConnectionId) -> Dispatcher {
        self.transport.open(connection);
        let router = self.router.clone();
        let dispatcher = Dispatcher::builder()
            .label(format!("client-{connection}"))
            .timeout(Duration::from_millis(200))
            .build(move |message: Message| {
                let frame = encode_message(&message).expect("encode");
                router.on_message_received(connection, &frame);
            });
        self.clients
            .lock()
            .unwrap()
            .push((connection, dispatcher.clone()));
        dispatcher
    }

    fn disconnect(&self, connection: ConnectionId) {
        self.transport.close(connection);
        self.clients.lock().unwrap().retain(|(id, _)| *id != connection);
        self.router.on_client_disconnected(connection);
    }

    /// Deliver queued frames to clients until the system is quiet.
    fn pump(&self) -> usize {
        let mut delivered = 0;
        loop {
            let clients = self.clients.lock().unwrap().clone();
            let mut progressed = false;
            for (connection, dispatcher) in clients {
                for frame in self.transport.drain(connection) {
                    dispatcher.receive(decode_message(&frame).expect("decode"));
                    delivered += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return delivered;
            }
        }
    }

    fn subscribe(&self, client: &Dispatcher, request: &SubscriptionRequest) -> Exchange<SubscriptionResponse> {
        let exchange = client
            .send(SERVICE_ID, SUBSCRIBE_REQUEST, request)
            .expect("send subscribe");
        self.pump();
        exchange
    }

    fn join_simulated(&self, connection: ConnectionId, name: &str) -> (Dispatcher, InstanceId) {
        let client = self.connect(connection);
        let manifest = ApplicationManifest {
            name: name.to_owned(),
            ..ApplicationManifest::default()
        };
        let exchange = self.subscribe(&client, &SubscriptionRequest::simulator(manifest));
        let outcome = exchange.outcome().expect("subscription answered");
        assert!(outcome.success, "subscription failed: {:?}", outcome.details);
        let id = outcome.data.as_ref().expect("subscription payload").subscriber_id;
        (client, id)
    }
}

fn install(root: &Path, name: &str) {
    let dir = root.join(name.to_lowercase());
    fs::create_dir_all(&dir).expect("app dir");
    fs::write(
        dir.join("manifest.json"),
        format!(r#"{{"Name":"{name}","ExecutablePath":"app.exe"}}"#),
    )
    .expect("manifest");
    fs::write(dir.join("icon.png"), b"png").expect("icon");
    fs::write(dir.join("app.exe"), b"bin").expect("exe");
}

#[test]
fn ping_completes_with_success() {
    let table = Table::new();
    let (a, _) = table.join_simulated(10, "Alpha");

    let exchange: Exchange<Empty> = a.send(SERVICE_ID, "ping", &Empty).expect("send ping");
    table.pump();

    let outcome = exchange.outcome().expect("ping answered");
    assert!(outcome.success);
    assert!(!outcome.timed_out);
}

#[test]
fn echo_between_applications_is_routed_with_sender_identity() {
    let table = Table::new();
    let (a, a_id) = table.join_simulated(10, "Alpha");
    let (b, b_id) = table.join_simulated(11, "Beta");
    assert_ne!(a_id, b_id);

    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    b.register_fn::<Point, Point, _>("echo", 0, move |request, response| {
        *sink.lock().unwrap() = Some((request.sender_id, request.sender_name.clone()));
        response.reply(Point {
            x: request.data.x * 2,
        });
    })
    .expect("register echo");

    let exchange: Exchange<Point> = a.send(b_id, "echo", &Point { x: 5 }).expect("send");
    table.pump();

    let outcome = exchange.outcome().expect("echo answered");
    assert!(outcome.success);
    assert_eq!(outcome.data, Some(Point { x: 10 }));
    assert_eq!(
        seen.lock().unwrap().clone(),
        Some((a_id, Some("Alpha".to_owned())))
    );
}

#[test]
fn unknown_process_id_leaves_connection_unbound() {
    let table = Table::new();
    let client = table.connect(20);

    let exchange = table.subscribe(&client, &SubscriptionRequest::for_process(9999));
    let outcome = exchange.outcome().expect("subscription answered");
    assert!(!outcome.success);
    assert!(table.store.by_connection(20).is_none());

    let ping: Exchange<Empty> = client.send(SERVICE_ID, "ping", &Empty).expect("send");
    table.pump();
    let outcome = ping.outcome().expect("rejected");
    assert!(!outcome.success);
    assert!(outcome
        .details
        .as_deref()
        .unwrap_or_default()
        .contains("not subscribed"));
}

#[test]
fn launched_instances_subscribe_by_process_id_once() {
    let root = tempfile::tempdir().expect("tempdir");
    install(root.path(), "Clock");
    let store = ApplicationStore::new();
    store.load_from_directory(root.path()).expect("load apps");
    let table = Table::with_store(store);
    let launched = table.store.register_instance("clock", 4242).expect("launch");
    assert!(launched.id >= FIRST_INSTANCE_ID);

    let client = table.connect(30);
    let outcome = table
        .subscribe(&client, &SubscriptionRequest::for_process(4242))
        .outcome()
        .expect("answered");
    assert!(outcome.success);
    let response = outcome.data.as_ref().expect("payload");
    assert_eq!(response.subscriber_id, launched.id);
    assert_eq!(response.apps_manifest.installed_applications.len(), 1);

    let intruder = table.connect(31);
    let outcome = table
        .subscribe(&intruder, &SubscriptionRequest::for_process(4242))
        .outcome()
        .expect("answered");
    assert!(!outcome.success);
    assert!(outcome
        .details
        .as_deref()
        .unwrap_or_default()
        .contains("already subscribed"));
    assert_eq!(table.store.by_connection(30).map(|r| r.id), Some(launched.id));
    assert!(table.store.by_connection(31).is_none());
}

#[test]
fn unknown_destination_yields_one_failure_and_no_forwarding() {
    let table = Table::new();
    let (a, _) = table.join_simulated(10, "Alpha");
    let (b, _) = table.join_simulated(11, "Beta");
    let b_hits = Arc::new(AtomicUsize::new(0));
    let counter = b_hits.clone();
    b.register_fn::<Empty, Empty, _>("echo", 0, move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .expect("register");
    table.pump();

    let exchange: Exchange<Empty> = a.send(999, "echo", &Empty).expect("send");
    assert!(table.transport.drain(11).is_empty(), "nothing forwarded to B");
    let frames = table.transport.drain(10);
    assert_eq!(frames.len(), 1, "exactly one failure response");
    a.receive(decode_message(&frames[0]).expect("decode"));

    let outcome = exchange.outcome().expect("failed fast");
    assert!(!outcome.success);
    assert!(!outcome.timed_out);
    assert_eq!(outcome.details.as_deref(), Some(NO_SUCH_DESTINATION));
    assert_eq!(b_hits.load(Ordering::SeqCst), 0);
}

#[test]
fn service_requests_to_missing_destinations_fail_immediately() {
    let table = Table::new();
    let exchange: Exchange<Empty> = table
        .router
        .dispatcher()
        .send(77, "hello", &Empty)
        .expect("send");
    let outcome = exchange.outcome().expect("completed without waiting");
    assert!(!outcome.success);
    assert_eq!(outcome.details.as_deref(), Some(NO_SUCH_DESTINATION));
    assert_eq!(table.router.dispatcher().pending_count(), 0);
}

#[test]
fn service_requests_reach_connected_clients() {
    let table = Table::new();
    let (client, id) = table.join_simulated(10, "Alpha");
    client
        .register_fn::<Empty, String, _>("whoami", 0, |request, response| {
            response.reply(format!("{}:{}", request.sender_id, request.sender_name.unwrap_or_default()));
        })
        .expect("register");

    let exchange: Exchange<String> = table
        .router
        .dispatcher()
        .send(id, "whoami", &Empty)
        .expect("send");
    table.pump();
    assert_eq!(
        exchange.outcome().expect("answered").data.as_deref(),
        Some("1:CoffeeTable")
    );
}

#[test]
fn simulated_disconnect_removes_instance_and_notifies_once() {
    let table = Table::new();
    let (_client, id) = table.join_simulated(10, "Alpha");
    let mut changes = table.store.subscribe();

    table.disconnect(10);

    assert!(table.store.by_id(id).is_none());
    assert!(changes.try_recv().is_ok());
    assert!(changes.try_recv().is_err(), "exactly one change notification");
}

#[test]
fn launched_disconnect_only_clears_binding() -> Result<()> {
    let root = tempfile::tempdir()?;
    install(root.path(), "Clock");
    let store = ApplicationStore::new();
    store.load_from_directory(root.path())?;
    let table = Table::with_store(store);
    let launched = table.store.register_instance("Clock", 7)?;
    let client = table.connect(40);
    let subscribed = table.subscribe(&client, &SubscriptionRequest::for_process(7));
    assert!(subscribed.outcome().context("subscription not answered")?.success);
    let mut changes = table.store.subscribe();

    table.disconnect(40);

    let record = table.store.by_id(launched.id).context("launched instance dropped")?;
    assert!(!record.is_connected());
    assert!(table.store.by_connection(40).is_none());
    assert!(changes.try_recv().is_err(), "no change notification for a launched instance");

    let again = table.connect(41);
    let resubscribed = table.subscribe(&again, &SubscriptionRequest::for_process(7));
    assert!(resubscribed.outcome().context("subscription not answered")?.success);
    Ok(())
}

#[test]
fn undeliverable_responses_are_dropped_without_failure() -> Result<()> {
    let table = Table::new();
    let (_client, _) = table.join_simulated(10, "Alpha");

    let stray = Message::response(42, 999, true, None, None);
    table.router.on_message_received(10, &encode_message(&stray)?);

    assert!(table.transport.drain(10).is_empty(), "no failure answers a response");
    Ok(())
}

#[test]
fn apps_request_lists_running_instances() {
    let table = Table::new();
    let (a, a_id) = table.join_simulated(10, "Alpha");

    let exchange: Exchange<ApplicationsManifest> = a.send(SERVICE_ID, "APPS", &Empty).expect("send");
    table.pump();

    let manifest = exchange.outcome().expect("answered").data.clone().expect("manifest");
    let running = manifest
        .running_applications
        .iter()
        .find(|info| info.destination_id == a_id)
        .expect("own instance listed");
    assert!(running.is_simulator);
    assert!(running.connection.is_client_connected);
    assert_eq!(running.app_info.name, "Alpha");
}

#[test]
fn malformed_frames_are_dropped() {
    let table = Table::new();
    let (_client, _) = table.join_simulated(10, "Alpha");
    table.router.on_message_received(10, b"{ not json");
    table.router.on_message_received(10, br#"{"DestinationId":1,"Id":3,"Sent":"2024-01-01T00:00:00Z"}"#);
    assert!(table.transport.drain(10).is_empty());
}

#[tokio::test]
async fn registry_changes_are_broadcast_to_connected_clients() {
    let table = Table::new();
    let changes = table.store.subscribe();
    let broadcaster = spawn_change_broadcaster(table.router.clone(), changes);

    let (client, id) = table.join_simulated(10, "Alpha");
    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = updates.clone();
    client
        .register_fn::<Vec<ApplicationInstanceInfo>, NoReply, _>("update", 0, move |request, _| {
            sink.lock().unwrap().push(request.data);
        })
        .expect("register update");

    tokio::time::sleep(Duration::from_millis(50)).await;
    table.pump();

    let updates = updates.lock().unwrap();
    assert!(!updates.is_empty(), "subscription change was broadcast");
    assert!(updates
        .last()
        .expect("update")
        .iter()
        .any(|info| info.destination_id == id));
    broadcaster.abort();
}
