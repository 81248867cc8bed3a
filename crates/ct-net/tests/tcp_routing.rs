//! ---
//! ct_section: "15-testing-qa-runbook"
//! ct_subsection: "integration-tests"
//! ct_type: "source"
//! ct_scope: "code"
//! ct_description: "Integration and validation tests for the TCP transport."
//! ct_version: "v0.0.0-prealpha"
//! ct_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use ct_msg::{decode_message, encode_message, encode_payload, Message, SERVICE_ID};
use ct_net::{encode_frame, TcpServerBuilder, TcpTransport};
use ct_router::{
    register_builtin_handlers, ApplicationManifest, ApplicationStore, Router, SubscriptionRequest,
    SubscriptionResponse, NO_SUCH_DESTINATION, SUBSCRIBE_REQUEST,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

async fn send(stream: &mut TcpStream, message: &Message) {
    let body = encode_message(message).expect("encode");
    stream.write_all(&encode_frame(&body)).await.expect("write");
}

async fn recv(stream: &mut TcpStream) -> Message {
    timeout(Duration::from_secs(2), async {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.expect("header");
        let mut body = vec![0u8; u32::from_le_bytes(header) as usize];
        stream.read_exact(&mut body).await.expect("body");
        decode_message(&body).expect("decode")
    })
    .await
    .expect("response in time")
}

#[tokio::test]
async fn simulator_subscribes_and_pings_over_tcp() {
    let store = Arc::new(ApplicationStore::new());
    let transport = Arc::new(TcpTransport::new());
    let router = Router::builder(store.clone(), transport.clone()).build();
    register_builtin_handlers(&router).expect("handlers");

    let server = TcpServerBuilder::new("127.0.0.1:0".parse().expect("addr"), transport, router.clone())
        .spawn()
        .await
        .expect("spawn");
    let mut client = TcpStream::connect(server.local_addr()).await.expect("connect");

    let subscribe = Message::request(
        SERVICE_ID,
        SUBSCRIBE_REQUEST,
        encode_payload(&SubscriptionRequest::simulator(ApplicationManifest {
            name: "Sketch".into(),
            ..ApplicationManifest::default()
        }))
        .expect("payload"),
    );
    send(&mut client, &subscribe).await;
    let reply = recv(&mut client).await;
    assert_eq!(reply.correlation_id, subscribe.id());
    assert!(reply.success);
    assert_eq!(reply.sender_id, SERVICE_ID);
    let response: SubscriptionResponse =
        serde_json::from_str(reply.payload.as_deref().expect("payload")).expect("subscription response");

    let ping = Message::request(SERVICE_ID, "PING", None);
    send(&mut client, &ping).await;
    let pong = recv(&mut client).await;
    assert_eq!(pong.correlation_id, ping.id());
    assert!(pong.success);
    assert_eq!(pong.destination_id, response.subscriber_id);

    let lost = Message::request(response.subscriber_id + 100, "hello", None);
    send(&mut client, &lost).await;
    let failure = recv(&mut client).await;
    assert_eq!(failure.correlation_id, lost.id());
    assert!(!failure.success);
    assert_eq!(failure.details.as_deref(), Some(NO_SUCH_DESTINATION));

    drop(client);
    timeout(Duration::from_secs(2), async {
        while store.instances().iter().any(|r| r.id == response.subscriber_id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("simulated instance removed after disconnect");

    server.shutdown().await.expect("shutdown");
}
