//! ---
//! ct_section: "05-networking-external-interfaces"
//! ct_subsection: "module"
//! ct_type: "source"
//! ct_scope: "code"
//! ct_description: "Network connectivity for table applications."
//! ct_version: "v0.0.0-prealpha"
//! ct_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use ct_msg::{ConnectionHandler, ConnectionId, MessagingError, Transport};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::frame::{encode_frame, FrameDecoder};

const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

type ConnectionObserver = Arc<dyn Fn(bool) + Send + Sync>;

/// Outbound half of the TCP transport: one writer queue per open connection.
pub struct TcpTransport {
    writers: Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<Bytes>>>,
    next_id: AtomicU64,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransport {
    /// Transport without open connections.
    pub fn new() -> Self {
        Self {
            writers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.writers.lock().len()
    }

    fn register(&self) -> (ConnectionId, mpsc::UnboundedReceiver<Bytes>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.writers.lock().insert(id, tx);
        (id, rx)
    }

    fn unregister(&self, connection: ConnectionId) {
        self.writers.lock().remove(&connection);
    }
}

impl Transport for TcpTransport {
    fn send(&self, connection: ConnectionId, frame: Bytes) -> ct_msg::Result<()> {
        let writers = self.writers.lock();
        let writer = writers
            .get(&connection)
            .ok_or(MessagingError::ConnectionClosed(connection))?;
        writer
            .send(encode_frame(&frame))
            .map_err(|_| MessagingError::ConnectionClosed(connection))
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

/// Builder for the TCP server accepting application connections.
pub struct TcpServerBuilder {
    listen: SocketAddr,
    max_frame_bytes: usize,
    transport: Arc<TcpTransport>,
    handler: Arc<dyn ConnectionHandler>,
    observer: Option<ConnectionObserver>,
}

impl TcpServerBuilder {
    /// Create a builder bound to `listen` feeding frames to `handler`.
    pub fn new(listen: SocketAddr, transport: Arc<TcpTransport>, handler: Arc<dyn ConnectionHandler>) -> Self {
        Self {
            listen,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            transport,
            handler,
            observer: None,
        }
    }

    /// Close connections announcing frames above this size.
    pub fn max_frame_bytes(mut self, limit: usize) -> Self {
        self.max_frame_bytes = limit;
        self
    }

    /// Called with `true` when a connection opens and `false` when it closes.
    pub fn on_connection_change(mut self, observer: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Bind the listener and spawn the accept loop.
    pub async fn spawn(self) -> anyhow::Result<TcpServerHandle> {
        let listener = TcpListener::bind(self.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "tcp transport listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            listener,
            self.transport,
            self.handler,
            self.observer,
            self.max_frame_bytes,
            shutdown_rx,
        ));

        Ok(TcpServerHandle {
            address: local_addr,
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// Handle for the running TCP server.
pub struct TcpServerHandle {
    address: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TcpServerHandle {
    /// Return the bound listening address.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Stop accepting, close every connection and await completion.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(()) => Ok(()),
            Err(err) => Err(anyhow::anyhow!(err)),
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    transport: Arc<TcpTransport>,
    handler: Arc<dyn ConnectionHandler>,
    observer: Option<ConnectionObserver>,
    max_frame_bytes: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = Vec::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        connections.retain(|task: &JoinHandle<()>| !task.is_finished());
                        connections.push(tokio::spawn(serve_connection(
                            stream,
                            peer,
                            transport.clone(),
                            handler.clone(),
                            observer.clone(),
                            max_frame_bytes,
                            shutdown.clone(),
                        )));
                    }
                    Err(err) => warn!(error = %err, "failed to accept connection"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    for connection in connections {
        let _ = connection.await;
    }
    info!("tcp transport stopped");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    transport: Arc<TcpTransport>,
    handler: Arc<dyn ConnectionHandler>,
    observer: Option<ConnectionObserver>,
    max_frame_bytes: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, writer) = stream.into_split();
    let (connection, outbound) = transport.register();
    info!(connection, %peer, "client connected");
    if let Some(observer) = &observer {
        observer(true);
    }

    let writer_task = tokio::spawn(write_loop(connection, writer, outbound));
    let mut decoder = FrameDecoder::new(max_frame_bytes);

    'read: loop {
        tokio::select! {
            read = reader.read_buf(decoder.buffer_mut()) => {
                match read {
                    Ok(0) => break 'read,
                    Ok(_) => loop {
                        match decoder.next_frame() {
                            Ok(Some(frame)) => handler.on_frame(connection, &frame),
                            Ok(None) => break,
                            Err(err) => {
                                warn!(connection, error = %err, "closing connection after invalid frame");
                                break 'read;
                            }
                        }
                    },
                    Err(err) => {
                        debug!(connection, error = %err, "read failed");
                        break 'read;
                    }
                }
            }
            _ = shutdown.changed() => break 'read,
        }
    }

    transport.unregister(connection);
    handler.on_disconnected(connection);
    // The writer drains what is queued and exits once its sender is dropped.
    let _ = writer_task.await;
    if let Some(observer) = &observer {
        observer(false);
    }
    info!(connection, %peer, "client disconnected");
}

async fn write_loop(
    connection: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(err) = writer.write_all(&frame).await {
            debug!(connection, error = %err, "write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    /// Echoes every frame back to its sender.
    struct Echo {
        transport: Arc<TcpTransport>,
        disconnected: Mutex<Vec<ConnectionId>>,
    }

    impl ConnectionHandler for Echo {
        fn on_frame(&self, connection: ConnectionId, frame: &[u8]) {
            let _ = self.transport.send(connection, Bytes::copy_from_slice(frame));
        }

        fn on_disconnected(&self, connection: ConnectionId) {
            self.disconnected.lock().push(connection);
        }
    }

    async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.expect("header");
        let mut body = vec![0u8; u32::from_le_bytes(header) as usize];
        stream.read_exact(&mut body).await.expect("body");
        body
    }

    #[tokio::test]
    async fn frames_are_echoed_and_disconnects_reported() {
        let transport = Arc::new(TcpTransport::new());
        let echo = Arc::new(Echo {
            transport: transport.clone(),
            disconnected: Mutex::new(Vec::new()),
        });
        let handle = TcpServerBuilder::new("127.0.0.1:0".parse().expect("addr"), transport.clone(), echo.clone())
            .max_frame_bytes(1024)
            .spawn()
            .await
            .expect("spawn");

        let mut client = TcpStream::connect(handle.local_addr()).await.expect("connect");
        let mut burst = Vec::new();
        burst.extend_from_slice(&encode_frame(b"first"));
        burst.extend_from_slice(&encode_frame(b"second"));
        client.write_all(&burst).await.expect("write");

        assert_eq!(read_frame(&mut client).await, b"first");
        assert_eq!(read_frame(&mut client).await, b"second");
        assert_eq!(transport.connection_count(), 1);

        drop(client);
        timeout(Duration::from_secs(2), async {
            while echo.disconnected.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("disconnect observed");
        assert_eq!(transport.connection_count(), 0);

        handle.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn oversized_frames_close_the_connection() {
        let transport = Arc::new(TcpTransport::new());
        let echo = Arc::new(Echo {
            transport: transport.clone(),
            disconnected: Mutex::new(Vec::new()),
        });
        let handle = TcpServerBuilder::new("127.0.0.1:0".parse().expect("addr"), transport.clone(), echo.clone())
            .max_frame_bytes(8)
            .spawn()
            .await
            .expect("spawn");

        let mut client = TcpStream::connect(handle.local_addr()).await.expect("connect");
        client
            .write_all(&encode_frame(b"definitely too long"))
            .await
            .expect("write");

        let mut buf = [0u8; 16];
        let read = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("server closes connection");
        assert!(matches!(read, Ok(0) | Err(_)));

        handle.shutdown().await.expect("shutdown");
    }

    #[test]
    fn sending_to_unknown_connections_fails() {
        let transport = TcpTransport::new();
        assert!(matches!(
            transport.send(9, Bytes::from_static(b"x")),
            Err(MessagingError::ConnectionClosed(9))
        ));
    }
}
