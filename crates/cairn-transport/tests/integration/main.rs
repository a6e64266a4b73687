//! End-to-end scenarios against the in-memory loopback engine.
//!
//! A dispatcher task listens on a loopback UDP socket; clients run on
//! the same single-threaded runtime, so everything interleaves
//! cooperatively. The loopback engine speaks a miniature frame format
//! instead of QUIC — these tests exercise the orchestration layer, not
//! the wire format.

mod expiry;
mod flow_control;
mod negotiation;
mod streams;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use anyhow::{Context, Result};

use cairn_core::Configuration;
use cairn_engine::testing::LoopbackProvider;
use cairn_engine::tls::{ClientContext, ServerContext};
use cairn_engine::EngineProvider;
use cairn_transport::{
    Client, Connection, ConnectionHandler, Dispatcher, HandlerFactory, Path, Socket, Stream,
};

pub fn init_tracing() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

pub struct TestServer {
    pub dispatcher: Arc<Dispatcher>,
    pub socket: Arc<Socket>,
    pub address: SocketAddr,
}

impl TestServer {
    pub fn stop(&self) {
        self.dispatcher.shutdown();
        self.socket.close();
    }
}

/// Spawn a dispatcher on an ephemeral loopback socket.
pub async fn start_server(
    configuration: Arc<Configuration>,
    handler_factory: HandlerFactory,
) -> Result<TestServer> {
    let provider: Arc<dyn EngineProvider<Path>> = Arc::new(LoopbackProvider::new());
    let tls = ServerContext::new(Vec::new(), Vec::new()).with_alpn(vec![b"echo".to_vec()]);
    let dispatcher = Arc::new(Dispatcher::new(provider, configuration, tls, handler_factory));

    let socket = Arc::new(
        Socket::bound("127.0.0.1:0".parse()?).context("failed to bind listening socket")?,
    );
    let address = socket
        .local_addr()
        .context("listening socket has no local address")?;

    let listener = dispatcher.clone();
    let listening = socket.clone();
    tokio::spawn(async move {
        if let Err(error) = listener.listen(listening).await {
            tracing::error!(error = %error, "dispatcher terminated");
        }
    });

    Ok(TestServer {
        dispatcher,
        socket,
        address,
    })
}

pub fn new_client(
    configuration: Arc<Configuration>,
    server: SocketAddr,
    handler: Box<dyn ConnectionHandler>,
) -> Result<Client> {
    let provider: Arc<dyn EngineProvider<Path>> = Arc::new(LoopbackProvider::new());
    let tls = ClientContext::new("localhost").with_alpn(vec![b"echo".to_vec()]);
    Client::new(&provider, configuration, tls, server, handler).context("failed to create client")
}

/// Alternate send and receive passes until `condition` holds.
pub async fn drive_client_until(client: &mut Client, condition: impl Fn(&Connection) -> bool) {
    let path = client.path().clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            client.connection_mut().send_packets().await.unwrap();
            if condition(client.connection()) {
                return;
            }
            client
                .connection_mut()
                .receive_packets(&path, 1)
                .await
                .unwrap();
            if condition(client.connection()) {
                return;
            }
        }
    })
    .await
    .expect("client did not reach the expected state in time");
}

pub async fn establish(client: &mut Client) {
    drive_client_until(client, Connection::is_established).await;
}

/// Server-side handler that echoes every received byte and closes its
/// write side on FIN.
pub struct EchoHandler;

impl ConnectionHandler for EchoHandler {
    fn stream_data(&mut self, stream: &mut Stream) {
        let data = stream.input().data().to_vec();
        if !data.is_empty() {
            stream.consume(data.len()).unwrap();
            let _ = stream.append(data);
        }
        if stream.input().is_closed() && !stream.output().is_closed() {
            stream.finish();
        }
    }
}

/// Client-side handler that collects everything received on any stream
/// and records input-side closure.
pub struct CollectHandler {
    received: Arc<Mutex<Vec<u8>>>,
    input_closed: Arc<AtomicBool>,
}

pub struct CollectProbes {
    pub received: Arc<Mutex<Vec<u8>>>,
    pub input_closed: Arc<AtomicBool>,
}

impl CollectHandler {
    pub fn new() -> (Self, CollectProbes) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let input_closed = Arc::new(AtomicBool::new(false));
        let handler = CollectHandler {
            received: received.clone(),
            input_closed: input_closed.clone(),
        };
        (
            handler,
            CollectProbes {
                received,
                input_closed,
            },
        )
    }
}

impl ConnectionHandler for CollectHandler {
    fn stream_data(&mut self, stream: &mut Stream) {
        let pending = stream.input().data().to_vec();
        if !pending.is_empty() {
            stream.consume(pending.len()).unwrap();
            self.received.lock().unwrap().extend_from_slice(&pending);
        }
        if stream.input().is_closed() {
            self.input_closed.store(true, Ordering::SeqCst);
        }
    }
}
