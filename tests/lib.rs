//! Shared fixtures for the RELAYMUX integration tests.

use async_trait::async_trait;
use relaymux_core::{PeerId, RelayClient, RelayClientConfig, RelayServer, RelayServerConfig};
use relaymux_transport::{
    Connection, DatagramDialer, DatagramListener, Dialer, Listener, SessionKey, StreamDialer,
    StreamListener, TransportResult,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Settings that keep reconnection-related tests fast
#[must_use]
pub fn fast_client_config() -> RelayClientConfig {
    RelayClientConfig {
        registration_timeout: Duration::from_secs(2),
        reconnect_interval: Duration::from_millis(100),
        keepalive_interval: Duration::from_secs(1),
        idle_timeout: Duration::from_secs(5),
        ..RelayClientConfig::default()
    }
}

/// Parse a peer id known to be valid
#[must_use]
pub fn peer(id: &str) -> PeerId {
    PeerId::new(id).unwrap()
}

/// Relay server running on an ephemeral local port
pub struct RelayFixture {
    /// Server handle
    pub server: RelayServer,
    /// `host:port` clients should dial
    pub addr: String,
    transport: FixtureTransport,
    serve: JoinHandle<()>,
}

#[derive(Clone)]
enum FixtureTransport {
    Stream,
    Datagram(SessionKey),
}

impl RelayFixture {
    /// Start a TCP relay with default settings
    pub async fn start() -> Self {
        Self::start_with(RelayServerConfig::default()).await
    }

    /// Start a TCP relay with custom settings
    pub async fn start_with(config: RelayServerConfig) -> Self {
        let listener = StreamListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve(config, Arc::new(listener), FixtureTransport::Stream)
    }

    /// Start a relay on the secure datagram transport
    pub async fn start_datagram(key: SessionKey) -> Self {
        let listener = DatagramListener::bind("127.0.0.1:0", key.clone())
            .await
            .unwrap();
        Self::serve(
            RelayServerConfig::default(),
            Arc::new(listener),
            FixtureTransport::Datagram(key),
        )
    }

    fn serve(
        config: RelayServerConfig,
        listener: Arc<dyn Listener>,
        transport: FixtureTransport,
    ) -> Self {
        let addr = listener.local_addr().unwrap().to_string();
        let server = RelayServer::with_config(config);
        let serve = {
            let server = server.clone();
            tokio::spawn(async move {
                server.listen_on(listener).await.unwrap();
            })
        };

        Self {
            server,
            addr,
            transport,
            serve,
        }
    }

    /// Dialer matching the fixture's transport
    #[must_use]
    pub fn dialer(&self) -> Arc<dyn Dialer> {
        match &self.transport {
            FixtureTransport::Stream => Arc::new(StreamDialer::new()),
            FixtureTransport::Datagram(key) => Arc::new(DatagramDialer::new(key.clone())),
        }
    }

    /// A client for `id` that is not connected yet
    #[must_use]
    pub fn client(&self, id: &str) -> RelayClient {
        RelayClient::with_config(
            self.addr.clone(),
            peer(id),
            fast_client_config(),
            self.dialer(),
        )
    }

    /// A registered client for `id`
    pub async fn connected_client(&self, id: &str) -> RelayClient {
        let client = self.client(id);
        client.connect().await.unwrap();
        client
    }

    /// Close the server and wait for the accept loop to finish
    pub async fn shutdown(self) {
        self.server.close().await.unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.serve).await;
    }
}

/// Dialer that remembers every connection it produced, so tests can sever
/// a client's physical connection from outside.
pub struct RecordingDialer {
    inner: Arc<dyn Dialer>,
    dialed: Mutex<Vec<Arc<dyn Connection>>>,
}

impl RecordingDialer {
    /// Wrap `inner`
    #[must_use]
    pub fn new(inner: Arc<dyn Dialer>) -> Self {
        Self {
            inner,
            dialed: Mutex::new(Vec::new()),
        }
    }

    /// Number of successful dials so far
    #[must_use]
    pub fn dial_count(&self) -> usize {
        self.dialed.lock().unwrap().len()
    }

    /// Most recently dialed connection
    #[must_use]
    pub fn last(&self) -> Option<Arc<dyn Connection>> {
        self.dialed.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Dialer for RecordingDialer {
    async fn dial(&self, addr: &str) -> TransportResult<Arc<dyn Connection>> {
        let conn = self.inner.dial(addr).await?;
        self.dialed.lock().unwrap().push(conn.clone());
        Ok(conn)
    }
}

/// Read from `conn` until exactly `len` bytes arrived
pub async fn read_exact(conn: &relaymux_core::VirtualConn, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut buf = vec![0u8; 8192];
    while out.len() < len {
        let n = conn.read(&mut buf).await.unwrap();
        assert!(n > 0, "unexpected EOF after {} of {} bytes", out.len(), len);
        out.extend_from_slice(&buf[..n]);
    }
    out
}

/// Deterministic test payload
#[must_use]
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
