//! TLS context and session handoff.
//!
//! The TLS handshake itself lives in the engine's crypto layer; the
//! orchestration core only carries a context into connection setup and
//! holds the resulting session handle for the connection's lifetime.

/// Client-side TLS configuration.
#[derive(Debug, Clone)]
pub struct ClientContext {
    server_name: String,
    alpn_protocols: Vec<Vec<u8>>,
}

impl ClientContext {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            alpn_protocols: Vec::new(),
        }
    }

    pub fn with_alpn(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn_protocols = protocols;
        self
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn alpn_protocols(&self) -> &[Vec<u8>] {
        &self.alpn_protocols
    }
}

/// Server-side TLS configuration: certificate chain, key, ALPN list and
/// the session-ticket encryption key.
#[derive(Clone)]
pub struct ServerContext {
    certificate_chain: Vec<Vec<u8>>,
    private_key: Vec<u8>,
    alpn_protocols: Vec<Vec<u8>>,
    ticket_key: Option<[u8; 32]>,
}

impl ServerContext {
    pub fn new(certificate_chain: Vec<Vec<u8>>, private_key: Vec<u8>) -> Self {
        Self {
            certificate_chain,
            private_key,
            alpn_protocols: Vec::new(),
            ticket_key: None,
        }
    }

    pub fn with_alpn(mut self, protocols: Vec<Vec<u8>>) -> Self {
        self.alpn_protocols = protocols;
        self
    }

    pub fn with_ticket_key(mut self, key: [u8; 32]) -> Self {
        self.ticket_key = Some(key);
        self
    }

    pub fn certificate_chain(&self) -> &[Vec<u8>] {
        &self.certificate_chain
    }

    pub fn private_key(&self) -> &[u8] {
        &self.private_key
    }

    pub fn alpn_protocols(&self) -> &[Vec<u8>] {
        &self.alpn_protocols
    }

    pub fn ticket_key(&self) -> Option<&[u8; 32]> {
        self.ticket_key.as_ref()
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("ServerContext")
            .field("certificates", &self.certificate_chain.len())
            .field("alpn_protocols", &self.alpn_protocols.len())
            .field("has_ticket_key", &self.ticket_key.is_some())
            .finish()
    }
}

/// Engine-issued TLS session bound to one connection. Owned exclusively
/// by that connection.
pub trait TlsSession: Send {
    /// The ALPN protocol negotiated during the handshake, if any.
    fn alpn_protocol(&self) -> Option<&[u8]>;

    /// The SNI server name seen on this session, if any.
    fn server_name(&self) -> Option<&str>;

    /// The most recent TLS alert, if the handshake failed.
    fn alert(&self) -> Option<u8>;
}
