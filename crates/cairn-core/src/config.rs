//! Endpoint configuration.
//!
//! A `Configuration` is built once, then shared read-only across every
//! connection and dispatcher (no synchronization needed). The static
//! secret is drawn from the secure randomness source at construction and
//! never mutated afterwards; it seeds stateless reset token derivation.

use std::time::Duration;

use crate::random::SecureRandom;

/// Default QUIC transport parameters advertised by this endpoint.
#[derive(Debug, Clone)]
pub struct TransportParameters {
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub active_connection_id_limit: u64,
    pub max_idle_timeout: Duration,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            initial_max_data: 1024 * 1024,
            initial_max_stream_data_bidi_local: 128 * 1024,
            initial_max_stream_data_bidi_remote: 128 * 1024,
            initial_max_stream_data_uni: 128 * 1024,
            initial_max_streams_bidi: 3,
            initial_max_streams_uni: 3,
            active_connection_id_limit: 7,
            max_idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Shared endpoint configuration: static secret plus transport defaults.
#[derive(Debug)]
pub struct Configuration {
    static_secret: [u8; 32],
    transport_parameters: TransportParameters,
    supported_versions: Vec<u32>,
}

/// QUIC version 1.
pub const VERSION_1: u32 = 0x0000_0001;

impl Configuration {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::new()
    }

    /// 32 random bytes used to derive stateless reset tokens.
    pub fn static_secret(&self) -> &[u8; 32] {
        &self.static_secret
    }

    pub fn transport_parameters(&self) -> &TransportParameters {
        &self.transport_parameters
    }

    pub fn supported_versions(&self) -> &[u32] {
        &self.supported_versions
    }

    /// The version a client offers first.
    pub fn preferred_version(&self) -> u32 {
        self.supported_versions[0]
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ConfigurationBuilder {
    transport_parameters: TransportParameters,
    supported_versions: Vec<u32>,
}

impl ConfigurationBuilder {
    pub fn new() -> Self {
        Self {
            transport_parameters: TransportParameters::default(),
            supported_versions: vec![VERSION_1],
        }
    }

    pub fn transport_parameters(mut self, parameters: TransportParameters) -> Self {
        self.transport_parameters = parameters;
        self
    }

    pub fn max_idle_timeout(mut self, timeout: Duration) -> Self {
        self.transport_parameters.max_idle_timeout = timeout;
        self
    }

    pub fn supported_versions(mut self, versions: Vec<u32>) -> Self {
        assert!(!versions.is_empty(), "at least one version is required");
        self.supported_versions = versions;
        self
    }

    pub fn build(self) -> Configuration {
        Configuration {
            static_secret: SecureRandom::new().secret(),
            transport_parameters: self.transport_parameters,
            supported_versions: self.supported_versions,
        }
    }
}

impl Default for ConfigurationBuilder {
    fn default() -> Self {
        Self::new()
    }
}
