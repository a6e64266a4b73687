//! Socket address resolution.
//!
//! `SocketAddr` already gives us the discriminated IPv4/IPv6 value type with
//! byte equality and numeric `host:port` formatting; this module adds
//! host/service resolution with an address-family hint.

use std::net::{SocketAddr, ToSocketAddrs};

use thiserror::Error;

/// Address family hint for resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Family {
    #[default]
    Unspecified,
    V4,
    V6,
}

impl Family {
    pub fn matches(self, address: &SocketAddr) -> bool {
        match self {
            Family::Unspecified => true,
            Family::V4 => address.is_ipv4(),
            Family::V6 => address.is_ipv6(),
        }
    }

    /// The family of a concrete address.
    pub fn of(address: &SocketAddr) -> Self {
        if address.is_ipv4() {
            Family::V4
        } else {
            Family::V6
        }
    }
}

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("failed to resolve {host}:{service}: {source}")]
    ResolutionFailed {
        host: String,
        service: String,
        source: std::io::Error,
    },

    #[error("invalid service {service:?} for {host}")]
    InvalidService { host: String, service: String },

    #[error("no {family:?} addresses for {host}:{service}")]
    NoMatchingAddress {
        host: String,
        service: String,
        family: Family,
    },
}

/// Resolve a host and numeric service to socket addresses, filtered by the
/// family hint.
pub fn resolve(host: &str, service: &str, family: Family) -> Result<Vec<SocketAddr>, AddressError> {
    let port: u16 = service.parse().map_err(|_| AddressError::InvalidService {
        host: host.to_string(),
        service: service.to_string(),
    })?;

    let addresses: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| AddressError::ResolutionFailed {
            host: host.to_string(),
            service: service.to_string(),
            source,
        })?
        .filter(|address| family.matches(address))
        .collect();

    if addresses.is_empty() {
        return Err(AddressError::NoMatchingAddress {
            host: host.to_string(),
            service: service.to_string(),
            family,
        });
    }

    Ok(addresses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_localhost() {
        let addresses = resolve("localhost", "4433", Family::Unspecified).unwrap();
        assert!(!addresses.is_empty());
        assert!(addresses.iter().all(|a| a.port() == 4433));
    }

    #[test]
    fn family_filter_applies() {
        let addresses = resolve("127.0.0.1", "9000", Family::V4).unwrap();
        assert!(addresses.iter().all(|a| a.is_ipv4()));

        let err = resolve("127.0.0.1", "9000", Family::V6);
        assert!(matches!(err, Err(AddressError::NoMatchingAddress { .. })));
    }

    #[test]
    fn rejects_non_numeric_service() {
        let err = resolve("localhost", "https", Family::Unspecified);
        assert!(matches!(err, Err(AddressError::InvalidService { .. })));
    }

    #[test]
    fn formats_numerically() {
        let address: SocketAddr = "127.0.0.1:4433".parse().unwrap();
        assert_eq!(address.to_string(), "127.0.0.1:4433");
    }
}
