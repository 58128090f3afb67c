//! Destination keys
//!
//! All pool state is partitioned by a [`DestinationKey`]: the remote host,
//! the remote port and the (optional) local address to bind before
//! connecting. Keys are plain values; two equal keys always share one pool.

use std::fmt;
use std::net::IpAddr;

/// Identity grouping connections by (host, port, local address)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DestinationKey {
    host: String,
    port: u16,
    local_address: Option<IpAddr>,
}

impl DestinationKey {
    /// Create a key without a local address binding
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            local_address: None,
        }
    }

    /// Bind connections for this key to a local address
    pub fn with_local_address(mut self, addr: IpAddr) -> Self {
        self.local_address = Some(addr);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_address(&self) -> Option<IpAddr> {
        self.local_address
    }

    /// Build a key from an `http://` URI, defaulting the port to 80
    pub fn from_uri(uri: &http::Uri) -> Option<Self> {
        let host = uri.host()?;
        let port = uri.port_u16().unwrap_or_else(|| {
            if uri.scheme_str() == Some("https") {
                443
            } else {
                80
            }
        });
        Some(Self::new(host.trim_start_matches('[').trim_end_matches(']'), port))
    }
}

/// `host:port:local` with an empty last segment when unbound
impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.local_address {
            Some(local) => write!(f, "{}:{}:{}", self.host, self.port, local),
            None => write!(f, "{}:{}:", self.host, self.port),
        }
    }
}
