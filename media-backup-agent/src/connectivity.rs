//! Network availability checks run before a backup starts.

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Unmetered,
    /// Usable, but data may cost money
    Metered,
    Offline,
}

impl NetworkStatus {
    /// Whether a run may proceed on this network.
    pub fn allows_backup(&self, allow_metered: bool) -> bool {
        match self {
            NetworkStatus::Unmetered => true,
            NetworkStatus::Metered => allow_metered,
            NetworkStatus::Offline => false,
        }
    }
}

#[async_trait]
pub trait Connectivity: Send + Sync {
    async fn status(&self) -> NetworkStatus;
}

/// Treats a successful TCP connect to the remote as an unmetered link.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    addr: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Probe the host of an `https://` base URL on port 443.
    pub fn for_url(base_url: &str) -> Self {
        let host = base_url
            .split("://")
            .nth(1)
            .unwrap_or(base_url)
            .split('/')
            .next()
            .unwrap_or_default();
        if host.contains(':') {
            Self::new(host)
        } else {
            Self::new(format!("{host}:443"))
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Connectivity for TcpProbe {
    async fn status(&self) -> NetworkStatus {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(_)) => NetworkStatus::Unmetered,
            Ok(Err(e)) => {
                debug!("Connectivity probe to {} failed: {}", self.addr, e);
                NetworkStatus::Offline
            }
            Err(_) => {
                debug!("Connectivity probe to {} timed out", self.addr);
                NetworkStatus::Offline
            }
        }
    }
}

/// Fixed answer, for tests and forced runs.
#[derive(Debug, Clone, Copy)]
pub struct StaticConnectivity(pub NetworkStatus);

#[async_trait]
impl Connectivity for StaticConnectivity {
    async fn status(&self) -> NetworkStatus {
        self.0
    }
}
