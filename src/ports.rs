//! Local port allocation for transport listeners

use crate::transport::TransportId;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::debug;

/// How long a probe waits for something to answer on a port
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Candidates tried past the starting port before giving up
const MAX_PORT_ATTEMPTS: u16 = 1000;

/// PortPolicy decides where a transport listens
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PortPolicy {
    /// Let the OS pick a free port
    #[default]
    Ephemeral,
    /// Stable, ordered ports starting at per-transport bases
    Fixed(FixedPorts),
}

impl PortPolicy {
    pub fn fixed() -> Self {
        PortPolicy::Fixed(FixedPorts::default())
    }
}

/// FixedPorts holds the first candidate port per transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedPorts {
    bases: BTreeMap<TransportId, u16>,
}

impl Default for FixedPorts {
    fn default() -> Self {
        let bases = [
            (TransportId::MeekLite, 47000),
            (TransportId::Obfs2, 47100),
            (TransportId::Obfs3, 47200),
            (TransportId::Obfs4, 47300),
            (TransportId::ScrambleSuit, 47400),
            (TransportId::Webtunnel, 47500),
            (TransportId::Snowflake, 52000),
        ];
        Self {
            bases: bases.into_iter().collect(),
        }
    }
}

impl FixedPorts {
    pub fn with_base(mut self, method: TransportId, port: u16) -> Self {
        self.bases.insert(method, port);
        self
    }

    pub fn base(&self, method: TransportId) -> u16 {
        self.bases.get(&method).copied().unwrap_or(0)
    }

    /// first_candidate is the base for method, raised above every port
    /// held by a running transport that comes earlier in the ordering
    pub fn first_candidate(&self, method: TransportId, running: &[(TransportId, u16)]) -> u16 {
        let floor = running
            .iter()
            .filter(|(id, _)| *id < method)
            .map(|(_, port)| port.saturating_add(1))
            .max()
            .unwrap_or(0);
        self.base(method).max(floor)
    }
}

/// is_port_available reports whether nothing answers on 127.0.0.1:port
pub async fn is_port_available(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    !matches!(timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await, Ok(Ok(_)))
}

/// bind_listener binds a loopback listener for method following policy.
/// running lists the ports currently held by other transports.
pub async fn bind_listener(
    policy: &PortPolicy,
    method: TransportId,
    running: &[(TransportId, u16)],
) -> Result<TcpListener> {
    let ports = match policy {
        PortPolicy::Ephemeral => {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
            return Ok(listener);
        }
        PortPolicy::Fixed(ports) => ports,
    };

    let start = ports.first_candidate(method, running);
    let mut port = start;

    for _ in 0..MAX_PORT_ATTEMPTS {
        if is_port_available(port).await {
            match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) => debug!("{} could not bind port {}: {}", method, port, e),
            }
        } else {
            debug!("{} port {} in use", method, port);
        }

        port = port
            .checked_add(1)
            .ok_or_else(|| Error::config(format!("no free port for {method} from {start}")))?;
    }

    Err(Error::config(format!(
        "no free port for {method} in {start}..{port}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_candidate_respects_earlier_transports() {
        let ports = FixedPorts::default();
        assert_eq!(ports.first_candidate(TransportId::Obfs4, &[]), 47300);

        // An earlier transport that had to move far up pushes later ones along
        let running = [(TransportId::MeekLite, 47350), (TransportId::Snowflake, 52000)];
        assert_eq!(ports.first_candidate(TransportId::Obfs4, &running), 47351);
        assert_eq!(ports.first_candidate(TransportId::Obfs2, &running), 47351);
        assert_eq!(ports.first_candidate(TransportId::MeekLite, &running), 47000);
    }

    #[tokio::test]
    async fn test_probe_sees_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_available(port).await);

        drop(listener);
        assert!(is_port_available(port).await);
    }

    #[tokio::test]
    async fn test_fixed_skips_occupied_base() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = taken.local_addr().unwrap().port();

        let policy = PortPolicy::Fixed(FixedPorts::default().with_base(TransportId::Obfs4, base));
        let listener = bind_listener(&policy, TransportId::Obfs4, &[]).await.unwrap();
        assert!(listener.local_addr().unwrap().port() > base);
    }

    #[tokio::test]
    async fn test_ephemeral() {
        let listener = bind_listener(&PortPolicy::Ephemeral, TransportId::Snowflake, &[])
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }
}
