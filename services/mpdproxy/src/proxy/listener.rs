//! TCP listener.
//!
//! Binds the first candidate of the listen endpoint that accepts a bind,
//! then hands out client connections. Candidates are tried in resolver
//! order, so a host with both an IPv4 and an IPv6 address still comes up
//! when only one of the families is usable.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;

use socket2::Socket;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use super::resolve::{Candidate, ResolvedEndpoint};
use crate::error::ProxyError;

/// Listen backlog: the system maximum.
pub const DEFAULT_BACKLOG: i32 = libc::SOMAXCONN;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Pending-connection backlog passed to listen(2).
    pub backlog: i32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_BACKLOG,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Accept calls that failed for a single connection and were skipped.
    pub accept_errors: AtomicU64,
    /// Upstream connection successes.
    pub upstream_connected: AtomicU64,
    /// Upstream connection failures (client dropped).
    pub upstream_failed: AtomicU64,
}

/// A bound and listening TCP socket.
#[derive(Debug)]
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind the first working candidate of `endpoint` and start listening.
    ///
    /// Fails with [`ProxyError::Bind`] once every candidate has been tried,
    /// or [`ProxyError::Listen`] if the bound socket refuses to listen.
    pub async fn bind(
        endpoint: &ResolvedEndpoint,
        config: &ListenerConfig,
    ) -> Result<Self, ProxyError> {
        let mut last_error = None;
        let mut bound = None;

        for candidate in endpoint.candidates() {
            match bind_candidate(candidate) {
                Ok(socket) => {
                    bound = Some((socket, candidate.addr));
                    break;
                }
                Err(e) => {
                    warn!(
                        component = "listener",
                        addr = %candidate.addr,
                        errno = e.raw_os_error(),
                        error = %e,
                        "Bind failed, trying next candidate"
                    );
                    last_error = Some(e);
                }
            }
        }

        let Some((socket, addr)) = bound else {
            return Err(ProxyError::Bind {
                endpoint: endpoint.to_string(),
                source: last_error.unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "no candidate addresses")
                }),
            });
        };

        socket
            .listen(config.backlog)
            .map_err(|source| ProxyError::Listen { addr, source })?;

        let listener = TcpListener::from_std(socket.into())
            .map_err(|source| ProxyError::Listen { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ProxyError::Listen { addr, source })?;

        info!(
            bind_addr = %local_addr,
            backlog = config.backlog,
            "Listener bound"
        );

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept the next client.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }
}

/// create-socket, SO_REUSEADDR, bind.
fn bind_candidate(candidate: &Candidate) -> io::Result<Socket> {
    let socket = candidate.socket()?;
    socket.set_reuse_address(true)?;
    socket.bind(&candidate.addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Whether an accept error only concerns the connection being accepted.
///
/// Descriptor exhaustion is included: it clears once connections close.
pub fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM | libc::EPROTO)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_listener_config_default() {
        let config = ListenerConfig::default();
        assert_eq!(config.backlog, libc::SOMAXCONN);
    }

    #[test]
    fn test_listener_stats() {
        let stats = ListenerStats::default();
        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient_accept_error(&io::Error::from(
            io::ErrorKind::ConnectionAborted
        )));
        assert!(is_transient_accept_error(&io::Error::from_raw_os_error(
            libc::EMFILE
        )));
        assert!(!is_transient_accept_error(&io::Error::from_raw_os_error(
            libc::EBADF
        )));
    }

    #[tokio::test]
    async fn test_bind_falls_back_to_next_candidate() {
        // 192.0.2.1 (TEST-NET-1) is never a local address.
        let endpoint = ResolvedEndpoint::from_addrs(
            "test",
            0,
            &[
                "192.0.2.1:0".parse().unwrap(),
                "127.0.0.1:0".parse().unwrap(),
            ],
        );

        let listener = Listener::bind(&endpoint, &ListenerConfig::default())
            .await
            .unwrap();
        let addr = listener.local_addr();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);

        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let client = client.unwrap();
        let (_, peer) = accepted.unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_bind_exhaustion_is_bind_error() {
        let endpoint =
            ResolvedEndpoint::from_addrs("test", 0, &["192.0.2.1:0".parse().unwrap()]);

        let err = Listener::bind(&endpoint, &ListenerConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Bind { .. }));
        assert_eq!(err.errno(), Some(libc::EADDRNOTAVAIL));
    }

    #[tokio::test]
    async fn test_bind_empty_endpoint() {
        let endpoint = ResolvedEndpoint::from_addrs("test", 0, &[]);
        let err = Listener::bind(&endpoint, &ListenerConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Bind { .. }));
    }
}
