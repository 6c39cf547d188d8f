//! Upstream connection establishment.
//!
//! The upstream endpoint is resolved once and its candidates are tried in
//! order for every client until one connects. If the startup resolution
//! failed, resolution is retried when a client arrives and the first success
//! is kept for the rest of the process.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::OnceCell;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::resolve::{resolve, AddressFamily, Candidate, ResolvedEndpoint};
use crate::error::{ConnectError, ResolveError};

/// Default connect timeout per upstream candidate.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Where the upstream lives, as configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: String,
    pub family: AddressFamily,
}

/// Opens upstream connections for accepted clients.
#[derive(Debug)]
pub struct Connector {
    target: UpstreamTarget,
    endpoint: OnceCell<Arc<ResolvedEndpoint>>,
    connect_timeout: Option<Duration>,
}

impl Connector {
    /// Connector for an already resolved endpoint.
    pub fn new(endpoint: ResolvedEndpoint, connect_timeout: Option<Duration>) -> Self {
        let target = UpstreamTarget {
            host: endpoint.host().to_string(),
            port: endpoint.port().to_string(),
            family: AddressFamily::Any,
        };
        Self {
            target,
            endpoint: OnceCell::new_with(Some(Arc::new(endpoint))),
            connect_timeout,
        }
    }

    /// Resolve `target` now; on failure keep the target and retry per client.
    pub async fn resolve(target: UpstreamTarget, connect_timeout: Option<Duration>) -> Self {
        let endpoint = match resolve(&target.host, &target.port, target.family, false).await {
            Ok(endpoint) => OnceCell::new_with(Some(Arc::new(endpoint))),
            Err(e) => {
                warn!(
                    component = "resolver",
                    host = %target.host,
                    port = %target.port,
                    errno = e.errno(),
                    error = %e,
                    "Upstream resolution failed, retrying per connection"
                );
                OnceCell::new()
            }
        };
        Self {
            target,
            endpoint,
            connect_timeout,
        }
    }

    /// The resolved endpoint, if resolution has succeeded.
    pub fn endpoint(&self) -> Option<&Arc<ResolvedEndpoint>> {
        self.endpoint.get()
    }

    async fn resolved(&self) -> Result<&Arc<ResolvedEndpoint>, ResolveError> {
        self.endpoint
            .get_or_try_init(|| async {
                let target = &self.target;
                resolve(&target.host, &target.port, target.family, false)
                    .await
                    .map(Arc::new)
            })
            .await
    }

    /// Connect to the first upstream candidate that accepts.
    ///
    /// Returns the stream and the address it is connected to.
    pub async fn connect(&self) -> Result<(TcpStream, SocketAddr), ConnectError> {
        let endpoint = self.resolved().await?;

        let mut last = None;
        for candidate in endpoint.candidates() {
            debug!(upstream_addr = %candidate.addr, "Connecting to upstream");
            match self.try_connect(candidate).await {
                Ok(stream) => return Ok((stream, candidate.addr)),
                Err(e) => {
                    debug!(
                        component = "connector",
                        upstream_addr = %candidate.addr,
                        errno = e.raw_os_error(),
                        error = %e,
                        "Upstream candidate failed"
                    );
                    last = Some((candidate.addr, e));
                }
            }
        }

        let (last_addr, source) = last.unwrap_or_else(|| {
            (
                SocketAddr::from(([0, 0, 0, 0], endpoint.port())),
                io::Error::new(io::ErrorKind::AddrNotAvailable, "no candidate addresses"),
            )
        });
        Err(ConnectError::Exhausted {
            endpoint: endpoint.to_string(),
            attempts: endpoint.len(),
            last_addr,
            source,
        })
    }

    /// create-socket then connect, bounded by the connect timeout.
    async fn try_connect(&self, candidate: &Candidate) -> io::Result<TcpStream> {
        let socket = if candidate.addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        let connect = socket.connect(candidate.addr);
        match self.connect_timeout {
            Some(limit) => match timeout(limit, connect).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
            },
            None => connect.await,
        }
    }
}
