//! Accept loop and per-client setup.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::listener::{is_transient_accept_error, Listener, ListenerConfig, ListenerStats};
use super::registry::WorkerRegistry;
use super::relay::{RelayConfig, RelayPair, RelayStats};
use super::resolve::{resolve, AddressFamily, ResolvedEndpoint};
use super::shutdown::{ShutdownCoordinator, ShutdownTrigger};
use super::upstream::{Connector, UpstreamTarget};
use crate::error::ProxyError;

/// Back-off after an accept error that is expected to clear by itself.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Resolved runtime settings for one proxy instance.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub listen_host: String,
    pub listen_port: String,
    pub listen_family: AddressFamily,
    pub upstream: UpstreamTarget,
    pub connect_timeout: Option<Duration>,
    pub listener: ListenerConfig,
    pub relay: RelayConfig,
}

/// A bound proxy, ready to serve.
#[derive(Debug)]
pub struct Proxy {
    listen_endpoint: ResolvedEndpoint,
    listener: Listener,
    connector: Arc<Connector>,
    registry: Arc<WorkerRegistry>,
    relay_config: RelayConfig,
    listener_stats: Arc<ListenerStats>,
    relay_stats: Arc<RelayStats>,
}

impl Proxy {
    /// Resolve both endpoints and bind the listener.
    ///
    /// Listen-side resolution and binding failures are fatal. An upstream
    /// that does not resolve yet is only logged; clients retry it.
    pub async fn bind(
        settings: &ProxySettings,
        registry: Arc<WorkerRegistry>,
    ) -> Result<Self, ProxyError> {
        let listen_endpoint = resolve(
            &settings.listen_host,
            &settings.listen_port,
            settings.listen_family,
            true,
        )
        .await?;

        let listener = Listener::bind(&listen_endpoint, &settings.listener).await?;
        let connector =
            Connector::resolve(settings.upstream.clone(), settings.connect_timeout).await;

        if let Some(endpoint) = connector.endpoint() {
            info!(
                upstream = %endpoint,
                candidates = endpoint.len(),
                "Upstream resolved"
            );
        }

        Ok(Self {
            listen_endpoint,
            listener,
            connector: Arc::new(connector),
            registry,
            relay_config: settings.relay.clone(),
            listener_stats: Arc::new(ListenerStats::default()),
            relay_stats: Arc::new(RelayStats::default()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn listen_endpoint(&self) -> &ResolvedEndpoint {
        &self.listen_endpoint
    }

    pub fn listener_stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.listener_stats)
    }

    pub fn relay_stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.relay_stats)
    }

    /// Accept clients until `shutdown` is cancelled.
    ///
    /// The listening socket is closed when this returns. Cancellation is the
    /// normal way out and yields `Ok`; only a non-transient accept error
    /// yields `Err`.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), ProxyError> {
        info!(bind_addr = %self.local_addr(), "Proxy accepting connections");

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(bind_addr = %self.local_addr(), "Listener closed");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            let (client, peer_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) if is_transient_accept_error(&e) => {
                    self.listener_stats
                        .accept_errors
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(
                        component = "listener",
                        errno = e.raw_os_error(),
                        error = %e,
                        "Accept error"
                    );
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
                Err(e) => {
                    error!(
                        component = "listener",
                        errno = e.raw_os_error(),
                        error = %e,
                        "Accept failed"
                    );
                    return Err(ProxyError::Accept(e));
                }
            };

            self.listener_stats
                .connections_accepted
                .fetch_add(1, Ordering::Relaxed);
            debug!(peer_addr = %peer_addr, "Accepted client");

            let setup = ClientSetup {
                connector: Arc::clone(&self.connector),
                registry: Arc::clone(&self.registry),
                relay_config: self.relay_config.clone(),
                listener_stats: Arc::clone(&self.listener_stats),
                relay_stats: Arc::clone(&self.relay_stats),
            };
            let shutdown = shutdown.clone();
            tokio::spawn(
                setup
                    .run(client, peer_addr, shutdown)
                    .instrument(info_span!("client", peer = %peer_addr)),
            );
        }
    }
}

/// Everything a freshly accepted client needs to get its relay pair.
struct ClientSetup {
    connector: Arc<Connector>,
    registry: Arc<WorkerRegistry>,
    relay_config: RelayConfig,
    listener_stats: Arc<ListenerStats>,
    relay_stats: Arc<RelayStats>,
}

impl ClientSetup {
    async fn run(self, client: TcpStream, peer_addr: SocketAddr, shutdown: CancellationToken) {
        let connected = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!(peer_addr = %peer_addr, "Shutdown during upstream connect, dropping client");
                return;
            }
            connected = self.connector.connect() => connected,
        };

        let (upstream, upstream_addr) = match connected {
            Ok(connected) => connected,
            Err(e) => {
                self.listener_stats
                    .upstream_failed
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    component = "connector",
                    peer_addr = %peer_addr,
                    errno = e.errno(),
                    error = %e,
                    "Upstream connect failed, closing client"
                );
                return;
            }
        };

        self.listener_stats
            .upstream_connected
            .fetch_add(1, Ordering::Relaxed);
        info!(
            peer_addr = %peer_addr,
            upstream_addr = %upstream_addr,
            "Upstream connected"
        );

        if let Err(e) = RelayPair::spawn(
            client,
            upstream,
            self.registry,
            self.relay_stats,
            self.relay_config,
        ) {
            warn!(
                component = "relay",
                peer_addr = %peer_addr,
                errno = e.raw_os_error(),
                error = %e,
                "Relay setup failed"
            );
        }
    }
}

/// Serve until a shutdown is triggered, then drain every relay worker.
///
/// Returns the trigger so the caller can derive the exit status. A fatal
/// accept error still drains the workers before it is returned.
pub async fn run(
    proxy: Proxy,
    coordinator: Arc<ShutdownCoordinator>,
) -> Result<ShutdownTrigger, ProxyError> {
    let served = proxy.serve(coordinator.listener_token()).await;

    if let Err(e) = &served {
        error!(
            component = e.component(),
            errno = e.errno(),
            error = %e,
            "Proxy stopped on error"
        );
    }

    coordinator.drain().await;
    served?;

    Ok(coordinator
        .triggered()
        .unwrap_or(ShutdownTrigger::Requested))
}
