//! Transparent L4 relay.
//!
//! This module provides:
//! - Endpoint resolution with IPv4/IPv6 candidate fallback
//! - The TCP listener and accept loop
//! - Upstream connection establishment
//! - Relay pairs (two copy workers per connection) and their teardown
//! - The registry of live workers and the shutdown coordinator
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Connector -> Upstream
//!              |
//!              +-> RelayPair (client worker + upstream worker)
//!                      |
//!                WorkerRegistry <- ShutdownCoordinator (cancel + join all)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{run, Proxy, ShutdownCoordinator, WorkerRegistry};
//!
//! let registry = Arc::new(WorkerRegistry::new());
//! let proxy = Proxy::bind(&settings, Arc::clone(&registry)).await?;
//! let coordinator = Arc::new(ShutdownCoordinator::new(registry));
//! Arc::clone(&coordinator).watch_signals()?;
//! let trigger = run(proxy, coordinator).await?;
//! ```

mod listener;
mod registry;
mod relay;
mod resolve;
mod server;
mod shutdown;
mod upstream;

pub use listener::{
    is_transient_accept_error, Listener, ListenerConfig, ListenerStats, DEFAULT_BACKLOG,
};
pub use registry::{RegistryClosed, WorkerHandle, WorkerId, WorkerRegistry};
pub use relay::{
    Connection, ConnectionId, Direction, HangUp, HangUpFlag, RelayConfig, RelayPair, RelayStats,
    Side, StopKind, StopReason, Teardown, WorkerOutcome, DEFAULT_BUFFER_SIZE,
};
pub use resolve::{
    find_service, resolve, resolve_port, AddressFamily, Candidate, ResolvedEndpoint,
};
pub use server::{run, Proxy, ProxySettings};
pub use shutdown::{ShutdownCoordinator, ShutdownTrigger};
pub use upstream::{Connector, UpstreamTarget, DEFAULT_CONNECT_TIMEOUT};
