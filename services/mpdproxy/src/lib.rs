pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;

pub use config::{Cli, Config, EndpointConfig, LogFormat};
pub use error::{ConnectError, ProxyError, ResolveError};
pub use proxy::{
    run, AddressFamily, Connector, Listener, ListenerConfig, Proxy, ProxySettings, RelayConfig,
    RelayPair, RelayStats, ResolvedEndpoint, ShutdownCoordinator, ShutdownTrigger, WorkerHandle,
    WorkerRegistry,
};
