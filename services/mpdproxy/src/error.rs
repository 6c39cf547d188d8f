//! Error types for the proxy.
//!
//! Errors fall into three groups:
//! - fatal startup errors ([`ProxyError`]) that end the process,
//! - per-connection errors ([`ConnectError`], and [`ResolveError`] on the
//!   upstream side) that abandon a single client,
//! - relay stop reasons, which are not errors at all and live in
//!   [`crate::proxy::StopReason`].

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::proxy::AddressFamily;

/// Address resolution failure.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The port is neither a number nor a known TCP service.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// The name lookup itself failed.
    #[error("lookup failed for {host}:{port}: {source}")]
    Lookup {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The lookup succeeded but produced no address of the wanted family.
    #[error("no {family} address for {host}:{port}")]
    NoAddresses {
        host: String,
        port: u16,
        family: AddressFamily,
    },
}

impl ResolveError {
    /// OS error number, when the failure came from the OS.
    pub fn errno(&self) -> Option<i32> {
        match self {
            ResolveError::Lookup { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Failure to open the upstream leg for one client.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The upstream endpoint could not be resolved for this client.
    #[error("upstream resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    /// Every candidate address was tried and none accepted the connection.
    #[error("all {attempts} upstream candidates of {endpoint} failed, last {last_addr}: {source}")]
    Exhausted {
        endpoint: String,
        attempts: usize,
        last_addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl ConnectError {
    /// OS error number of the last failed attempt.
    pub fn errno(&self) -> Option<i32> {
        match self {
            ConnectError::Resolve(e) => e.errno(),
            ConnectError::Exhausted { source, .. } => source.raw_os_error(),
        }
    }
}

/// Fatal proxy errors. Any of these ends the process.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The listen endpoint could not be resolved.
    #[error("resolve failed: {0}")]
    Resolve(#[from] ResolveError),

    /// No candidate of the listen endpoint could be bound.
    #[error("bind failed for {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// The bound socket refused to listen.
    #[error("listen failed on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The accept loop hit an error that is not tied to a single client.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}

impl ProxyError {
    /// OS error number behind this error, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            ProxyError::Resolve(e) => e.errno(),
            ProxyError::Bind { source, .. }
            | ProxyError::Listen { source, .. }
            | ProxyError::Accept(source) => source.raw_os_error(),
        }
    }

    /// Short component name used in log lines.
    pub fn component(&self) -> &'static str {
        match self {
            ProxyError::Resolve(_) => "resolver",
            ProxyError::Bind { .. } | ProxyError::Listen { .. } | ProxyError::Accept(_) => {
                "listener"
            }
        }
    }

    /// Process exit status for this error: the OS error number when one
    /// exists and fits, otherwise 1.
    pub fn exit_code(&self) -> u8 {
        self.errno()
            .and_then(|errno| u8::try_from(errno).ok())
            .filter(|code| *code != 0)
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_uses_errno() {
        let err = ProxyError::Bind {
            endpoint: "127.0.0.1:6601".to_string(),
            source: io::Error::from_raw_os_error(libc::EADDRINUSE),
        };
        assert_eq!(err.errno(), Some(libc::EADDRINUSE));
        assert_eq!(err.exit_code(), libc::EADDRINUSE as u8);
        assert_eq!(err.component(), "listener");
    }

    #[test]
    fn test_exit_code_without_errno() {
        let err = ProxyError::Resolve(ResolveError::UnknownService("nope".to_string()));
        assert_eq!(err.errno(), None);
        assert_eq!(err.exit_code(), 1);
        assert_eq!(err.component(), "resolver");
    }

    #[test]
    fn test_exit_code_out_of_range_errno() {
        let err = ProxyError::Accept(io::Error::from_raw_os_error(300));
        assert_eq!(err.exit_code(), 1);
    }
}
