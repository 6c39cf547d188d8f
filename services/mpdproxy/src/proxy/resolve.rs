//! Endpoint resolution.
//!
//! Turns a configured `(host, port)` pair into an ordered list of candidate
//! socket addresses, filtered by address family. The listen side resolves
//! passively (an empty host means the wildcard addresses), the upstream side
//! actively (an empty host means loopback).

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::lookup_host;
use tracing::debug;

use crate::error::ResolveError;

/// Services database consulted for non-numeric ports.
pub const SERVICES_PATH: &str = "/etc/services";

/// Address family preference for an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AddressFamily {
    /// Either family, in resolver order.
    #[default]
    Any,
    /// IPv4 only.
    Ipv4,
    /// IPv6 only.
    Ipv6,
}

impl AddressFamily {
    /// Whether an address belongs to this family preference.
    pub fn admits(&self, addr: &SocketAddr) -> bool {
        match self {
            AddressFamily::Any => true,
            AddressFamily::Ipv4 => addr.is_ipv4(),
            AddressFamily::Ipv6 => addr.is_ipv6(),
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Any => write!(f, "any"),
            AddressFamily::Ipv4 => write!(f, "IPv4"),
            AddressFamily::Ipv6 => write!(f, "IPv6"),
        }
    }
}

impl FromStr for AddressFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "any" | "both" | "unspec" => Ok(AddressFamily::Any),
            "ipv4" | "inet" | "4" => Ok(AddressFamily::Ipv4),
            "ipv6" | "inet6" | "6" => Ok(AddressFamily::Ipv6),
            other => Err(format!("unknown address family: {other}")),
        }
    }
}

/// One address to try when binding or connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// Target socket address.
    pub addr: SocketAddr,
    /// Socket domain matching the address family.
    pub domain: Domain,
    /// Socket type (always a stream).
    pub socket_type: Type,
    /// Transport protocol (always TCP).
    pub protocol: Protocol,
}

impl Candidate {
    /// Stream candidate for a socket address.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            domain: Domain::for_address(addr),
            socket_type: Type::STREAM,
            protocol: Protocol::TCP,
        }
    }

    /// Create a fresh, unconnected socket for this candidate.
    pub fn socket(&self) -> io::Result<Socket> {
        Socket::new(self.domain, self.socket_type, Some(self.protocol))
    }
}

/// The resolved candidates for one configured endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    host: String,
    port: u16,
    candidates: Vec<Candidate>,
}

impl ResolvedEndpoint {
    /// Build an endpoint from already-known addresses.
    pub fn from_addrs(host: impl Into<String>, port: u16, addrs: &[SocketAddr]) -> Self {
        let mut candidates: Vec<Candidate> = Vec::with_capacity(addrs.len());
        for addr in addrs {
            if !candidates.iter().any(|c| c.addr == *addr) {
                candidates.push(Candidate::new(*addr));
            }
        }
        Self {
            host: host.into(),
            port,
            candidates,
        }
    }

    /// Configured host name.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Resolved port number.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Candidates in the order they should be tried.
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

impl fmt::Display for ResolvedEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Resolve `(host, port)` into candidate addresses.
///
/// `port` is a number or a TCP service name. With `passive` set an empty host
/// (or `*`) yields the wildcard addresses; otherwise it yields loopback.
/// Fails with [`ResolveError::NoAddresses`] when nothing of the requested
/// family remains.
pub async fn resolve(
    host: &str,
    port: &str,
    family: AddressFamily,
    passive: bool,
) -> Result<ResolvedEndpoint, ResolveError> {
    let port = resolve_port(port)?;
    let host = strip_brackets(host.trim());

    let addrs: Vec<SocketAddr> = if host.is_empty() || host == "*" {
        let (v4, v6) = if passive {
            (IpAddr::V4(Ipv4Addr::UNSPECIFIED), IpAddr::V6(Ipv6Addr::UNSPECIFIED))
        } else {
            (IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST))
        };
        vec![SocketAddr::new(v4, port), SocketAddr::new(v6, port)]
    } else if let Some(ip) = parse_ip_literal(host) {
        vec![SocketAddr::new(ip, port)]
    } else {
        lookup_host((host, port))
            .await
            .map_err(|source| ResolveError::Lookup {
                host: host.to_string(),
                port,
                source,
            })?
            .collect()
    };

    let admitted: Vec<SocketAddr> = addrs.into_iter().filter(|a| family.admits(a)).collect();
    if admitted.is_empty() {
        return Err(ResolveError::NoAddresses {
            host: host.to_string(),
            port,
            family,
        });
    }

    let endpoint = ResolvedEndpoint::from_addrs(host, port, &admitted);
    debug!(
        endpoint = %endpoint,
        family = %family,
        passive,
        candidates = endpoint.len(),
        "Endpoint resolved"
    );
    Ok(endpoint)
}

fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

fn parse_ip_literal(host: &str) -> Option<IpAddr> {
    host.parse().ok()
}

/// Resolve a numeric port or TCP service name.
pub fn resolve_port(port: &str) -> Result<u16, ResolveError> {
    let port = port.trim();
    if let Ok(number) = port.parse::<u16>() {
        return Ok(number);
    }
    if port.is_empty() || port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ResolveError::UnknownService(port.to_string()));
    }
    lookup_service(Path::new(SERVICES_PATH), port)
        .ok_or_else(|| ResolveError::UnknownService(port.to_string()))
}

fn lookup_service(path: &Path, name: &str) -> Option<u16> {
    let text = std::fs::read_to_string(path).ok()?;
    find_service(&text, name)
}

/// Find a TCP service by name or alias in services(5) formatted text.
pub fn find_service(text: &str, name: &str) -> Option<u16> {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or_default())
        .find_map(|line| {
            let mut fields = line.split_whitespace();
            let service = fields.next()?;
            let (port, proto) = fields.next()?.split_once('/')?;
            if proto != "tcp" {
                return None;
            }
            let mut names = std::iter::once(service).chain(fields);
            if names.any(|n| n == name) {
                port.parse().ok()
            } else {
                None
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("any", AddressFamily::Any)]
    #[case("both", AddressFamily::Any)]
    #[case("IPv4", AddressFamily::Ipv4)]
    #[case("inet", AddressFamily::Ipv4)]
    #[case("4", AddressFamily::Ipv4)]
    #[case("ipv6", AddressFamily::Ipv6)]
    #[case("inet6", AddressFamily::Ipv6)]
    fn test_family_from_str(#[case] input: &str, #[case] expected: AddressFamily) {
        assert_eq!(input.parse::<AddressFamily>().unwrap(), expected);
    }

    #[test]
    fn test_family_from_str_rejects_garbage() {
        assert!("ipx".parse::<AddressFamily>().is_err());
    }

    #[test]
    fn test_find_service() {
        let text = "\
# Network services
ftp		21/tcp
mpd		6600/tcp			# Music Player Daemon
mpd		6600/udp
domain		53/udp		nameserver
http		80/tcp		www		# WorldWideWeb HTTP
";
        assert_eq!(find_service(text, "mpd"), Some(6600));
        assert_eq!(find_service(text, "www"), Some(80));
        assert_eq!(find_service(text, "domain"), None);
        assert_eq!(find_service(text, "gopher"), None);
    }

    #[test]
    fn test_resolve_port_numeric() {
        assert_eq!(resolve_port("6600").unwrap(), 6600);
        assert_eq!(resolve_port(" 0 ").unwrap(), 0);
        assert!(matches!(
            resolve_port("70000"),
            Err(ResolveError::UnknownService(_))
        ));
        assert!(matches!(resolve_port(""), Err(ResolveError::UnknownService(_))));
    }

    #[tokio::test]
    async fn test_resolve_passive_wildcard() {
        let endpoint = resolve("", "6601", AddressFamily::Any, true).await.unwrap();
        let addrs: Vec<_> = endpoint.candidates().iter().map(|c| c.addr).collect();
        assert_eq!(
            addrs,
            vec![
                "0.0.0.0:6601".parse::<SocketAddr>().unwrap(),
                "[::]:6601".parse::<SocketAddr>().unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn test_resolve_active_empty_host_is_loopback() {
        let endpoint = resolve("", "6600", AddressFamily::Ipv6, false).await.unwrap();
        assert_eq!(endpoint.len(), 1);
        assert_eq!(endpoint.candidates()[0].addr, "[::1]:6600".parse().unwrap());
        assert_eq!(endpoint.candidates()[0].domain, Domain::IPV6);
    }

    #[tokio::test]
    async fn test_resolve_literal_family_mismatch() {
        let err = resolve("127.0.0.1", "6600", AddressFamily::Ipv6, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NoAddresses { .. }));
    }

    #[tokio::test]
    async fn test_resolve_bracketed_v6_literal() {
        let endpoint = resolve("[::1]", "6600", AddressFamily::Any, false)
            .await
            .unwrap();
        assert_eq!(endpoint.candidates()[0].addr, "[::1]:6600".parse().unwrap());
        assert_eq!(endpoint.to_string(), "[::1]:6600");
    }

    #[test]
    fn test_from_addrs_dedupes_in_order() {
        let a: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let b: SocketAddr = "[::1]:1".parse().unwrap();
        let endpoint = ResolvedEndpoint::from_addrs("localhost", 1, &[a, b, a]);
        let addrs: Vec<_> = endpoint.candidates().iter().map(|c| c.addr).collect();
        assert_eq!(addrs, vec![a, b]);
        assert_eq!(endpoint.to_string(), "localhost:1");
    }
}
