//! Proxy configuration.
//!
//! Configuration comes from a plain `Key value` file, one pair per line,
//! with `#` starting a comment. Command-line flags override file values.
//!
//! ```text
//! # upstream MPD server
//! Host       music.local
//! Port       6600
//! # where clients connect
//! Listen     0.0.0.0
//! ProxyPort  6601
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::warn;

use crate::proxy::{
    AddressFamily, ListenerConfig, ProxySettings, RelayConfig, UpstreamTarget,
    DEFAULT_BUFFER_SIZE, DEFAULT_CONNECT_TIMEOUT,
};

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/mpdproxy.conf";

/// Default listen host (all IPv4 interfaces).
pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";

/// Default listen port.
pub const DEFAULT_LISTEN_PORT: &str = "6601";

/// Default upstream port (MPD).
pub const DEFAULT_UPSTREAM_PORT: &str = "6600";

/// mpdproxy - transparent TCP relay.
#[derive(Debug, Parser)]
#[command(name = "mpdproxy")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file.
    #[arg(short, long, env = "MPDPROXY_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Use IPv4 addresses only.
    #[arg(short = '4', conflicts_with = "ipv6")]
    pub ipv4: bool,

    /// Use IPv6 addresses only.
    #[arg(short = '6')]
    pub ipv6: bool,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Log line format.
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Log filter (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable single lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Host, port and family of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub host: String,
    /// Port number or service name.
    pub port: String,
    pub family: AddressFamily,
}

/// Proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Where clients connect.
    pub listen: EndpointConfig,

    /// The server being proxied.
    pub upstream: EndpointConfig,

    /// Relay read chunk in bytes.
    pub buffer_size: usize,

    /// Per-candidate upstream connect timeout.
    pub connect_timeout: Option<Duration>,

    /// Stop a relay direction that has been silent this long.
    pub idle_timeout: Option<Duration>,

    /// Log destination; stderr when unset.
    pub log_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,
}

impl Config {
    /// Load the file named on the command line and apply the flag overrides.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut config = Self::from_file(&cli.config)?;
        config.apply_cli(cli);
        Ok(config)
    }

    /// Read and parse a configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot open configuration file {}", path.display()))?;
        Self::parse(&text)
            .with_context(|| format!("error reading configuration file {}", path.display()))
    }

    /// Parse configuration text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut listen_host = None;
        let mut listen_port = None;
        let mut upstream_host = None;
        let mut upstream_port = None;
        let mut family = None;
        let mut listen_family = None;
        let mut upstream_family = None;
        let mut buffer_size = DEFAULT_BUFFER_SIZE;
        let mut connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
        let mut idle_timeout = None;
        let mut log_file = None;
        let mut log_level = "info".to_string();
        let mut log_format = LogFormat::default();

        for (index, line) in text.lines().enumerate() {
            let line_no = index + 1;
            let mut tokens = line
                .split_whitespace()
                .take_while(|token| !token.starts_with('#'));

            // A line may carry several key/value pairs.
            while let Some(key) = tokens.next() {
                let Some(value) = tokens.next() else {
                    bail!("line {line_no}: missing value for {key}");
                };

                match key {
                    "Listen" => listen_host = Some(value.to_string()),
                    "ProxyPort" => listen_port = Some(value.to_string()),
                    "Host" => upstream_host = Some(value.to_string()),
                    "Port" => upstream_port = Some(value.to_string()),
                    "Family" => family = Some(parse_family(line_no, value)?),
                    "ListenFamily" => listen_family = Some(parse_family(line_no, value)?),
                    "UpstreamFamily" => upstream_family = Some(parse_family(line_no, value)?),
                    "BufferSize" => {
                        buffer_size = value
                            .parse()
                            .ok()
                            .filter(|size| *size > 0)
                            .with_context(|| {
                                format!("line {line_no}: BufferSize must be a positive integer")
                            })?;
                    }
                    "ConnectTimeout" => connect_timeout = parse_millis(line_no, key, value)?,
                    "IdleTimeout" => idle_timeout = parse_millis(line_no, key, value)?,
                    "LogFile" => log_file = Some(PathBuf::from(value)),
                    "LogLevel" => log_level = value.to_string(),
                    "LogFormat" => {
                        log_format = LogFormat::from_str(value, true).map_err(|_| {
                            anyhow::anyhow!("line {line_no}: LogFormat must be text or json")
                        })?;
                    }
                    unknown => warn!(component = "config", key = unknown, "Unknown key"),
                }
            }
        }

        let Some(upstream_host) = upstream_host else {
            bail!("missing upstream Host");
        };
        let family = family.unwrap_or_default();

        Ok(Self {
            listen: EndpointConfig {
                host: listen_host.unwrap_or_else(|| DEFAULT_LISTEN_HOST.to_string()),
                port: listen_port.unwrap_or_else(|| DEFAULT_LISTEN_PORT.to_string()),
                family: listen_family.unwrap_or(family),
            },
            upstream: EndpointConfig {
                host: upstream_host,
                port: upstream_port.unwrap_or_else(|| DEFAULT_UPSTREAM_PORT.to_string()),
                family: upstream_family.unwrap_or(family),
            },
            buffer_size,
            connect_timeout,
            idle_timeout,
            log_file,
            log_level,
            log_format,
        })
    }

    /// Apply command-line overrides.
    pub fn apply_cli(&mut self, cli: &Cli) {
        let forced = if cli.ipv4 {
            Some(AddressFamily::Ipv4)
        } else if cli.ipv6 {
            Some(AddressFamily::Ipv6)
        } else {
            None
        };
        if let Some(family) = forced {
            self.listen.family = family;
            self.upstream.family = family;
        }
        if let Some(path) = &cli.log_file {
            self.log_file = Some(path.clone());
        }
        if let Some(format) = cli.log_format {
            self.log_format = format;
        }
        if let Some(level) = &cli.log_level {
            self.log_level = level.clone();
        }
    }

    /// Runtime settings for [`crate::proxy::Proxy::bind`].
    pub fn settings(&self) -> ProxySettings {
        ProxySettings {
            listen_host: self.listen.host.clone(),
            listen_port: self.listen.port.clone(),
            listen_family: self.listen.family,
            upstream: UpstreamTarget {
                host: self.upstream.host.clone(),
                port: self.upstream.port.clone(),
                family: self.upstream.family,
            },
            connect_timeout: self.connect_timeout,
            listener: ListenerConfig::default(),
            relay: RelayConfig {
                buffer_size: self.buffer_size,
                idle_timeout: self.idle_timeout,
            },
        }
    }
}

fn parse_family(line_no: usize, value: &str) -> Result<AddressFamily> {
    value
        .parse()
        .map_err(|e: String| anyhow::anyhow!("line {line_no}: {e}"))
}

/// Milliseconds; `0` means no timeout.
fn parse_millis(line_no: usize, key: &str, value: &str) -> Result<Option<Duration>> {
    let millis: u64 = value
        .parse()
        .with_context(|| format!("line {line_no}: {key} must be an integer (milliseconds)"))?;
    Ok((millis > 0).then(|| Duration::from_millis(millis)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = "\
# mpdproxy.conf
Host      music.local   # the MPD box
Port      6600

Listen    ::
ProxyPort 6601
Family    ipv6
BufferSize 4096
ConnectTimeout 500
";

    #[test]
    fn test_parse_sample() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.upstream.host, "music.local");
        assert_eq!(config.upstream.port, "6600");
        assert_eq!(config.listen.host, "::");
        assert_eq!(config.listen.port, "6601");
        assert_eq!(config.listen.family, AddressFamily::Ipv6);
        assert_eq!(config.upstream.family, AddressFamily::Ipv6);
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.connect_timeout, Some(Duration::from_millis(500)));
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_parse_defaults() {
        let config = Config::parse("Host localhost\n").unwrap();
        assert_eq!(config.listen.host, DEFAULT_LISTEN_HOST);
        assert_eq!(config.listen.port, DEFAULT_LISTEN_PORT);
        assert_eq!(config.upstream.port, DEFAULT_UPSTREAM_PORT);
        assert_eq!(config.listen.family, AddressFamily::Any);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.connect_timeout, Some(DEFAULT_CONNECT_TIMEOUT));
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.log_file.is_none());
    }

    #[test]
    fn test_per_endpoint_family_overrides_global() {
        let config =
            Config::parse("Host h\nUpstreamFamily ipv4\nFamily ipv6\n").unwrap();
        assert_eq!(config.upstream.family, AddressFamily::Ipv4);
        assert_eq!(config.listen.family, AddressFamily::Ipv6);
    }

    #[test]
    fn test_unknown_keys_are_skipped() {
        let config = Config::parse("Password secret\nHost h\n").unwrap();
        assert_eq!(config.upstream.host, "h");
    }

    #[test]
    fn test_missing_host_is_an_error() {
        let err = Config::parse("Port 6600\n").unwrap_err();
        assert!(err.to_string().contains("Host"));
    }

    #[test]
    fn test_several_pairs_on_one_line() {
        let text = "Host h Port 6700 # upstream\nListen 127.0.0.1 ProxyPort 6701\n";
        let config = Config::parse(text).unwrap();
        assert_eq!(config.upstream.host, "h");
        assert_eq!(config.upstream.port, "6700");
        assert_eq!(config.listen.host, "127.0.0.1");
        assert_eq!(config.listen.port, "6701");

        let err = Config::parse("Host h Port\n").unwrap_err();
        assert!(err.to_string().contains("missing value for Port"));
    }

    #[test]
    fn test_missing_value_is_an_error() {
        let err = Config::parse("Host\n").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_zero_timeout_disables() {
        let config = Config::parse("Host h\nConnectTimeout 0\nIdleTimeout 30000\n").unwrap();
        assert_eq!(config.connect_timeout, None);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_invalid_values() {
        assert!(Config::parse("Host h\nBufferSize 0\n").is_err());
        assert!(Config::parse("Host h\nFamily ipx\n").is_err());
        assert!(Config::parse("Host h\nLogFormat xml\n").is_err());
        assert!(Config::parse("Host h\nIdleTimeout soon\n").is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.upstream.host, "music.local");
    }

    #[test]
    fn test_from_missing_file() {
        let err = Config::from_file(Path::new("/nonexistent/mpdproxy.conf")).unwrap_err();
        assert!(err.to_string().contains("cannot open configuration file"));
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "mpdproxy",
            "-c",
            "/tmp/x.conf",
            "-4",
            "--log-format",
            "json",
            "--log-level",
            "debug",
        ]);
        let mut config = Config::parse(SAMPLE).unwrap();
        config.apply_cli(&cli);

        assert_eq!(cli.config, PathBuf::from("/tmp/x.conf"));
        assert_eq!(config.listen.family, AddressFamily::Ipv4);
        assert_eq!(config.upstream.family, AddressFamily::Ipv4);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_rejects_both_families() {
        assert!(Cli::try_parse_from(["mpdproxy", "-4", "-6"]).is_err());
    }

    #[test]
    fn test_settings() {
        let settings = Config::parse(SAMPLE).unwrap().settings();
        assert_eq!(settings.listen_host, "::");
        assert_eq!(settings.upstream.host, "music.local");
        assert_eq!(settings.relay.buffer_size, 4096);
    }
}
