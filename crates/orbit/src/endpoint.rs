//! Endpoint and proxy address syntax.
//!
//! Two spellings are accepted everywhere:
//!
//! - `host:port` (and `identity@host:port` for proxies)
//! - `tcp -h host -p port` (and `identity:tcp -h host -p port` for proxies)
//!
//! A missing host means `127.0.0.1`; a missing port means `0` (any free port,
//! only meaningful for adapters).

use std::fmt;
use std::str::FromStr;

pub const DEFAULT_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("empty endpoint")]
    Empty,

    #[error("invalid port in '{0}'")]
    InvalidPort(String),

    #[error("unsupported endpoint syntax '{0}'")]
    Syntax(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn socket_addr_string(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn parse_tcp_options(spec: &str, original: &str) -> Result<Self, EndpointError> {
        let mut host = DEFAULT_HOST.to_string();
        let mut port = 0u16;
        let mut tokens = spec.split_whitespace();

        while let Some(flag) = tokens.next() {
            let value = tokens
                .next()
                .ok_or_else(|| EndpointError::Syntax(original.to_string()))?;
            match flag {
                "-h" => host = value.to_string(),
                "-p" => {
                    port = value
                        .parse()
                        .map_err(|_| EndpointError::InvalidPort(original.to_string()))?;
                }
                // Timeouts and compression flags are accepted and ignored.
                "-t" | "-z" => {}
                _ => return Err(EndpointError::Syntax(original.to_string())),
            }
        }

        Ok(Self { host, port })
    }

    fn parse_host_port(spec: &str) -> Result<Self, EndpointError> {
        let (host, port) = if let Some(rest) = spec.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| EndpointError::Syntax(spec.to_string()))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| EndpointError::Syntax(spec.to_string()))?;
            (host, port)
        } else {
            spec.rsplit_once(':')
                .ok_or_else(|| EndpointError::Syntax(spec.to_string()))?
        };

        let port = port
            .parse()
            .map_err(|_| EndpointError::InvalidPort(spec.to_string()))?;
        let host = if host.is_empty() { DEFAULT_HOST } else { host };
        Ok(Self::new(host, port))
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let spec = s.trim();
        if spec.is_empty() {
            return Err(EndpointError::Empty);
        }
        if spec == "tcp" {
            return Ok(Self::new(DEFAULT_HOST, 0));
        }
        match spec.strip_prefix("tcp ") {
            Some(options) => Self::parse_tcp_options(options, spec),
            None => Self::parse_host_port(spec),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.socket_addr_string())
    }
}

/// Target of a proxy: an optional object identity plus an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAddress {
    pub identity: Option<String>,
    pub endpoint: Endpoint,
}

impl ProxyAddress {
    /// Identity to address, falling back to the lower-cased type name.
    pub fn identity_or(&self, type_name: &str) -> String {
        self.identity
            .clone()
            .unwrap_or_else(|| type_name.to_ascii_lowercase())
    }
}

impl FromStr for ProxyAddress {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let spec = s.trim();

        if let Some((identity, rest)) = spec.split_once(':')
            && rest.trim_start().starts_with("tcp")
        {
            return Ok(Self {
                identity: non_empty(identity),
                endpoint: rest.parse()?,
            });
        }

        if let Some((identity, rest)) = spec.split_once('@') {
            return Ok(Self {
                identity: non_empty(identity),
                endpoint: rest.parse()?,
            });
        }

        Ok(Self {
            identity: None,
            endpoint: spec.parse()?,
        })
    }
}

impl fmt::Display for ProxyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identity {
            Some(identity) => write!(f, "{identity}@{}", self.endpoint),
            None => write!(f, "{}", self.endpoint),
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}
