//! Listening addresses in `scheme://host:port/` form.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use thiserror::Error;

/// A parsed listening address.
///
/// Addresses are URL-shaped: `http://localhost:8080/`, `http://*:80/`,
/// `https://[::1]:8443/`. The host decides what gets bound: an IP literal
/// binds exactly that address, `localhost` binds the IPv4 loopback, and any
/// other name (`*` included) binds all interfaces. A bare port number is
/// accepted shorthand for `http://*:port/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    scheme: String,
    host: String,
    port: u16,
}

/// Why an address string could not be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("listening address {0:?} must look like scheme://host:port/")]
    MissingScheme(String),
    #[error("listening address {0:?} has a missing or invalid host")]
    InvalidHost(String),
    #[error("listening address {0:?} has no port and its scheme has no default")]
    MissingPort(String),
    #[error("listening address {0:?} has an invalid port")]
    InvalidPort(String),
    #[error("listening address {0:?} carries a path, which is not supported")]
    PathNotSupported(String),
}

impl ServerAddress {
    pub fn parse(url: &str) -> Result<Self, AddressError> {
        let url = url.trim();
        let Some((scheme, rest)) = url.split_once("://") else {
            return match url.parse::<u16>() {
                Ok(port) => Ok(Self { scheme: "http".to_string(), host: "*".to_string(), port }),
                Err(_) => Err(AddressError::MissingScheme(url.to_string())),
            };
        };
        if scheme.is_empty() {
            return Err(AddressError::MissingScheme(url.to_string()));
        }

        let (authority, path) = match rest.find('/') {
            Some(at) => rest.split_at(at),
            None => (rest, ""),
        };
        if !path.is_empty() && path != "/" {
            return Err(AddressError::PathNotSupported(url.to_string()));
        }

        let (host, port) = split_host_port(authority, url)?;
        if host.is_empty() {
            return Err(AddressError::InvalidHost(url.to_string()));
        }
        let port = match port {
            Some(port) => {
                port.parse::<u16>().map_err(|_| AddressError::InvalidPort(url.to_string()))?
            }
            None => default_port(scheme).ok_or_else(|| AddressError::MissingPort(url.to_string()))?,
        };

        Ok(Self { scheme: scheme.to_ascii_lowercase(), host: host.to_string(), port })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host exactly as written, without IPv6 brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The endpoint this address binds.
    pub fn bind_addr(&self) -> SocketAddr {
        let ip = match self.host.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) if self.host.eq_ignore_ascii_case("localhost") => {
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            }
            Err(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        SocketAddr::new(ip, self.port)
    }
}

impl FromStr for ServerAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}/", self.scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}/", self.scheme, self.host, self.port)
        }
    }
}

/// Splits `host[:port]`, honoring `[...]` around IPv6 literals.
fn split_host_port<'a>(
    authority: &'a str,
    url: &str,
) -> Result<(&'a str, Option<&'a str>), AddressError> {
    if let Some(bracketed) = authority.strip_prefix('[') {
        let Some((host, tail)) = bracketed.split_once(']') else {
            return Err(AddressError::InvalidHost(url.to_string()));
        };
        return match tail.strip_prefix(':') {
            Some(port) => Ok((host, Some(port))),
            None if tail.is_empty() => Ok((host, None)),
            None => Err(AddressError::InvalidPort(url.to_string())),
        };
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => Ok((host, Some(port))),
        None => Ok((authority, None)),
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    if scheme.eq_ignore_ascii_case("http") {
        Some(80)
    } else if scheme.eq_ignore_ascii_case("https") {
        Some(443)
    } else {
        None
    }
}
