//! Destination addresses carried inside tokens (`dst_hst`, `krb_kdc`, `target_host`)

use std::fmt;

use serde::{Serialize, Serializer};
use thiserror::Error;

pub const DEFAULT_SCHEME: &str = "tcp";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetAddrError {
    #[error("Empty target address")]
    Empty,
    #[error("Missing host in target address {0:?}")]
    MissingHost(String),
    #[error("Invalid port in target address {0:?}")]
    InvalidPort(String),
    #[error("Target address {0:?} has no port and no default is known")]
    MissingPort(String),
    #[error("Unterminated IPv6 literal in target address {0:?}")]
    BadIpv6(String),
}

/// `scheme://host:port`, with the scheme defaulting to `tcp`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetAddr {
    scheme: String,
    host: String,
    port: u16,
}

impl TargetAddr {
    /// Parse `[scheme://]host[:port]`.
    ///
    /// When the port is omitted, the scheme's well-known port is used
    /// (http, https, ws, wss), then `default_port`.
    pub fn parse(input: &str, default_port: Option<u16>) -> Result<Self, TargetAddrError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(TargetAddrError::Empty);
        }

        let (scheme, rest) = match input.split_once("://") {
            Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
            None => (DEFAULT_SCHEME.to_owned(), input),
        };
        let rest = rest.strip_suffix('/').unwrap_or(rest);

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let end = bracketed
                .find(']')
                .ok_or_else(|| TargetAddrError::BadIpv6(input.to_owned()))?;
            let host = &bracketed[..end];
            let port = match &bracketed[end + 1..] {
                "" => None,
                tail => Some(
                    tail.strip_prefix(':')
                        .ok_or_else(|| TargetAddrError::InvalidPort(input.to_owned()))?,
                ),
            };
            (host, port)
        } else {
            match rest.rsplit_once(':') {
                // a bare IPv6 literal has several colons and no port
                Some((host, port)) if !host.contains(':') => (host, Some(port)),
                _ => (rest, None),
            }
        };

        if host.is_empty() {
            return Err(TargetAddrError::MissingHost(input.to_owned()));
        }

        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| TargetAddrError::InvalidPort(input.to_owned()))?,
            None => scheme_default_port(&scheme)
                .or(default_port)
                .ok_or_else(|| TargetAddrError::MissingPort(input.to_owned()))?,
        };

        Ok(Self {
            scheme,
            host: host.to_owned(),
            port,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` form accepted by `TcpStream::connect`
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn scheme_default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        _ => None,
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

impl Serialize for TargetAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let addr = TargetAddr::parse("tcp://10.0.0.5:3389", None).unwrap();
        assert_eq!(addr.scheme(), "tcp");
        assert_eq!(addr.host(), "10.0.0.5");
        assert_eq!(addr.port(), 3389);
        assert_eq!(addr.to_string(), "tcp://10.0.0.5:3389");
    }

    #[test]
    fn test_default_scheme_and_port() {
        let addr = TargetAddr::parse("server.example", Some(22)).unwrap();
        assert_eq!(addr.scheme(), DEFAULT_SCHEME);
        assert_eq!(addr.authority(), "server.example:22");
    }

    #[test]
    fn test_scheme_port_wins_over_protocol_default() {
        let addr = TargetAddr::parse("https://web.example/", Some(3389)).unwrap();
        assert_eq!(addr.port(), 443);
    }

    #[test]
    fn test_ipv6() {
        let addr = TargetAddr::parse("[fe80::1]:5900", None).unwrap();
        assert_eq!(addr.host(), "fe80::1");
        assert_eq!(addr.authority(), "[fe80::1]:5900");

        let bare = TargetAddr::parse("fe80::1", Some(3389)).unwrap();
        assert_eq!(bare.port(), 3389);
        assert_eq!(bare.to_string(), "tcp://[fe80::1]:3389");
    }

    #[test]
    fn test_errors() {
        assert_eq!(TargetAddr::parse("  ", None), Err(TargetAddrError::Empty));
        assert!(matches!(
            TargetAddr::parse("host:notaport", None),
            Err(TargetAddrError::InvalidPort(_))
        ));
        assert!(matches!(
            TargetAddr::parse("host", None),
            Err(TargetAddrError::MissingPort(_))
        ));
        assert!(matches!(
            TargetAddr::parse("tcp://:80", None),
            Err(TargetAddrError::MissingHost(_))
        ));
        assert!(matches!(
            TargetAddr::parse("[::1:80", None),
            Err(TargetAddrError::BadIpv6(_))
        ));
    }
}
