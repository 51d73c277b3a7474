use super::InterceptError;
use std::fmt;
use std::net::IpAddr;

/// Destination named by a CONNECT request or an absolute-form URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    pub host: String,
    pub port: u16,
}

impl TunnelTarget {
    /// Parse `host[:port]`, `[v6]:port` or a bare IPv6 literal.
    pub fn parse(authority: &str, default_port: u16) -> Result<Self, InterceptError> {
        let authority = authority.trim();
        if authority.is_empty() {
            return Err(InterceptError::InvalidTarget("empty authority".to_string()));
        }

        let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
            let (host, after) = rest
                .split_once(']')
                .ok_or_else(|| InterceptError::InvalidTarget(authority.to_string()))?;
            if host.parse::<IpAddr>().is_err() {
                return Err(InterceptError::InvalidTarget(authority.to_string()));
            }
            let port = match after {
                "" => None,
                _ => Some(
                    after
                        .strip_prefix(':')
                        .ok_or_else(|| InterceptError::InvalidTarget(authority.to_string()))?,
                ),
            };
            (host, port)
        } else if authority.parse::<IpAddr>().is_ok() {
            (authority, None)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .ok()
                .filter(|port| *port != 0)
                .ok_or_else(|| InterceptError::InvalidTarget(format!("bad port in {authority}")))?,
            None => default_port,
        };

        if !is_valid_host(host) {
            return Err(InterceptError::InvalidTarget(authority.to_string()));
        }

        Ok(Self {
            host: host.to_ascii_lowercase(),
            port,
        })
    }
}

fn is_valid_host(host: &str) -> bool {
    if host.parse::<IpAddr>().is_ok() {
        return true;
    }
    !host.is_empty()
        && host.len() <= 253
        && !host.starts_with('.')
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
}

impl fmt::Display for TunnelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
