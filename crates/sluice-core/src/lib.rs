use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};

mod session;

pub use session::{SessionId, SESSION_ID_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

/// A host/port pair as given on the command line, not yet resolved.
#[derive(Debug, Clone)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
    pub family: AddressFamily,
}

#[derive(Debug, Clone)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone, Copy)]
pub enum AddressKind {
    Resolver,
    Target,
    Proxy,
}

impl AddressKind {
    fn label(self) -> &'static str {
        match self {
            AddressKind::Resolver => "resolver",
            AddressKind::Target => "target",
            AddressKind::Proxy => "proxy",
        }
    }
}

/// Normalize a tunnel domain: trim whitespace and any trailing root dot.
pub fn normalize_domain(input: &str) -> Result<String, ConfigError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::new("Domain must not be empty"));
    }
    let without_dot = trimmed.trim_end_matches('.');
    if without_dot.is_empty() {
        return Err(ConfigError::new("Domain must not be empty"));
    }
    Ok(without_dot.to_ascii_lowercase())
}

pub fn parse_host_port(
    input: &str,
    default_port: u16,
    kind: AddressKind,
) -> Result<HostPort, ConfigError> {
    if let Some(rest) = input.strip_prefix('[') {
        let Some(end) = rest.find(']') else {
            return Err(ConfigError::new(format!(
                "Invalid IPv6 address format (missing closing bracket): {}",
                input
            )));
        };

        let host = &rest[..end];
        if host.is_empty() {
            return Err(ConfigError::new(format!(
                "Invalid IPv6 address in {}: {}",
                kind.label(),
                input
            )));
        }

        let remainder = &rest[end + 1..];
        let port = if remainder.is_empty() {
            default_port
        } else if let Some(port_str) = remainder.strip_prefix(':') {
            parse_port(port_str, input, kind)?
        } else {
            return Err(ConfigError::new(format!(
                "Invalid IPv6 address format (missing closing bracket): {}",
                input
            )));
        };

        return Ok(HostPort {
            host: host.to_string(),
            port,
            family: AddressFamily::V6,
        });
    }

    let mut host = input;
    let mut port = default_port;
    if let Some((left, right)) = input.split_once(':') {
        if right.is_empty() || !right.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConfigError::new(format!(
                "Invalid port number in {} address: {}",
                kind.label(),
                input
            )));
        }
        host = left;
        port = parse_port(right, input, kind)?;
    }

    if host.is_empty() {
        return Err(ConfigError::new(format!(
            "Invalid {} address: {}",
            kind.label(),
            input
        )));
    }

    Ok(HostPort {
        host: host.to_string(),
        port,
        family: AddressFamily::V4,
    })
}

pub fn resolve_host_port(address: &HostPort) -> Result<SocketAddr, ConfigError> {
    match address.family {
        AddressFamily::V4 => {
            if let Ok(ip) = address.host.parse::<Ipv4Addr>() {
                return Ok(SocketAddr::V4(SocketAddrV4::new(ip, address.port)));
            }
        }
        AddressFamily::V6 => {
            if let Ok(ip) = address.host.parse::<Ipv6Addr>() {
                return Ok(SocketAddr::V6(SocketAddrV6::new(ip, address.port, 0, 0)));
            }
        }
    }

    let addr_str = match address.family {
        AddressFamily::V4 => format!("{}:{}", address.host, address.port),
        AddressFamily::V6 => format!("[{}]:{}", address.host, address.port),
    };
    let addrs = addr_str
        .to_socket_addrs()
        .map_err(|_| ConfigError::new(format!("Cannot resolve {}", address.host)))?;

    for addr in addrs {
        match (address.family, addr) {
            (AddressFamily::V4, SocketAddr::V4(_)) => return Ok(addr),
            (AddressFamily::V6, SocketAddr::V6(_)) => return Ok(addr),
            _ => {}
        }
    }

    Err(ConfigError::new(format!(
        "No {} address found for {}",
        match address.family {
            AddressFamily::V4 => "IPv4",
            AddressFamily::V6 => "IPv6",
        },
        address.host
    )))
}

fn parse_port(port_str: &str, input: &str, kind: AddressKind) -> Result<u16, ConfigError> {
    let port: u16 = port_str.parse().map_err(|_| {
        ConfigError::new(format!(
            "Invalid port number in {} address: {}",
            kind.label(),
            input
        ))
    })?;
    if port == 0 {
        return Err(ConfigError::new(format!(
            "Invalid port number in {} address: {}",
            kind.label(),
            input
        )));
    }
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_host() {
        let parsed = parse_host_port("9.9.9.9", 53, AddressKind::Resolver).unwrap();
        assert_eq!(parsed.host, "9.9.9.9");
        assert_eq!(parsed.port, 53);
        assert_eq!(parsed.family, AddressFamily::V4);
    }

    #[test]
    fn parses_host_with_port() {
        let parsed = parse_host_port("127.0.0.1:8853", 53, AddressKind::Resolver).unwrap();
        assert_eq!(parsed.port, 8853);
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let parsed = parse_host_port("[2001:db8::1]:5353", 53, AddressKind::Resolver).unwrap();
        assert_eq!(parsed.host, "2001:db8::1");
        assert_eq!(parsed.port, 5353);
        assert_eq!(parsed.family, AddressFamily::V6);
    }

    #[test]
    fn rejects_port_zero() {
        assert!(parse_host_port("example.com:0", 53, AddressKind::Target).is_err());
    }

    #[test]
    fn normalizes_domain_case_and_root_dot() {
        assert_eq!(normalize_domain("T.Example.COM.").unwrap(), "t.example.com");
        assert!(normalize_domain(" . ").is_err());
    }
}
