use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use util::ArcStr;

use crate::error::{Result, SipParserError};
use crate::message::TransportKind;

/// The host part of an URI or `Via` sent-by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Host {
    /// A domain name to be resolved.
    DomainName(ArcStr),
    /// A literal IP address.
    IpAddr(IpAddr),
}

impl Default for Host {
    fn default() -> Self {
        Host::DomainName("localhost".into())
    }
}

impl Host {
    /// Parses a host, accepting `[..]` bracketed IPv6 literals.
    pub fn parse(s: &str) -> Self {
        let trimmed = s.trim_start_matches('[').trim_end_matches(']');

        match trimmed.parse::<IpAddr>() {
            Ok(ip) => Host::IpAddr(ip),
            Err(_) => Host::DomainName(s.into()),
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::DomainName(name) => f.write_str(name),
            Host::IpAddr(IpAddr::V4(ip)) => write!(f, "{}", ip),
            Host::IpAddr(IpAddr::V6(ip)) => write!(f, "[{}]", ip),
        }
    }
}

/// A host with an optional port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct HostPort {
    /// The host.
    pub host: Host,
    /// The port, if explicitly given.
    pub port: Option<u16>,
}

impl HostPort {
    /// Creates a new `HostPort`.
    pub fn new(host: Host, port: Option<u16>) -> Self {
        Self { host, port }
    }

    /// Parses `host[:port]`, accepting bracketed IPv6 literals.
    pub fn parse(s: &str) -> Result<Self> {
        let (host_str, port_str) = if let Some(rest) = s.strip_prefix('[') {
            // IPv6 literal.
            let end = rest
                .find(']')
                .ok_or_else(|| SipParserError::new("Unterminated IPv6 literal"))?;
            let host = &rest[..end];
            let port = rest[end + 1..].strip_prefix(':');

            (format!("[{}]", host), port)
        } else {
            match s.rsplit_once(':') {
                Some((host, port)) => (host.to_string(), Some(port)),
                None => (s.to_string(), None),
            }
        };

        let port = match port_str {
            Some(p) => Some(
                p.parse::<u16>()
                    .map_err(|_| SipParserError::new(format!("Invalid port: {}", p)))?,
            ),
            None => None,
        };

        Ok(HostPort {
            host: Host::parse(&host_str),
            port,
        })
    }

    /// The port to use, falling back to the transport default.
    pub fn port_or(&self, kind: TransportKind) -> u16 {
        self.port.unwrap_or(kind.default_port())
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

/// An SIP or SIPS URI, reduced to the parts the transaction and
/// transport layers route on. Unrecognized URI parameters are preserved
/// verbatim in `params`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SipUri {
    /// `true` for the `sips` scheme.
    pub secure: bool,
    /// The user part, if any.
    pub user: Option<ArcStr>,
    /// Host and optional port.
    pub host_port: HostPort,
    /// The `transport` URI parameter, if present.
    pub transport_param: Option<TransportKind>,
    /// Remaining URI parameters, verbatim without the leading `;`.
    pub params: Option<ArcStr>,
}

impl SipUri {
    /// Parses `sip:` and `sips:` URIs.
    pub fn parse(s: &str) -> Result<Self> {
        let (secure, rest) = if let Some(rest) = s.strip_prefix("sips:") {
            (true, rest)
        } else if let Some(rest) = s.strip_prefix("sip:") {
            (false, rest)
        } else {
            return Err(SipParserError::new(format!("Unsupported URI scheme: {}", s)).into());
        };

        let (addr_part, params_part) = match rest.split_once(';') {
            Some((addr, params)) => (addr, Some(params)),
            None => (rest, None),
        };

        let (user, host_str) = match addr_part.rsplit_once('@') {
            Some((user, host)) => (Some(ArcStr::from(user)), host),
            None => (None, addr_part),
        };

        let host_port = HostPort::parse(host_str)?;

        let mut transport_param = None;
        let mut other_params = Vec::new();

        for param in params_part.into_iter().flat_map(|p| p.split(';')) {
            match param.split_once('=') {
                Some((name, value)) if name.eq_ignore_ascii_case("transport") => {
                    transport_param = Some(TransportKind::from(value));
                }
                _ => other_params.push(param),
            }
        }

        let params = if other_params.is_empty() {
            None
        } else {
            Some(other_params.join(";").into())
        };

        Ok(SipUri {
            secure,
            user,
            host_port,
            transport_param,
            params,
        })
    }

    /// The scheme string.
    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "sips"
        } else {
            "sip"
        }
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme())?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.host_port)?;
        if let Some(tp) = self.transport_param {
            write!(f, ";transport={}", tp.as_str().to_ascii_lowercase())?;
        }
        if let Some(params) = &self.params {
            write!(f, ";{}", params)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let uri = SipUri::parse("sip:bob@biloxi.example.com:5062;transport=tcp;lr").unwrap();

        assert!(!uri.secure);
        assert_eq!(uri.user.as_deref(), Some("bob"));
        assert_eq!(uri.host_port.port, Some(5062));
        assert_eq!(uri.transport_param, Some(TransportKind::Tcp));
        assert_eq!(uri.params.as_deref(), Some("lr"));
    }

    #[test]
    fn test_parse_sips() {
        let uri = SipUri::parse("sips:alice@10.0.0.1").unwrap();

        assert!(uri.secure);
        assert_matches!(uri.host_port.host, Host::IpAddr(_));
        assert_eq!(uri.host_port.port, None);
    }

    #[test]
    fn test_parse_ipv6() {
        let uri = SipUri::parse("sip:[2001:db8::1]:5060").unwrap();

        assert_matches!(uri.host_port.host, Host::IpAddr(IpAddr::V6(_)));
        assert_eq!(uri.host_port.port, Some(5060));
    }

    #[test]
    fn test_display_roundtrip() {
        let input = "sip:bob@biloxi.example.com:5062;transport=tcp";
        let uri = SipUri::parse(input).unwrap();

        assert_eq!(uri.to_string(), input);
    }

    #[test]
    fn test_rejects_unknown_scheme() {
        assert!(SipUri::parse("http://example.com").is_err());
    }
}
