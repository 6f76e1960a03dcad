use core::fmt;
use std::net::IpAddr;

use util::ArcStr;

use crate::error::{Result, SipParserError};
use crate::headers::{find_param, strip_param, SipHeaderParse};
use crate::message::{Host, HostPort, TransportKind, SIPV2};

/// The `rport` Via parameter, RFC 3581.
///
/// A client asking for symmetric response routing sends the parameter
/// without a value; the server fills in the observed source port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rport {
    /// No `rport` parameter.
    #[default]
    Absent,
    /// `rport` present without a value.
    Requested,
    /// `rport=<port>` filled in by the receiving server.
    Value(u16),
}

impl Rport {
    /// `true` unless the parameter is absent.
    pub fn is_present(&self) -> bool {
        !matches!(self, Rport::Absent)
    }

    /// The filled-in port, if any.
    pub fn port(&self) -> Option<u16> {
        match self {
            Rport::Value(port) => Some(*port),
            _ => None,
        }
    }
}

/// The `Via` SIP header.
///
/// Indicates the path taken by the request so far and the
/// path that should be followed in routing responses.
///
/// # Examples
/// ```
/// # use sipkit::headers::{SipHeaderParse, Via};
/// let via = Via::parse("SIP/2.0/UDP server10.biloxi.example.com;branch=z9hG4bKnashds8").unwrap();
///
/// assert_eq!(via.branch(), Some("z9hG4bKnashds8"));
/// assert_eq!(
///     via.to_string(),
///     "Via: SIP/2.0/UDP server10.biloxi.example.com;branch=z9hG4bKnashds8",
/// );
/// ```
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct Via {
    transport: TransportKind,
    sent_by: HostPort,
    ttl: Option<ArcStr>,
    maddr: Option<Host>,
    received: Option<IpAddr>,
    branch: Option<ArcStr>,
    rport: Rport,
    params: Option<ArcStr>,
}

impl Via {
    /// Creates a new `Via` header with the given transport, sent-by and
    /// optional branch.
    pub fn new(transport: TransportKind, sent_by: HostPort, branch: Option<&str>) -> Self {
        Self {
            transport,
            sent_by,
            ttl: None,
            maddr: None,
            received: None,
            branch: branch.map(ArcStr::from),
            rport: Rport::Absent,
            params: None,
        }
    }

    /// Set the `received` parameter.
    pub fn set_received(&mut self, received: IpAddr) {
        self.received = Some(received);
    }

    /// Returns the `received` parameter.
    pub fn received(&self) -> Option<IpAddr> {
        self.received
    }

    /// Returns the `transport`.
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Rewrites the transport, used when a request is upgraded from UDP
    /// to a reliable transport.
    pub fn set_transport(&mut self, transport: TransportKind) {
        self.transport = transport;
    }

    /// Returns the `rport` parameter.
    pub fn rport(&self) -> Rport {
        self.rport
    }

    /// Request symmetric response routing.
    pub fn request_rport(&mut self) {
        self.rport = Rport::Requested;
    }

    /// Fill in the observed source port.
    pub fn set_rport(&mut self, port: u16) {
        self.rport = Rport::Value(port);
    }

    /// Set the sent_by field.
    pub fn set_sent_by(&mut self, sent_by: HostPort) {
        self.sent_by = sent_by;
    }

    /// Returns the branch parameter.
    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    /// Set the branch parameter.
    pub fn set_branch(&mut self, branch: &str) {
        self.branch = Some(branch.into());
    }

    /// Returns the sent_by field.
    pub fn sent_by(&self) -> &HostPort {
        &self.sent_by
    }

    /// Returns the `maddr` parameter.
    pub fn maddr(&self) -> Option<&Host> {
        self.maddr.as_ref()
    }
}

impl SipHeaderParse for Via {
    const NAME: &'static str = "Via";
    const SHORT_NAME: Option<&'static str> = Some("v");

    /*
     * Via               =  ( "Via" / "v" ) HCOLON via-parm *(COMMA via-parm)
     * via-parm          =  sent-protocol LWS sent-by *( SEMI via-params )
     * via-params        =  via-ttl / via-maddr
     *                      / via-received / via-branch
     *                      / via-extension
     */
    fn parse(value: &str) -> Result<Via> {
        let value = value.trim();

        let rest = value
            .strip_prefix(SIPV2)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| SipParserError::new(format!("Invalid Via sent-protocol: {}", value)))?;

        let (transport_str, rest) = rest
            .split_once(char::is_whitespace)
            .ok_or_else(|| SipParserError::new("Missing Via sent-by"))?;
        let transport = TransportKind::from(transport_str.trim());

        let (sent_by_str, params_str) = match rest.trim().split_once(';') {
            Some((sent_by, params)) => (sent_by, Some(params)),
            None => (rest.trim(), None),
        };

        let sent_by = HostPort::parse(sent_by_str.trim())?;

        let mut via = Via {
            transport,
            sent_by,
            ..Default::default()
        };

        if let Some(params) = params_str {
            if let Some(branch) = find_param(params, "branch") {
                via.branch = Some(branch.into());
            }
            if let Some(received) = find_param(params, "received") {
                via.received = received.parse().ok();
            }
            if let Some(rport) = find_param(params, "rport") {
                via.rport = match rport.parse::<u16>() {
                    Ok(port) => Rport::Value(port),
                    Err(_) => Rport::Requested,
                };
            }
            if let Some(maddr) = find_param(params, "maddr") {
                via.maddr = Some(Host::parse(maddr));
            }
            if let Some(ttl) = find_param(params, "ttl") {
                via.ttl = Some(ttl.into());
            }

            let mut rest = Some(ArcStr::from(params));
            for known in ["branch", "received", "rport", "maddr", "ttl"] {
                rest = rest.and_then(|r| strip_param(&r, known));
            }
            via.params = rest;
        }

        Ok(via)
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}/{} {}", Via::NAME, SIPV2, self.transport, self.sent_by)?;

        match self.rport {
            Rport::Absent => (),
            Rport::Requested => write!(f, ";rport")?,
            Rport::Value(port) => write!(f, ";rport={}", port)?,
        }
        if let Some(received) = &self.received {
            write!(f, ";received={received}")?;
        }
        if let Some(ttl) = &self.ttl {
            write!(f, ";ttl={ttl}")?;
        }
        if let Some(maddr) = &self.maddr {
            write!(f, ";maddr={maddr}")?;
        }
        if let Some(branch) = &self.branch {
            write!(f, ";branch={branch}")?;
        }
        if let Some(params) = &self.params {
            write!(f, ";{params}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let via = Via::parse("SIP/2.0/UDP bobspc.biloxi.example.com:5060;branch=z9hG4bKnashds7").unwrap();

        assert_eq!(via.transport(), TransportKind::Udp);
        assert_eq!(via.sent_by().port, Some(5060));
        assert_eq!(via.branch(), Some("z9hG4bKnashds7"));
        assert_eq!(via.rport(), Rport::Absent);
    }

    #[test]
    fn test_parse_rport_forms() {
        let via = Via::parse("SIP/2.0/UDP client.example.com;rport;branch=z9hG4bK1").unwrap();
        assert_eq!(via.rport(), Rport::Requested);

        let via = Via::parse("SIP/2.0/UDP client.example.com;rport=9;branch=z9hG4bK1").unwrap();
        assert_eq!(via.rport().port(), Some(9));
    }

    #[test]
    fn test_display_keeps_unknown_params() {
        let via = Via::parse("SIP/2.0/TCP host.example.com;branch=z9hG4bK7;alias").unwrap();

        assert_eq!(
            via.to_string(),
            "Via: SIP/2.0/TCP host.example.com;branch=z9hG4bK7;alias"
        );
    }

    #[test]
    fn test_rejects_bad_protocol() {
        assert!(Via::parse("SIP/1.0/UDP host").is_err());
    }
}
