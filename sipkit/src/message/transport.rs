use std::fmt;

use serde::{Deserialize, Serialize};

const TP_UDP: &str = "UDP";
const TP_TCP: &str = "TCP";
const TP_TLS: &str = "TLS";
const TP_WS: &str = "WS";
const TP_WSS: &str = "WSS";
const TP_UNKNOWN: &str = "TP_UNKNOWN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
/// An SIP Transport Type.
pub enum TransportKind {
    #[default]
    /// `UDP` transport.
    Udp,
    /// `TCP` transport.
    Tcp,
    /// `TLS` transport.
    Tls,
    /// `WebSocket` transport.
    Ws,
    /// `WebSocket` over TLS transport.
    Wss,
    /// UNKNOW transport.
    Unknown,
}

impl TransportKind {
    /// Returns the default port number associated with the transport protocol.
    ///
    /// - `UDP` and `TCP` use port `5060` by default.
    /// - `TLS` and `WSS` use port `5061`.
    /// - `WS` uses port `80`.
    /// - `Unknown` returns `0` to indicate no default.
    #[inline]
    pub const fn default_port(&self) -> u16 {
        match self {
            TransportKind::Udp | TransportKind::Tcp => 5060,
            TransportKind::Tls | TransportKind::Wss => 5061,
            TransportKind::Ws => 80,
            TransportKind::Unknown => 0,
        }
    }

    /// Returns `true` if the transport provides its own retransmission
    /// and message ordering (everything but UDP).
    #[inline]
    pub const fn reliable(&self) -> bool {
        !matches!(self, TransportKind::Udp | TransportKind::Unknown)
    }

    /// Returns `true` if the transport is encrypted.
    #[inline]
    pub const fn secure(&self) -> bool {
        matches!(self, TransportKind::Tls | TransportKind::Wss)
    }

    /// Returns the transport string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => TP_UDP,
            TransportKind::Tcp => TP_TCP,
            TransportKind::Tls => TP_TLS,
            TransportKind::Ws => TP_WS,
            TransportKind::Wss => TP_WSS,
            TransportKind::Unknown => TP_UNKNOWN,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for TransportKind {
    fn from(s: &str) -> Self {
        s.as_bytes().into()
    }
}

impl From<&[u8]> for TransportKind {
    fn from(b: &[u8]) -> Self {
        match b {
            b"UDP" | b"udp" => TransportKind::Udp,
            b"TCP" | b"tcp" => TransportKind::Tcp,
            b"TLS" | b"tls" => TransportKind::Tls,
            b"WS" | b"ws" => TransportKind::Ws,
            b"WSS" | b"wss" => TransportKind::Wss,
            _ => TransportKind::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ports_and_flags() {
        assert_eq!(TransportKind::Udp.default_port(), 5060);
        assert_eq!(TransportKind::Tls.default_port(), 5061);
        assert!(!TransportKind::Udp.reliable());
        assert!(TransportKind::Tcp.reliable());
        assert!(TransportKind::Wss.secure());
        assert_eq!(TransportKind::from("tcp"), TransportKind::Tcp);
        assert_eq!(TransportKind::from("sctp"), TransportKind::Unknown);
    }
}
