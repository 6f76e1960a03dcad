use core::fmt;

use util::ArcStr;

use crate::error::Result;
use crate::headers::{find_param, strip_param, NameAddr, SipHeaderParse};

/// The `From` SIP header.
///
/// Identifies the logical initiator of the request. The `tag`
/// parameter is half of the dialog identification and part of the
/// RFC 2543 legacy transaction key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct From {
    addr: NameAddr,
    tag: Option<ArcStr>,
    params: Option<ArcStr>,
}

impl From {
    /// Creates a `From` header from an address and optional tag.
    pub fn new(addr: NameAddr, tag: Option<&str>) -> Self {
        Self {
            addr,
            tag: tag.map(ArcStr::from),
            params: None,
        }
    }

    /// Returns the `tag` parameter.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Returns the address.
    pub fn addr(&self) -> &NameAddr {
        &self.addr
    }
}

impl SipHeaderParse for From {
    const NAME: &'static str = "From";
    const SHORT_NAME: Option<&'static str> = Some("f");

    fn parse(value: &str) -> Result<From> {
        let (addr, params) = NameAddr::parse(value)?;

        let tag = params.and_then(|p| find_param(p, "tag")).map(ArcStr::from);
        let params = params.and_then(|p| strip_param(p, "tag"));

        Ok(From { addr, tag, params })
    }
}

impl fmt::Display for From {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", From::NAME, self.addr)?;
        if let Some(tag) = &self.tag {
            write!(f, ";tag={}", tag)?;
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
    fn test_parse() {
        let from = From::parse("Alice <sip:alice@atlanta.example.com>;tag=1928301774").unwrap();

        assert_eq!(from.tag(), Some("1928301774"));
        assert_eq!(from.addr().uri.user.as_deref(), Some("alice"));
    }

    #[test]
    fn test_display() {
        let from = From::parse("\"Alice\" <sip:alice@atlanta.example.com>;tag=88sja8x").unwrap();

        assert_eq!(
            from.to_string(),
            "From: \"Alice\" <sip:alice@atlanta.example.com>;tag=88sja8x"
        );
    }
}
