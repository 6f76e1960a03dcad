use core::fmt;

use util::ArcStr;

use crate::error::Result;
use crate::headers::{find_param, strip_param, NameAddr, SipHeaderParse};

/// The `To` SIP header.
///
/// Identifies the logical recipient of the request. A UAS adds a `tag`
/// on any response above 100; the INVITE client transaction copies the
/// response's tag into the ACK it builds for non-2xx finals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct To {
    addr: NameAddr,
    tag: Option<ArcStr>,
    params: Option<ArcStr>,
}

impl To {
    /// Creates a `To` header from an address and optional tag.
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

    /// Set the `tag` parameter.
    pub fn set_tag(&mut self, tag: Option<&str>) {
        self.tag = tag.map(ArcStr::from);
    }

    /// Returns the address.
    pub fn addr(&self) -> &NameAddr {
        &self.addr
    }
}

impl SipHeaderParse for To {
    const NAME: &'static str = "To";
    const SHORT_NAME: Option<&'static str> = Some("t");

    fn parse(value: &str) -> Result<To> {
        let (addr, params) = NameAddr::parse(value)?;

        let tag = params.and_then(|p| find_param(p, "tag")).map(ArcStr::from);
        let params = params.and_then(|p| strip_param(p, "tag"));

        Ok(To { addr, tag, params })
    }
}

impl fmt::Display for To {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", To::NAME, self.addr)?;
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
    fn test_parse_without_tag() {
        let to = To::parse("Bob <sip:bob@biloxi.example.com>").unwrap();

        assert_eq!(to.tag(), None);
    }

    #[test]
    fn test_set_tag() {
        let mut to = To::parse("<sip:bob@biloxi.example.com>").unwrap();
        to.set_tag(Some("a6c85cf"));

        assert_eq!(to.to_string(), "To: <sip:bob@biloxi.example.com>;tag=a6c85cf");
    }
}
