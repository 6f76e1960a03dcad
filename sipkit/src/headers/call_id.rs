use core::fmt;

use util::ArcStr;

use crate::error::Result;
use crate::headers::SipHeaderParse;

/// The `Call-ID` SIP header.
///
/// Groups all messages of one call. It is part of the RFC 2543 legacy
/// transaction key and the secondary index used to route ACKs for 2xx
/// responses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallId(ArcStr);

impl CallId {
    /// Creates a new `Call-ID` from the identifier text.
    pub fn new(id: &str) -> Self {
        Self(id.into())
    }

    /// Returns the identifier text.
    pub fn id(&self) -> &ArcStr {
        &self.0
    }
}

impl SipHeaderParse for CallId {
    const NAME: &'static str = "Call-ID";
    const SHORT_NAME: Option<&'static str> = Some("i");

    fn parse(value: &str) -> Result<CallId> {
        Ok(CallId(value.trim().into()))
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", CallId::NAME, self.0)
    }
}
