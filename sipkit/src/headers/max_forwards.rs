use core::fmt;

use crate::error::{Result, SipParserError};
use crate::headers::SipHeaderParse;

/// The `Max-Forwards` SIP header.
///
/// Limits the number of hops a request can transit. The endpoint fills
/// in a configured default when the TU omits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxForwards(u32);

impl MaxForwards {
    /// Creates a new `Max-Forwards`.
    pub fn new(hops: u32) -> Self {
        Self(hops)
    }

    /// Returns the hop count.
    pub fn hops(&self) -> u32 {
        self.0
    }
}

impl SipHeaderParse for MaxForwards {
    const NAME: &'static str = "Max-Forwards";

    fn parse(value: &str) -> Result<MaxForwards> {
        value
            .trim()
            .parse::<u32>()
            .map(MaxForwards)
            .map_err(|_| SipParserError::new(format!("Invalid Max-Forwards: {}", value)).into())
    }
}

impl fmt::Display for MaxForwards {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", MaxForwards::NAME, self.0)
    }
}
