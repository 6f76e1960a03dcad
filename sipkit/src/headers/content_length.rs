use core::fmt;

use crate::error::{Result, SipParserError};
use crate::headers::SipHeaderParse;

/// The `Content-Length` SIP header.
///
/// Mandatory for message framing on stream transports; on datagrams an
/// absent header means the body is the remainder of the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentLength(u32);

impl ContentLength {
    /// Creates a new `Content-Length`.
    pub fn new(len: u32) -> Self {
        Self(len)
    }

    /// Returns the length value.
    pub fn len(&self) -> usize {
        self.0 as usize
    }
}

impl SipHeaderParse for ContentLength {
    const NAME: &'static str = "Content-Length";
    const SHORT_NAME: Option<&'static str> = Some("l");

    fn parse(value: &str) -> Result<ContentLength> {
        value
            .trim()
            .parse::<u32>()
            .map(ContentLength)
            .map_err(|_| SipParserError::new(format!("Invalid Content-Length: {}", value)).into())
    }
}

impl fmt::Display for ContentLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", ContentLength::NAME, self.0)
    }
}
