use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SipParserError};
use crate::headers::SipHeaderParse;
use crate::message::Method;

/// The `CSeq` SIP header.
///
/// Ensures order and tracking of SIP transactions within a
/// session.
///
/// # Examples
///
/// ```
/// # use sipkit::{headers::CSeq, message::Method};
/// let cseq = CSeq::new(1, Method::Options);
///
/// assert_eq!(
///     "CSeq: 1 OPTIONS",
///     cseq.to_string()
/// );
/// ```
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct CSeq {
    cseq: u32,
    method: Method,
}

impl CSeq {
    /// Creates a new `CSeq` instance.
    pub fn new(cseq: u32, method: Method) -> Self {
        Self { cseq, method }
    }

    /// Returns the cseq number.
    pub fn cseq(&self) -> u32 {
        self.cseq
    }

    /// Returns the SIP method associated with the cseq.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The same sequence number with a different method, used when
    /// building the ACK for a non-2xx final response.
    pub fn with_method(&self, method: Method) -> CSeq {
        CSeq {
            cseq: self.cseq,
            method,
        }
    }
}

impl SipHeaderParse for CSeq {
    const NAME: &'static str = "CSeq";

    /*
     * CSeq  =  "CSeq" HCOLON 1*DIGIT LWS Method
     */
    fn parse(value: &str) -> Result<CSeq> {
        let mut parts = value.trim().split_whitespace();

        let cseq = parts
            .next()
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(|| SipParserError::new(format!("Invalid CSeq number: {}", value)))?;
        let method = parts
            .next()
            .map(Method::from)
            .ok_or_else(|| SipParserError::new("Missing CSeq method"))?;

        Ok(CSeq { cseq, method })
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} {}", CSeq::NAME, self.cseq, self.method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let cseq = CSeq::parse("4711 INVITE").unwrap();

        assert_eq!(cseq.method(), &Method::Invite);
        assert_eq!(cseq.cseq(), 4711);
    }

    #[test]
    fn test_with_method() {
        let cseq = CSeq::parse("314159 INVITE").unwrap();
        let ack = cseq.with_method(Method::Ack);

        assert_eq!(ack.cseq(), 314159);
        assert_eq!(ack.to_string(), "CSeq: 314159 ACK");
    }
}
