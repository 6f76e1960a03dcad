//! SIP message model.
//!
//! Messages are held in owned form: the transaction layer keeps the
//! originating request and the last response beyond the life of the
//! buffer they were parsed from.

mod code;
mod method;
mod transport;
mod uri;

pub use code::{CodeClass, StatusCode};
pub use method::Method;
pub use transport::TransportKind;
pub use uri::{Host, HostPort, SipUri};

use std::fmt;

use bytes::Bytes;
use util::ArcStr;

use crate::headers::{Header, Headers};

pub(crate) const SIPV2: &str = "SIP/2.0";

/// The Request-Line of a SIP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    /// The request method.
    pub method: Method,
    /// The Request-URI.
    pub uri: SipUri,
}

impl fmt::Display for RequestLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n", self.method, self.uri, SIPV2)
    }
}

/// The Status-Line of a SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    /// The status code.
    pub code: StatusCode,
    /// The reason phrase.
    pub reason: ArcStr,
}

impl StatusLine {
    /// Creates a status line with the given code and reason.
    pub fn new(code: StatusCode, reason: &str) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\r\n", SIPV2, self.code, self.reason)
    }
}

/// An SIP request.
#[derive(Debug, Clone)]
pub struct Request {
    /// The Request-Line.
    pub req_line: RequestLine,
    /// All headers, in wire order.
    pub headers: Headers,
    /// The message body, if any.
    pub body: Option<Bytes>,
}

impl Request {
    /// Returns the request method.
    pub fn method(&self) -> &Method {
        &self.req_line.method
    }
}

/// An SIP response.
#[derive(Debug, Clone)]
pub struct Response {
    /// The Status-Line.
    pub status_line: StatusLine,
    /// All headers, in wire order.
    pub headers: Headers,
    /// The message body, if any.
    pub body: Option<Bytes>,
}

impl Response {
    /// Creates an empty response with the given status line.
    pub fn new(status_line: StatusLine) -> Self {
        Self {
            status_line,
            headers: Headers::new(),
            body: None,
        }
    }

    /// Returns the status code.
    pub fn code(&self) -> StatusCode {
        self.status_line.code
    }

    /// Append headers from `other`, preserving order.
    pub fn append_headers(&mut self, other: &mut Headers) {
        self.headers.append(other);
    }
}

/// Either a SIP request or a SIP response.
#[derive(Debug, Clone)]
pub enum SipMsg {
    /// A request.
    Request(Request),
    /// A response.
    Response(Response),
}

impl SipMsg {
    /// Returns the message headers.
    pub fn headers(&self) -> &Headers {
        match self {
            SipMsg::Request(request) => &request.headers,
            SipMsg::Response(response) => &response.headers,
        }
    }

    /// Returns the message headers mutably.
    pub fn headers_mut(&mut self) -> &mut Headers {
        match self {
            SipMsg::Request(request) => &mut request.headers,
            SipMsg::Response(response) => &mut response.headers,
        }
    }

    /// Returns the message body.
    pub fn body(&self) -> Option<&Bytes> {
        match self {
            SipMsg::Request(request) => request.body.as_ref(),
            SipMsg::Response(response) => response.body.as_ref(),
        }
    }

    /// Sets the message body.
    pub fn set_body(&mut self, body: Bytes) {
        match self {
            SipMsg::Request(request) => request.body = Some(body),
            SipMsg::Response(response) => response.body = Some(body),
        }
    }

    /// Returns `true` for requests.
    pub fn is_request(&self) -> bool {
        matches!(self, SipMsg::Request(_))
    }

    /// The topmost `Via` header, if present.
    pub fn top_via(&self) -> Option<&crate::headers::Via> {
        self.headers().iter().find_map(|h| match h {
            Header::Via(via) => Some(via),
            _ => None,
        })
    }

    /// The topmost `Via` header mutably, if present.
    pub fn top_via_mut(&mut self) -> Option<&mut crate::headers::Via> {
        self.headers_mut().iter_mut().find_map(|h| match h {
            Header::Via(via) => Some(via),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_line_display() {
        let line = RequestLine {
            method: Method::Invite,
            uri: SipUri::parse("sip:bob@biloxi.example.com").unwrap(),
        };

        assert_eq!(line.to_string(), "INVITE sip:bob@biloxi.example.com SIP/2.0\r\n");
    }

    #[test]
    fn test_status_line_display() {
        let line = StatusLine::new(StatusCode::OK, "OK");

        assert_eq!(line.to_string(), "SIP/2.0 200 OK\r\n");
    }
}
