use std::fmt;

use serde::{Deserialize, Serialize};

/// The class of a response status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeClass {
    /// 1xx, request received and being processed.
    Provisional,
    /// 2xx, the action was successfully received and accepted.
    Success,
    /// 3xx, further action needs to be taken.
    Redirection,
    /// 4xx, the request contains bad syntax or cannot be fulfilled here.
    RequestFailure,
    /// 5xx, the server failed to fulfill an apparently valid request.
    ServerFailure,
    /// 6xx, the request cannot be fulfilled at any server.
    GlobalFailure,
}

/// An SIP response status code, 100-699.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(u16);

impl StatusCode {
    /// `100 Trying`
    pub const TRYING: StatusCode = StatusCode(100);
    /// `180 Ringing`
    pub const RINGING: StatusCode = StatusCode(180);
    /// `200 OK`
    pub const OK: StatusCode = StatusCode(200);
    /// `202 Accepted`
    pub const ACCEPTED: StatusCode = StatusCode(202);
    /// `302 Moved Temporarily`
    pub const MOVED_TEMPORARILY: StatusCode = StatusCode(302);
    /// `400 Bad Request`
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    /// `401 Unauthorized`
    pub const UNAUTHORIZED: StatusCode = StatusCode(401);
    /// `404 Not Found`
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    /// `408 Request Timeout`
    pub const REQUEST_TIMEOUT: StatusCode = StatusCode(408);
    /// `486 Busy Here`
    pub const BUSY_HERE: StatusCode = StatusCode(486);
    /// `487 Request Terminated`
    pub const REQUEST_TERMINATED: StatusCode = StatusCode(487);
    /// `500 Server Internal Error`
    pub const SERVER_ERROR: StatusCode = StatusCode(500);
    /// `503 Service Unavailable`
    pub const SERVICE_UNAVAILABLE: StatusCode = StatusCode(503);
    /// `603 Decline`
    pub const DECLINE: StatusCode = StatusCode(603);

    /// Creates a status code. Panics outside 100-699 in debug builds.
    pub fn new(code: u16) -> Self {
        debug_assert!((100..700).contains(&code), "status code out of range: {code}");
        StatusCode(code)
    }

    /// Returns the numeric code.
    pub fn code(&self) -> u16 {
        self.0
    }

    /// Returns the code class.
    pub fn class(&self) -> CodeClass {
        match self.0 {
            100..=199 => CodeClass::Provisional,
            200..=299 => CodeClass::Success,
            300..=399 => CodeClass::Redirection,
            400..=499 => CodeClass::RequestFailure,
            500..=599 => CodeClass::ServerFailure,
            _ => CodeClass::GlobalFailure,
        }
    }

    /// `true` for 1xx codes.
    pub fn is_provisional(&self) -> bool {
        self.class() == CodeClass::Provisional
    }

    /// `true` for 2xx codes.
    pub fn is_success(&self) -> bool {
        self.class() == CodeClass::Success
    }

    /// `true` for 200-699 codes.
    pub fn is_final(&self) -> bool {
        self.0 >= 200
    }

    /// The default reason phrase for the code.
    pub fn reason(&self) -> &'static str {
        match self.0 {
            100 => "Trying",
            180 => "Ringing",
            181 => "Call Is Being Forwarded",
            183 => "Session Progress",
            200 => "OK",
            202 => "Accepted",
            300 => "Multiple Choices",
            301 => "Moved Permanently",
            302 => "Moved Temporarily",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            415 => "Unsupported Media Type",
            420 => "Bad Extension",
            481 => "Call/Transaction Does Not Exist",
            482 => "Loop Detected",
            486 => "Busy Here",
            487 => "Request Terminated",
            488 => "Not Acceptable Here",
            500 => "Server Internal Error",
            501 => "Not Implemented",
            503 => "Service Unavailable",
            504 => "Server Time-out",
            600 => "Busy Everywhere",
            603 => "Decline",
            604 => "Does Not Exist Anywhere",
            606 => "Not Acceptable",
            _ => match self.class() {
                CodeClass::Provisional => "Trying",
                CodeClass::Success => "OK",
                CodeClass::Redirection => "Moved",
                CodeClass::RequestFailure => "Request Failure",
                CodeClass::ServerFailure => "Server Failure",
                CodeClass::GlobalFailure => "Global Failure",
            },
        }
    }
}

impl From<u16> for StatusCode {
    fn from(code: u16) -> Self {
        StatusCode::new(code)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classes() {
        assert!(StatusCode::TRYING.is_provisional());
        assert!(StatusCode::OK.is_success());
        assert!(StatusCode::OK.is_final());
        assert!(!StatusCode::RINGING.is_final());
        assert_eq!(StatusCode::BUSY_HERE.class(), CodeClass::RequestFailure);
        assert_eq!(StatusCode::DECLINE.class(), CodeClass::GlobalFailure);
    }

    #[test]
    fn test_reason() {
        assert_eq!(StatusCode::BUSY_HERE.reason(), "Busy Here");
        assert_eq!(StatusCode::new(299).reason(), "OK");
    }
}
