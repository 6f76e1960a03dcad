use std::fmt;

use serde::{Deserialize, Serialize};
use util::ArcStr;

/// An SIP request method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// `INVITE` method.
    Invite,
    /// `ACK` method.
    Ack,
    /// `BYE` method.
    Bye,
    /// `CANCEL` method.
    Cancel,
    /// `REGISTER` method.
    Register,
    /// `OPTIONS` method.
    Options,
    /// `SUBSCRIBE` method.
    Subscribe,
    /// `NOTIFY` method.
    Notify,
    /// `REFER` method.
    Refer,
    /// `INFO` method.
    Info,
    /// `MESSAGE` method.
    Message,
    /// `UPDATE` method.
    Update,
    /// `PRACK` method.
    Prack,
    /// `PUBLISH` method.
    Publish,
    /// Any extension method.
    Other(ArcStr),
}

impl Method {
    /// Returns the method token as sent on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Register => "REGISTER",
            Method::Options => "OPTIONS",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Refer => "REFER",
            Method::Info => "INFO",
            Method::Message => "MESSAGE",
            Method::Update => "UPDATE",
            Method::Prack => "PRACK",
            Method::Publish => "PUBLISH",
            Method::Other(token) => token,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Method {
    fn from(token: &str) -> Self {
        match token {
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "REGISTER" => Method::Register,
            "OPTIONS" => Method::Options,
            "SUBSCRIBE" => Method::Subscribe,
            "NOTIFY" => Method::Notify,
            "REFER" => Method::Refer,
            "INFO" => Method::Info,
            "MESSAGE" => Method::Message,
            "UPDATE" => Method::Update,
            "PRACK" => Method::Prack,
            "PUBLISH" => Method::Publish,
            other => Method::Other(other.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        assert_eq!(Method::from("INVITE"), Method::Invite);
        assert_eq!(Method::from("ACK").as_str(), "ACK");
        assert_matches!(Method::from("TICKLE"), Method::Other(_));
    }
}
