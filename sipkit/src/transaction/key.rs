//! Transaction key derivation, RFC 3261 17.1.3 and 17.2.3.

use serde::{Deserialize, Serialize};
use util::ArcStr;

use crate::message::{HostPort, Method};
use crate::transport::{IncomingRequest, OutgoingRequest};

const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// Generates an RFC 3261 branch parameter: the magic cookie followed
/// by a random alphanumeric tail.
pub fn generate_branch() -> String {
    use rand::distr::Alphanumeric;
    use rand::Rng;

    let tail: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();

    format!("{}{}", BRANCH_MAGIC_COOKIE, tail)
}

/// Uniquely identifies a live transaction in the store.
#[derive(PartialEq, Eq, Hash, Clone, Debug, Serialize, Deserialize)]
pub enum TsxKey {
    /// Legacy key for requests whose branch lacks the magic cookie.
    Rfc2543(Rfc2543),
    /// Cookie-prefixed branch key.
    Rfc3261(Rfc3261),
}

impl TsxKey {
    /// Client-side key: branch of the top Via plus the CSeq method.
    pub fn create_client_with(method: &Method, branch: &str) -> Self {
        TsxKey::Rfc3261(Rfc3261::Client(ClientKey {
            branch: branch.into(),
            method: canonical_method(method),
        }))
    }

    /// Key for an outbound request. The branch is read from the top
    /// Via, which the endpoint populates before the transaction is
    /// created.
    pub fn create_client(request: &OutgoingRequest) -> Self {
        let via = request.msg.headers.via().expect("Outbound request carries a Via");
        let cseq = request.msg.headers.cseq().expect("Outbound request carries a CSeq");
        let branch = via.branch().expect("Outbound request Via carries a branch");

        Self::create_client_with(cseq.method(), branch)
    }

    /// Server-side key per 17.2.3. ACK maps onto the INVITE
    /// transaction it acknowledges; non-cookie branches fall back to
    /// the RFC 2543 tuple.
    pub fn create_server(request: &IncomingRequest) -> Self {
        let headers = &request.request_headers;

        match headers.via.branch() {
            Some(branch) if branch.starts_with(BRANCH_MAGIC_COOKIE) => TsxKey::Rfc3261(Rfc3261::Server(ServerKey {
                branch: branch.into(),
                via_sent_by: headers.via.sent_by().clone(),
                method: canonical_method(headers.cseq.method()),
            })),
            _ => TsxKey::Rfc2543(Rfc2543 {
                cseq: headers.cseq.cseq(),
                from_tag: headers.from.tag().map(ArcStr::from),
                to_tag: headers.to.tag().map(ArcStr::from),
                call_id: headers.call_id.id().clone(),
                via_sent_by: headers.via.sent_by().clone(),
                method: canonical_method(headers.cseq.method()),
            }),
        }
    }
}

/// CANCEL and ACK identify the transaction of the request they refer
/// to, not one of their own.
fn canonical_method(method: &Method) -> Method {
    match method {
        Method::Ack => Method::Invite,
        other => other.clone(),
    }
}

/// The RFC 2543 17.2.3 fallback tuple.
#[derive(PartialEq, Eq, Hash, Clone, Debug, Serialize, Deserialize)]
pub struct Rfc2543 {
    /// CSeq number.
    pub cseq: u32,
    /// From tag, when present.
    pub from_tag: Option<ArcStr>,
    /// To tag, when present. Excluded for ACK/CANCEL matching by the
    /// store before comparison.
    pub to_tag: Option<ArcStr>,
    /// Call-ID.
    pub call_id: ArcStr,
    /// Top Via sent-by.
    pub via_sent_by: HostPort,
    /// CSeq method, with ACK folded onto INVITE.
    pub method: Method,
}

/// RFC 3261 keys carry the branch and differ between the two sides.
#[derive(PartialEq, Eq, Hash, Clone, Debug, Serialize, Deserialize)]
pub enum Rfc3261 {
    /// Client side: branch + method.
    Client(ClientKey),
    /// Server side: branch + sent-by + method.
    Server(ServerKey),
}

/// Client transaction key component.
#[derive(PartialEq, Eq, Hash, Clone, Debug, Serialize, Deserialize)]
pub struct ClientKey {
    branch: ArcStr,
    method: Method,
}

/// Server transaction key component.
#[derive(PartialEq, Eq, Hash, Clone, Debug, Serialize, Deserialize)]
pub struct ServerKey {
    branch: ArcStr,
    via_sent_by: HostPort,
    method: Method,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::mock;

    #[test]
    fn test_branch_has_cookie() {
        let branch = generate_branch();

        assert!(branch.starts_with(BRANCH_MAGIC_COOKIE));
        assert!(branch.len() > BRANCH_MAGIC_COOKIE.len());
        assert_ne!(branch, generate_branch());
    }

    #[test]
    fn test_ack_maps_to_invite_server_key() {
        let invite = mock::request(Method::Invite);
        let ack = mock::request(Method::Ack);

        assert_eq!(TsxKey::create_server(&invite), TsxKey::create_server(&ack));
    }

    #[test]
    fn test_client_key_distinguishes_method() {
        let invite = TsxKey::create_client_with(&Method::Invite, "z9hG4bK42");
        let bye = TsxKey::create_client_with(&Method::Bye, "z9hG4bK42");

        assert_ne!(invite, bye);
    }

    #[test]
    fn test_legacy_branch_falls_back_to_rfc2543() {
        let request = mock::request_with_branch(Method::Register, "1");

        assert_matches!(TsxKey::create_server(&request), TsxKey::Rfc2543(_));
    }
}
