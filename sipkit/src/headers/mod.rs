//! Typed SIP headers.
//!
//! Only the headers the transaction and transport layers route on are
//! parsed into structured form (`Via`, `From`, `To`, `Call-ID`, `CSeq`,
//! `Content-Length`, `Max-Forwards`). Everything else is carried
//! verbatim in [`Header::Other`] so rendering preserves the original
//! header order and content.

mod call_id;
mod content_length;
mod cseq;
mod from;
mod max_forwards;
mod to;
mod via;

pub use call_id::CallId;
pub use content_length::ContentLength;
pub use cseq::CSeq;
pub use from::From;
pub use max_forwards::MaxForwards;
pub use to::To;
pub use via::Via;

use std::fmt;

use util::ArcStr;

use crate::error::Result;
use crate::message::SipUri;

/// Parsing contract for a typed header.
pub trait SipHeaderParse: Sized {
    /// The canonical header name.
    const NAME: &'static str;
    /// The compact form, if the header has one.
    const SHORT_NAME: Option<&'static str> = None;

    /// Parses the header from its value text (everything after the
    /// colon, trimmed).
    fn parse(value: &str) -> Result<Self>;

    /// Case-insensitive match against canonical and compact names.
    fn matches_name(name: &str) -> bool {
        name.eq_ignore_ascii_case(Self::NAME)
            || Self::SHORT_NAME.is_some_and(|short| name.eq_ignore_ascii_case(short))
    }
}

/// One SIP header.
#[derive(Debug, Clone)]
pub enum Header {
    /// A `Via` header.
    Via(Via),
    /// A `From` header.
    From(From),
    /// A `To` header.
    To(To),
    /// A `Call-ID` header.
    CallId(CallId),
    /// A `CSeq` header.
    CSeq(CSeq),
    /// A `Content-Length` header.
    ContentLength(ContentLength),
    /// A `Max-Forwards` header.
    MaxForwards(MaxForwards),
    /// Any other header, name and value verbatim.
    Other {
        /// The header name as received.
        name: ArcStr,
        /// The header value as received.
        value: ArcStr,
    },
}

impl Header {
    /// Parses a header from its name and value text, producing a typed
    /// variant for the routing-critical headers and `Other` for the
    /// rest.
    pub fn parse(name: &str, value: &str) -> Result<Header> {
        if Via::matches_name(name) {
            Ok(Header::Via(Via::parse(value)?))
        } else if From::matches_name(name) {
            Ok(Header::From(From::parse(value)?))
        } else if To::matches_name(name) {
            Ok(Header::To(To::parse(value)?))
        } else if CallId::matches_name(name) {
            Ok(Header::CallId(CallId::parse(value)?))
        } else if CSeq::matches_name(name) {
            Ok(Header::CSeq(CSeq::parse(value)?))
        } else if ContentLength::matches_name(name) {
            Ok(Header::ContentLength(ContentLength::parse(value)?))
        } else if MaxForwards::matches_name(name) {
            Ok(Header::MaxForwards(MaxForwards::parse(value)?))
        } else {
            Ok(Header::Other {
                name: name.into(),
                value: value.into(),
            })
        }
    }

    /// The canonical name of this header.
    pub fn name(&self) -> &str {
        match self {
            Header::Via(_) => Via::NAME,
            Header::From(_) => From::NAME,
            Header::To(_) => To::NAME,
            Header::CallId(_) => CallId::NAME,
            Header::CSeq(_) => CSeq::NAME,
            Header::ContentLength(_) => ContentLength::NAME,
            Header::MaxForwards(_) => MaxForwards::NAME,
            Header::Other { name, .. } => name,
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Header::Via(h) => write!(f, "{}", h),
            Header::From(h) => write!(f, "{}", h),
            Header::To(h) => write!(f, "{}", h),
            Header::CallId(h) => write!(f, "{}", h),
            Header::CSeq(h) => write!(f, "{}", h),
            Header::ContentLength(h) => write!(f, "{}", h),
            Header::MaxForwards(h) => write!(f, "{}", h),
            Header::Other { name, value } => write!(f, "{}: {}", name, value),
        }
    }
}

/// An order-preserving SIP header list.
///
/// A header name may occur any number of times; iteration yields the
/// wire order.
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<Header>);

impl Headers {
    /// Creates an empty header list.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Creates an empty header list with room for `capacity` headers.
    pub fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }

    /// Appends a header at the end.
    pub fn push(&mut self, header: Header) {
        self.0.push(header);
    }

    /// Moves all headers of `other` to the end of this list.
    pub fn append(&mut self, other: &mut Headers) {
        self.0.append(&mut other.0);
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// `true` when no header is present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates in wire order.
    pub fn iter(&self) -> std::slice::Iter<'_, Header> {
        self.0.iter()
    }

    /// Iterates mutably in wire order.
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Header> {
        self.0.iter_mut()
    }

    /// All values for the given name (case-insensitive), in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Header> + 'a {
        self.0.iter().filter(move |h| h.name().eq_ignore_ascii_case(name))
    }

    /// `true` if at least one header with the given name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.get_all(name).next().is_some()
    }

    /// The topmost `Via` header.
    pub fn via(&self) -> Option<&Via> {
        self.0.iter().find_map(|h| match h {
            Header::Via(via) => Some(via),
            _ => None,
        })
    }

    /// The `From` header.
    pub fn from_hdr(&self) -> Option<&From> {
        self.0.iter().find_map(|h| match h {
            Header::From(from) => Some(from),
            _ => None,
        })
    }

    /// The `To` header.
    pub fn to_hdr(&self) -> Option<&To> {
        self.0.iter().find_map(|h| match h {
            Header::To(to) => Some(to),
            _ => None,
        })
    }

    /// The `Call-ID` header.
    pub fn call_id(&self) -> Option<&CallId> {
        self.0.iter().find_map(|h| match h {
            Header::CallId(call_id) => Some(call_id),
            _ => None,
        })
    }

    /// The `CSeq` header.
    pub fn cseq(&self) -> Option<&CSeq> {
        self.0.iter().find_map(|h| match h {
            Header::CSeq(cseq) => Some(cseq),
            _ => None,
        })
    }

    /// The `Content-Length` header.
    pub fn content_length(&self) -> Option<&ContentLength> {
        self.0.iter().find_map(|h| match h {
            Header::ContentLength(cl) => Some(cl),
            _ => None,
        })
    }
}

impl Extend<Header> for Headers {
    fn extend<T: IntoIterator<Item = Header>>(&mut self, iter: T) {
        self.0.extend(iter);
    }
}

impl IntoIterator for Headers {
    type Item = Header;
    type IntoIter = std::vec::IntoIter<Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = std::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// A display name plus URI, as it appears in `From` and `To`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NameAddr {
    /// The optional display name.
    pub display: Option<ArcStr>,
    /// The address URI.
    pub uri: SipUri,
}

impl NameAddr {
    /// Parses `[display] <uri>` or a bare `uri`, returning the address
    /// and any trailing `;`-separated header parameters.
    pub(crate) fn parse(value: &str) -> Result<(Self, Option<&str>)> {
        let value = value.trim();

        if let Some(open) = value.find('<') {
            let display = value[..open].trim().trim_matches('"');
            let rest = &value[open + 1..];
            let close = rest
                .find('>')
                .ok_or_else(|| crate::error::SipParserError::new("Unterminated name-addr"))?;

            let uri = SipUri::parse(rest[..close].trim())?;
            let params = rest[close + 1..].trim_start().strip_prefix(';');
            let display = if display.is_empty() { None } else { Some(display.into()) };

            Ok((NameAddr { display, uri }, params))
        } else {
            // addr-spec form. Trailing ;-parameters belong to the
            // header, not the URI.
            let (addr, params) = match value.split_once(';') {
                Some((addr, params)) => (addr, Some(params)),
                None => (value, None),
            };

            let uri = SipUri::parse(addr.trim())?;

            Ok((NameAddr { display: None, uri }, params))
        }
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(display) = &self.display {
            write!(f, "\"{}\" ", display)?;
        }
        write!(f, "<{}>", self.uri)
    }
}

/// Extracts a named parameter from a `;`-separated parameter list.
pub(crate) fn find_param<'a>(params: &'a str, name: &str) -> Option<&'a str> {
    params.split(';').find_map(|p| {
        let p = p.trim();
        match p.split_once('=') {
            Some((n, v)) if n.eq_ignore_ascii_case(name) => Some(v.trim()),
            None if p.eq_ignore_ascii_case(name) => Some(""),
            _ => None,
        }
    })
}

/// Removes a named parameter from a `;`-separated parameter list,
/// returning the remainder, or `None` when nothing is left.
pub(crate) fn strip_param(params: &str, name: &str) -> Option<ArcStr> {
    let rest: Vec<&str> = params
        .split(';')
        .map(str::trim)
        .filter(|p| {
            let pname = p.split_once('=').map(|(n, _)| n).unwrap_or(p);
            !pname.eq_ignore_ascii_case(name)
        })
        .collect();

    if rest.is_empty() {
        None
    } else {
        Some(rest.join(";").into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch() {
        let header = Header::parse("v", "SIP/2.0/UDP host.example.com;branch=z9hG4bK776asdhds").unwrap();
        assert_matches!(header, Header::Via(_));

        let header = Header::parse("Contact", "<sip:bob@192.0.2.4>").unwrap();
        assert_matches!(header, Header::Other { .. });
    }

    #[test]
    fn test_order_preserved() {
        let mut headers = Headers::new();

        headers.push(Header::parse("Via", "SIP/2.0/UDP a.example.com;branch=z9hG4bK1").unwrap());
        headers.push(Header::parse("Via", "SIP/2.0/UDP b.example.com;branch=z9hG4bK2").unwrap());

        let vias: Vec<_> = headers.get_all("via").collect();
        assert_eq!(vias.len(), 2);
        assert_eq!(headers.via().unwrap().branch(), Some("z9hG4bK1"));
    }

    #[test]
    fn test_name_addr() {
        let (addr, params) = NameAddr::parse("Bob <sip:bob@biloxi.example.com>;tag=a6c85cf").unwrap();

        assert_eq!(addr.display.as_deref(), Some("Bob"));
        assert_eq!(find_param(params.unwrap(), "tag"), Some("a6c85cf"));
    }

    #[test]
    fn test_addr_spec_params_are_header_params() {
        let (addr, params) = NameAddr::parse("sip:alice@atlanta.example.com;tag=1928301774").unwrap();

        assert_eq!(addr.uri.user.as_deref(), Some("alice"));
        assert!(addr.uri.params.is_none());
        assert_eq!(find_param(params.unwrap(), "tag"), Some("1928301774"));
    }
}
