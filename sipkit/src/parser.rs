//! SIP message parsing.
//!
//! Datagram packets carry exactly one message per buffer; stream
//! transports are framed first by
//! [`StreamDecoder`](crate::transport::decoder) and the resulting frame
//! is parsed here. Syntax errors are recoverable (the message is
//! skipped); malformed messages are fatal for stream connections and
//! drop the packet on datagrams.

use bytes::Bytes;

use crate::error::{Error, Result, SipParserError};
use crate::headers::{Header, Headers};
use crate::message::{Method, Request, RequestLine, Response, SipMsg, SipUri, StatusCode, StatusLine};

const CRLF_CRLF: &[u8] = b"\r\n\r\n";

/// Parses a datagram payload into a SIP message.
///
/// The body is delimited by `Content-Length` when the header is
/// present; a value pointing past the end of the packet is malformed.
/// Without the header the body is the remainder of the datagram.
pub fn parse_datagram(bytes: &[u8]) -> Result<SipMsg> {
    parse_message(bytes, true)
}

/// Parses a stream frame, as produced by the stream decoder.
///
/// Frames on reliable transports carry an exact `Content-Length`; its
/// absence is malformed and fatal for the connection.
pub fn parse_framed(bytes: &[u8]) -> Result<SipMsg> {
    parse_message(bytes, false)
}

fn parse_message(bytes: &[u8], datagram: bool) -> Result<SipMsg> {
    let header_end = find_subslice(bytes, CRLF_CRLF)
        .map(|pos| (pos, pos + CRLF_CRLF.len()))
        .or_else(|| find_subslice(bytes, b"\n\n").map(|pos| (pos, pos + 2)));

    let Some((header_end, body_start)) = header_end else {
        return Err(Error::Malformed("Message without header terminator".into()));
    };

    let head = std::str::from_utf8(&bytes[..header_end]).map_err(SipParserError::from)?;
    let mut lines = head.split("\r\n").flat_map(|l| l.split('\n'));

    let start_line = lines
        .next()
        .ok_or_else(|| SipParserError::new("Empty message"))?;

    let mut headers = Headers::with_capacity(8);

    let mut pending: Option<(String, String)> = None;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // Folded continuation of the previous header line.
            match pending.as_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                None => return Err(SipParserError::new("Continuation without header").into()),
            }
            continue;
        }

        if let Some((name, value)) = pending.take() {
            headers.push(Header::parse(&name, &value)?);
        }

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| SipParserError::new(format!("Header line without colon: {}", line)))?;
        pending = Some((name.trim().to_string(), value.trim().to_string()));
    }
    if let Some((name, value)) = pending.take() {
        headers.push(Header::parse(&name, &value)?);
    }

    let body = parse_body(&bytes[body_start..], &headers, datagram)?;

    if let Some(rest) = start_line.strip_prefix("SIP/2.0 ") {
        let (code_str, reason) = rest
            .split_once(' ')
            .map(|(c, r)| (c, r))
            .unwrap_or((rest, ""));
        let code: u16 = code_str
            .parse()
            .map_err(|_| SipParserError::new(format!("Invalid status code: {}", code_str)))?;
        if !(100..700).contains(&code) {
            return Err(SipParserError::new(format!("Status code out of range: {}", code)).into());
        }

        let mut response = Response::new(StatusLine::new(StatusCode::new(code), reason));
        response.headers = headers;
        response.body = body;

        Ok(SipMsg::Response(response))
    } else {
        let mut parts = start_line.split(' ');
        let (method, uri, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(u), Some(v)) => (m, u, v),
            _ => return Err(SipParserError::new(format!("Invalid request line: {}", start_line)).into()),
        };
        if version != "SIP/2.0" {
            return Err(SipParserError::new(format!("Unsupported version: {}", version)).into());
        }

        Ok(SipMsg::Request(Request {
            req_line: RequestLine {
                method: Method::from(method),
                uri: SipUri::parse(uri)?,
            },
            headers,
            body,
        }))
    }
}

fn parse_body(rest: &[u8], headers: &Headers, datagram: bool) -> Result<Option<Bytes>> {
    match headers.content_length() {
        Some(cl) => {
            let len = cl.len();
            if len > rest.len() {
                return Err(Error::Malformed(format!(
                    "Content-Length {} exceeds remaining {} bytes",
                    len,
                    rest.len()
                )));
            }
            if len == 0 {
                Ok(None)
            } else {
                Ok(Some(Bytes::copy_from_slice(&rest[..len])))
            }
        }
        None if datagram => {
            // The body runs to the end of the packet.
            if rest.is_empty() {
                Ok(None)
            } else {
                Ok(Some(Bytes::copy_from_slice(rest)))
            }
        }
        None => Err(Error::Malformed(
            "Missing Content-Length on stream transport".into(),
        )),
    }
}

pub(crate) fn find_subslice(src: &[u8], needle: &[u8]) -> Option<usize> {
    src.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTER: &[u8] = b"REGISTER sip:registrar.biloxi.example.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP bobspc.biloxi.example.com:5060;branch=z9hG4bKnashds7\r\n\
        Max-Forwards: 70\r\n\
        To: Bob <sip:bob@biloxi.example.com>\r\n\
        From: Bob <sip:bob@biloxi.example.com>;tag=456248\r\n\
        Call-ID: 843817637684230@998sdasdh09\r\n\
        CSeq: 1826 REGISTER\r\n\
        Contact: <sip:bob@192.0.2.4>\r\n\
        Content-Length: 0\r\n\r\n";

    #[test]
    fn test_parse_request() {
        let msg = parse_datagram(REGISTER).unwrap();

        let SipMsg::Request(req) = msg else {
            panic!("Expected a request");
        };
        assert_eq!(req.method(), &Method::Register);
        assert_eq!(req.headers.via().unwrap().branch(), Some("z9hG4bKnashds7"));
        assert_eq!(req.headers.cseq().unwrap().cseq(), 1826);
        assert!(req.body.is_none());
    }

    #[test]
    fn test_parse_response() {
        let raw = b"SIP/2.0 180 Ringing\r\n\
            Via: SIP/2.0/UDP pc33.atlanta.example.com;branch=z9hG4bK776asdhds\r\n\
            To: Bob <sip:bob@biloxi.example.com>;tag=a6c85cf\r\n\
            From: Alice <sip:alice@atlanta.example.com>;tag=1928301774\r\n\
            Call-ID: a84b4c76e66710\r\n\
            CSeq: 314159 INVITE\r\n\
            Content-Length: 0\r\n\r\n";

        let msg = parse_datagram(raw).unwrap();

        let SipMsg::Response(res) = msg else {
            panic!("Expected a response");
        };
        assert_eq!(res.code(), StatusCode::RINGING);
        assert_eq!(res.headers.to_hdr().unwrap().tag(), Some("a6c85cf"));
    }

    #[test]
    fn test_datagram_body_without_content_length() {
        let raw = b"MESSAGE sip:bob@biloxi.example.com SIP/2.0\r\n\
            Via: SIP/2.0/UDP pc33.atlanta.example.com;branch=z9hG4bK77\r\n\
            Call-ID: m1\r\n\
            CSeq: 1 MESSAGE\r\n\r\nhello";

        let msg = parse_datagram(raw).unwrap();

        assert_eq!(msg.body().unwrap().as_ref(), b"hello");
    }

    #[test]
    fn test_datagram_truncated_body_is_malformed() {
        let raw = b"MESSAGE sip:bob@biloxi.example.com SIP/2.0\r\n\
            Via: SIP/2.0/UDP pc33.atlanta.example.com;branch=z9hG4bK77\r\n\
            Content-Length: 100\r\n\r\nhello";

        assert_matches!(parse_datagram(raw), Err(Error::Malformed(_)));
    }

    #[test]
    fn test_stream_frame_requires_content_length() {
        let raw = b"OPTIONS sip:bob@biloxi.example.com SIP/2.0\r\n\
            Via: SIP/2.0/TCP pc33.atlanta.example.com;branch=z9hG4bK77\r\n\r\n";

        assert_matches!(parse_framed(raw), Err(Error::Malformed(_)));
    }

    #[test]
    fn test_syntax_error_is_recoverable() {
        let raw = b"BROKEN\r\nVia: SIP/2.0/UDP x\r\n\r\n";

        let err = parse_datagram(raw).unwrap_err();
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_folded_header() {
        let raw = b"OPTIONS sip:bob@biloxi.example.com SIP/2.0\r\n\
            Via: SIP/2.0/UDP pc33.atlanta.example.com\r\n \
            ;branch=z9hG4bK77\r\n\
            Content-Length: 0\r\n\r\n";

        let msg = parse_datagram(raw).unwrap();
        assert_eq!(msg.top_via().unwrap().branch(), Some("z9hG4bK77"));
    }
}
