use std::io;

use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use super::Payload;
use crate::headers::{ContentLength, SipHeaderParse};
use crate::parser::find_subslice;

// Streams without a complete header block within this many bytes are
// considered poisoned.
const MAX_HEADER_BYTES: usize = 16 * 1024;

/// RFC 3261 7.5 framing for stream transports: a start line and
/// headers up to the blank line, then exactly `Content-Length` body
/// bytes. A frame without `Content-Length` is fatal for the
/// connection.
#[derive(Default)]
pub(crate) struct StreamDecoder;

impl Decoder for StreamDecoder {
    type Error = io::Error;
    type Item = Payload;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Check if is keep-alive.
        if is_keep_alive(src) {
            src.advance(src.len());
            return Ok(None);
        }

        // Find header end.
        let hdr_end = b"\n\r\n";
        let pos = find_subslice(src, hdr_end);
        let Some(pos) = pos else {
            if src.len() > MAX_HEADER_BYTES {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "Header block exceeds maximum size",
                ));
            }
            return Ok(None);
        };
        let body_start = pos + 3;
        let hdr_end = pos + 1;

        // Find "Content-Length" header
        let mut content_length = None;

        let lines = src[..hdr_end].split(|&b| b == b'\n');
        for line in lines {
            let mut split = line.splitn(2, |&c| c == b':');
            let Some(name) = split.next() else {
                continue;
            };
            let Ok(name) = std::str::from_utf8(name) else {
                continue;
            };
            if ContentLength::matches_name(name.trim()) {
                let Some(value) = split.next() else {
                    continue;
                };
                let Ok(value_str) = std::str::from_utf8(value) else {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "Invalid UTF-8 in Content-Length header",
                    ));
                };
                if let Ok(parsed_value) = value_str.trim().parse::<usize>() {
                    content_length = Some(parsed_value);
                }
            }
        }

        if let Some(c_len) = content_length {
            let expected_msg_size = body_start + c_len;
            if src.len() < expected_msg_size {
                src.reserve(expected_msg_size - src.len());
                return Ok(None);
            }
            let src_bytes = src.split_to(expected_msg_size);
            let src_bytes = src_bytes.freeze();

            Ok(Some(Payload::new(src_bytes)))
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Content-Length not found",
            ))
        }
    }
}

fn is_keep_alive(buf: &[u8]) -> bool {
    matches!(buf, b"\r\n\r\n" | b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSG: &[u8] = b"OPTIONS sip:bob@biloxi.example.com SIP/2.0\r\n\
        Via: SIP/2.0/TCP pc33.atlanta.example.com;branch=z9hG4bK77\r\n\
        Content-Length: 4\r\n\r\nping";

    #[test]
    fn test_whole_frame() {
        let mut decoder = StreamDecoder;
        let mut buf = BytesMut::from(MSG);

        let payload = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(payload.buf(), MSG);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut decoder = StreamDecoder;
        let mut buf = BytesMut::from(&MSG[..MSG.len() - 2]);

        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&MSG[MSG.len() - 2..]);
        let payload = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(payload.buf(), MSG);
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut decoder = StreamDecoder;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(MSG);
        buf.extend_from_slice(MSG);

        assert!(decoder.decode(&mut buf).unwrap().is_some());
        assert!(decoder.decode(&mut buf).unwrap().is_some());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_missing_content_length_is_fatal() {
        let mut decoder = StreamDecoder;
        let mut buf = BytesMut::from(
            &b"OPTIONS sip:b@x.example.com SIP/2.0\r\nVia: SIP/2.0/TCP a\r\n\r\n"[..],
        );

        assert!(decoder.decode(&mut buf).is_err());
    }

    #[test]
    fn test_keep_alive_consumed() {
        let mut decoder = StreamDecoder;
        let mut buf = BytesMut::from(&b"\r\n\r\n"[..]);

        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }
}
