//! Wire framing: splits an inbound frame into first line, folded headers
//! and body, then hands header values to the grammar layer.

use super::grammar::{parse_first_line, FirstLine};
use super::{Headers, Request, Response, SipMessage};
use crate::{Error, Result};

/// Parses one message-framed SIP datagram.
///
/// The body is truncated to `Content-Length` counted in UTF-8 bytes; a
/// declared length exceeding the available bytes rejects the frame
/// (RFC 3261 §18.3). Without `Content-Length` the remainder is the body.
pub fn parse(raw: &str) -> Result<SipMessage> {
    let (first, rest) = raw
        .split_once("\r\n")
        .ok_or_else(|| Error::ParseError("missing CRLF after first line".to_string()))?;

    let first_line = parse_first_line(first)
        .ok_or_else(|| Error::ParseError(format!("bad first line: {}", first)))?;

    let (header_block, body_bytes) = match rest.split_once("\r\n\r\n") {
        Some((headers, body)) => (headers, body),
        None => {
            // tolerate a frame ending exactly at the blank line
            let trimmed = rest.strip_suffix("\r\n").unwrap_or(rest);
            (trimmed, "")
        }
    };

    let mut headers = Headers::new();
    let mut current: Option<(String, String)> = None;
    for line in header_block.split("\r\n") {
        if line.starts_with(' ') || line.starts_with('\t') {
            // continuation line folds into the previous header value
            match current.as_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                None => {
                    return Err(Error::ParseError(
                        "continuation line before any header".to_string(),
                    ))
                }
            }
            continue;
        }
        if let Some((name, value)) = current.take() {
            headers.push(&name, &value);
        }
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::ParseError(format!("header without colon: {}", line)))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::ParseError(format!("header without name: {}", line)));
        }
        current = Some((name.to_string(), value.trim().to_string()));
    }
    if let Some((name, value)) = current.take() {
        headers.push(&name, &value);
    }

    for field in headers.iter() {
        if field.is_malformed() {
            return Err(Error::ParseError(format!(
                "unparseable {} header: {}",
                field.name(),
                field.value()
            )));
        }
    }

    let body = extract_body(body_bytes, &headers)?;

    match first_line {
        FirstLine::Request { method, uri } => Ok(SipMessage::Request(Request {
            method,
            uri,
            headers,
            body,
        })),
        FirstLine::Response {
            status_code,
            reason_phrase,
        } => Ok(SipMessage::Response(Response {
            status_code,
            reason_phrase,
            headers,
            body,
        })),
    }
}

fn extract_body(body: &str, headers: &Headers) -> Result<String> {
    let declared = match headers.field("Content-Length") {
        Some(_) => headers
            .content_length()
            .ok_or_else(|| Error::ParseError("bad Content-Length".to_string()))?
            as usize,
        None => return Ok(body.to_string()),
    };

    let available = body.len();
    if declared > available {
        return Err(Error::ParseError(format!(
            "Content-Length {} exceeds available {} bytes",
            declared, available
        )));
    }
    // excess bytes beyond the declared length are discarded
    let mut cut = declared;
    while cut > 0 && !body.is_char_boundary(cut) {
        cut -= 1;
    }
    Ok(body[..cut].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Method;

    const INVITE: &str = "INVITE sip:bob@example.com SIP/2.0\r\n\
        Via: SIP/2.0/WS x7kqq1tcnml6.invalid;branch=z9hG4bK563128\r\n\
        Max-Forwards: 69\r\n\
        To: <sip:bob@example.com>\r\n\
        From: \"Alice\" <sip:alice@example.com>;tag=fiwm52c07f\r\n\
        Call-ID: ud6cgmln82lmafejjlp6\r\n\
        CSeq: 6913 INVITE\r\n\
        Contact: <sip:alice@x7kqq1tcnml6.invalid;transport=ws;ob>\r\n\
        Content-Type: application/sdp\r\n\
        Content-Length: 4\r\n\
        \r\n\
        v=0\r\n";

    #[test]
    fn parses_request() {
        let msg = parse(INVITE).expect("parse");
        let req = match msg {
            SipMessage::Request(req) => req,
            _ => panic!("expected request"),
        };
        assert_eq!(req.method, Method::Invite);
        assert_eq!(req.headers.call_id(), Some("ud6cgmln82lmafejjlp6"));
        assert_eq!(req.headers.cseq().unwrap().seq, 6913);
        assert_eq!(req.headers.from_tag().as_deref(), Some("fiwm52c07f"));
        assert_eq!(req.headers.to_tag(), None);
        assert_eq!(req.headers.branch().as_deref(), Some("z9hG4bK563128"));
        // body truncated to the declared 4 bytes, excess discarded
        assert_eq!(req.body, "v=0\r");
    }

    #[test]
    fn parses_response() {
        let raw = "SIP/2.0 180 Ringing\r\n\
            Via: SIP/2.0/WS host.invalid;branch=z9hG4bK77\r\n\
            To: <sip:bob@example.com>;tag=99sj\r\n\
            From: <sip:alice@example.com>;tag=fiwm\r\n\
            Call-ID: abc\r\n\
            CSeq: 1 INVITE\r\n\
            Content-Length: 0\r\n\r\n";
        let msg = parse(raw).expect("parse");
        match msg {
            SipMessage::Response(resp) => {
                assert_eq!(resp.status_code, 180);
                assert_eq!(resp.cseq_method(), Some(Method::Invite));
                assert_eq!(resp.headers.to_tag().as_deref(), Some("99sj"));
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn folded_header_lines_unfold() {
        let raw = "OPTIONS sip:bob@example.com SIP/2.0\r\n\
            Via: SIP/2.0/WS host.invalid\r\n\
            \t;branch=z9hG4bKfold\r\n\
            Call-ID: abc\r\n\
            CSeq: 1 OPTIONS\r\n\
            From: <sip:a@b.c>;tag=1\r\n\
            Content-Length: 0\r\n\r\n";
        let msg = parse(raw).expect("parse");
        assert_eq!(
            msg.headers().branch().as_deref(),
            Some("z9hG4bKfold"),
            "folded Via must reassemble"
        );
    }

    #[test]
    fn rejects_oversized_content_length() {
        let raw = "MESSAGE sip:bob@example.com SIP/2.0\r\n\
            Call-ID: abc\r\n\
            CSeq: 1 MESSAGE\r\n\
            Content-Length: 100\r\n\
            \r\nshort";
        assert!(matches!(parse(raw), Err(Error::ParseError(_))));
    }

    #[test]
    fn rejects_malformed_known_header() {
        let raw = "MESSAGE sip:bob@example.com SIP/2.0\r\n\
            CSeq: broken\r\n\
            Content-Length: 0\r\n\r\n";
        assert!(matches!(parse(raw), Err(Error::ParseError(_))));
    }

    #[test]
    fn rejects_missing_crlf() {
        assert!(parse("INVITE sip:bob@example.com SIP/2.0").is_err());
    }

    #[test]
    fn round_trips_through_serialisation() {
        let msg = parse(INVITE).expect("parse");
        let req = match msg {
            SipMessage::Request(req) => req,
            _ => unreachable!(),
        };
        let wire = req.to_string();
        let reparsed = match parse(&wire).expect("reparse") {
            SipMessage::Request(req) => req,
            _ => unreachable!(),
        };
        assert_eq!(reparsed.method, req.method);
        assert_eq!(reparsed.uri.to_string(), req.uri.to_string());
        assert_eq!(reparsed.body, req.body);
        assert_eq!(reparsed.headers.len(), req.headers.len());
        for (a, b) in reparsed.headers.iter().zip(req.headers.iter()) {
            assert_eq!(a.name(), b.name());
            assert_eq!(a.value(), b.value());
        }
    }
}
