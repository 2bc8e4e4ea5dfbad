//! Header-specific grammars.
//!
//! Each `parse_*` function returns `Option<T>`; `None` means the value does
//! not match the grammar. Callers decide whether the header is load-bearing
//! enough to reject the whole message.

use super::uri::{NameAddr, Params, Uri};
use super::Method;

/// First line of a SIP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirstLine {
    Request { method: Method, uri: Uri },
    Response { status_code: u16, reason_phrase: String },
}

pub fn parse_first_line(line: &str) -> Option<FirstLine> {
    let line = line.trim_end();
    if let Some(rest) = line.strip_prefix("SIP/2.0 ") {
        let (code, reason) = match rest.split_once(' ') {
            Some((code, reason)) => (code, reason),
            None => (rest, ""),
        };
        let status_code: u16 = code.parse().ok()?;
        if !(100..700).contains(&status_code) {
            return None;
        }
        return Some(FirstLine::Response {
            status_code,
            reason_phrase: reason.to_string(),
        });
    }

    let mut parts = line.split(' ');
    let method_token = parts.next()?;
    let uri_token = parts.next()?;
    let version = parts.next()?;
    if parts.next().is_some() || version != "SIP/2.0" {
        return None;
    }
    if method_token.is_empty()
        || !method_token
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    {
        return None;
    }
    let uri = Uri::parse(uri_token).ok()?;
    Some(FirstLine::Request {
        method: Method::from_token(method_token),
        uri,
    })
}

/// Parsed Via header (RFC 3261 §20.42).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Via {
    pub transport: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
}

impl Via {
    pub fn branch(&self) -> Option<&str> {
        self.params.value("branch")
    }
}

impl std::fmt::Display for Via {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SIP/2.0/{} ", self.transport)?;
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.params)
    }
}

pub fn parse_via(value: &str) -> Option<Via> {
    let value = value.trim();
    let rest = value
        .strip_prefix("SIP/2.0/")
        .or_else(|| value.strip_prefix("SIP / 2.0 / "))?;
    let (transport, rest) = rest.split_once(|c: char| c.is_ascii_whitespace())?;
    if transport.is_empty() {
        return None;
    }

    let mut segments = rest.trim_start().split(';');
    let sent_by = segments.next()?.trim();
    let (host, port) = if let Some(stripped) = sent_by.strip_prefix('[') {
        let end = stripped.find(']')?;
        let host = &stripped[..end];
        let port = stripped[end + 1..]
            .strip_prefix(':')
            .map(|p| p.parse().ok())
            .unwrap_or(None);
        (host.to_string(), port)
    } else {
        match sent_by.split_once(':') {
            Some((host, port)) => (host.to_string(), Some(port.parse().ok()?)),
            None => (sent_by.to_string(), None),
        }
    };
    if host.is_empty() {
        return None;
    }

    let mut params = Params::new();
    for segment in segments {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        match segment.split_once('=') {
            Some((k, v)) => params.set(k.trim(), Some(v.trim())),
            None => params.set(segment, None),
        }
    }

    Some(Via {
        transport: transport.to_ascii_uppercase(),
        host,
        port,
        params,
    })
}

/// Parsed CSeq header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl std::fmt::Display for CSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

pub fn parse_cseq(value: &str) -> Option<CSeq> {
    let (seq, method) = value.trim().split_once(' ')?;
    let seq: u32 = seq.trim().parse().ok()?;
    let method = method.trim();
    if method.is_empty() {
        return None;
    }
    Some(CSeq {
        seq,
        method: Method::from_token(method),
    })
}

pub fn parse_name_addr(value: &str) -> Option<NameAddr> {
    NameAddr::parse(value).ok()
}

/// Splits a comma-separated header value respecting quoted strings and
/// angle brackets, for Contact / Route / Record-Route lists.
pub fn split_list(value: &str) -> Vec<&str> {
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut escaped = false;
    let mut start = 0usize;
    for (i, c) in value.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            '<' if !quoted => depth += 1,
            '>' if !quoted => depth = depth.saturating_sub(1),
            ',' if !quoted && depth == 0 => {
                items.push(value[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    items.push(value[start..].trim());
    items.retain(|item| !item.is_empty());
    items
}

pub fn parse_name_addr_list(value: &str) -> Option<Vec<NameAddr>> {
    let items = split_list(value);
    if items.is_empty() {
        return None;
    }
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(NameAddr::parse(item).ok()?);
    }
    Some(out)
}

pub fn parse_u32(value: &str) -> Option<u32> {
    value.trim().parse().ok()
}

/// Content-Type, reduced to the media type; parameters are kept raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    pub media_type: String,
    pub params: Params,
}

pub fn parse_content_type(value: &str) -> Option<ContentType> {
    let mut segments = value.trim().split(';');
    let media_type = segments.next()?.trim();
    if media_type.is_empty() || !media_type.contains('/') {
        return None;
    }
    let mut params = Params::new();
    for segment in segments {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        match segment.split_once('=') {
            Some((k, v)) => params.set(k.trim(), Some(v.trim())),
            None => params.set(segment, None),
        }
    }
    Some(ContentType {
        media_type: media_type.to_ascii_lowercase(),
        params,
    })
}

/// Digest challenge from WWW-Authenticate / Proxy-Authenticate.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Challenge {
    pub scheme: String,
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    pub qop: Vec<String>,
    pub stale: bool,
}

pub fn parse_challenge(value: &str) -> Option<Challenge> {
    let value = value.trim();
    let (scheme, rest) = value.split_once(|c: char| c.is_ascii_whitespace())?;
    let mut challenge = Challenge {
        scheme: scheme.to_string(),
        ..Default::default()
    };
    if !scheme.eq_ignore_ascii_case("Digest") {
        return Some(challenge);
    }
    for (key, raw) in split_auth_params(rest) {
        let unquoted = unquote(raw);
        match key.to_ascii_lowercase().as_str() {
            "realm" => challenge.realm = unquoted,
            "nonce" => challenge.nonce = unquoted,
            "opaque" => challenge.opaque = Some(unquoted),
            "algorithm" => challenge.algorithm = Some(unquoted),
            "stale" => challenge.stale = unquoted.eq_ignore_ascii_case("true"),
            "qop" => {
                challenge.qop = unquoted
                    .split(',')
                    .map(|q| q.trim().to_ascii_lowercase())
                    .filter(|q| !q.is_empty())
                    .collect()
            }
            _ => {}
        }
    }
    if challenge.nonce.is_empty() {
        return None;
    }
    Some(challenge)
}

/// Digest credentials from an Authorization header; used by tests standing
/// in for a registrar.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Credentials {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub cnonce: Option<String>,
    pub nc: Option<String>,
    pub qop: Option<String>,
}

pub fn parse_credentials(value: &str) -> Option<Credentials> {
    let value = value.trim();
    let (scheme, rest) = value.split_once(|c: char| c.is_ascii_whitespace())?;
    if !scheme.eq_ignore_ascii_case("Digest") {
        return None;
    }
    let mut creds = Credentials::default();
    for (key, raw) in split_auth_params(rest) {
        let unquoted = unquote(raw);
        match key.to_ascii_lowercase().as_str() {
            "username" => creds.username = unquoted,
            "realm" => creds.realm = unquoted,
            "nonce" => creds.nonce = unquoted,
            "uri" => creds.uri = unquoted,
            "response" => creds.response = unquoted,
            "cnonce" => creds.cnonce = Some(unquoted),
            "nc" => creds.nc = Some(unquoted),
            "qop" => creds.qop = Some(unquoted),
            _ => {}
        }
    }
    if creds.response.is_empty() {
        return None;
    }
    Some(creds)
}

/// Splits `k=v, k="v with, comma"` auth parameter lists.
fn split_auth_params(input: &str) -> Vec<(&str, &str)> {
    let mut out = Vec::new();
    let mut quoted = false;
    let mut escaped = false;
    let mut start = 0usize;
    let mut boundaries = Vec::new();
    for (i, c) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            ',' if !quoted => {
                boundaries.push((start, i));
                start = i + 1;
            }
            _ => {}
        }
    }
    boundaries.push((start, input.len()));
    for (s, e) in boundaries {
        if let Some((k, v)) = input[s..e].trim().split_once('=') {
            out.push((k.trim(), v.trim()));
        }
    }
    out
}

fn unquote(raw: &str) -> String {
    let raw = raw.trim();
    if let Some(inner) = raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else {
                out.push(c);
            }
        }
        out
    } else {
        raw.to_string()
    }
}

/// Replaces header (RFC 3891).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replaces {
    pub call_id: String,
    pub to_tag: String,
    pub from_tag: String,
    pub early_only: bool,
}

pub fn parse_replaces(value: &str) -> Option<Replaces> {
    let mut segments = value.trim().split(';');
    let call_id = segments.next()?.trim();
    if call_id.is_empty() {
        return None;
    }
    let mut to_tag = None;
    let mut from_tag = None;
    let mut early_only = false;
    for segment in segments {
        let segment = segment.trim();
        match segment.split_once('=') {
            Some((k, v)) if k.eq_ignore_ascii_case("to-tag") => to_tag = Some(v.trim()),
            Some((k, v)) if k.eq_ignore_ascii_case("from-tag") => from_tag = Some(v.trim()),
            _ if segment.eq_ignore_ascii_case("early-only") => early_only = true,
            _ => {}
        }
    }
    Some(Replaces {
        call_id: call_id.to_string(),
        to_tag: to_tag?.to_string(),
        from_tag: from_tag?.to_string(),
        early_only,
    })
}

/// Event header (RFC 6665).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub event: String,
    pub id: Option<String>,
}

pub fn parse_event(value: &str) -> Option<Event> {
    let mut segments = value.trim().split(';');
    let event = segments.next()?.trim();
    if event.is_empty() {
        return None;
    }
    let mut id = None;
    for segment in segments {
        if let Some((k, v)) = segment.trim().split_once('=') {
            if k.trim().eq_ignore_ascii_case("id") {
                id = Some(v.trim().to_string());
            }
        }
    }
    Some(Event {
        event: event.to_ascii_lowercase(),
        id,
    })
}

/// Subscription-State header (RFC 6665).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionState {
    pub state: String,
    pub expires: Option<u32>,
    pub reason: Option<String>,
}

pub fn parse_subscription_state(value: &str) -> Option<SubscriptionState> {
    let mut segments = value.trim().split(';');
    let state = segments.next()?.trim();
    if state.is_empty() {
        return None;
    }
    let mut expires = None;
    let mut reason = None;
    for segment in segments {
        if let Some((k, v)) = segment.trim().split_once('=') {
            let v = v.trim();
            if k.trim().eq_ignore_ascii_case("expires") {
                expires = v.parse().ok();
            } else if k.trim().eq_ignore_ascii_case("reason") {
                reason = Some(v.to_string());
            }
        }
    }
    Some(SubscriptionState {
        state: state.to_ascii_lowercase(),
        expires,
        reason,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresher {
    Uac,
    Uas,
}

/// Session-Expires header (RFC 4028).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionExpires {
    pub interval: u32,
    pub refresher: Option<Refresher>,
}

pub fn parse_session_expires(value: &str) -> Option<SessionExpires> {
    let mut segments = value.trim().split(';');
    let interval: u32 = segments.next()?.trim().parse().ok()?;
    let mut refresher = None;
    for segment in segments {
        if let Some((k, v)) = segment.trim().split_once('=') {
            if k.trim().eq_ignore_ascii_case("refresher") {
                refresher = match v.trim().to_ascii_lowercase().as_str() {
                    "uac" => Some(Refresher::Uac),
                    "uas" => Some(Refresher::Uas),
                    _ => None,
                };
            }
        }
    }
    Some(SessionExpires {
        interval,
        refresher,
    })
}

/// Token lists for Allow / Supported / Require.
pub fn parse_token_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

pub fn parse_refer_to(value: &str) -> Option<NameAddr> {
    NameAddr::parse(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::uri::Scheme;

    #[test]
    fn first_line_request() {
        let parsed = parse_first_line("INVITE sip:bob@example.com SIP/2.0").expect("parse");
        match parsed {
            FirstLine::Request { method, uri } => {
                assert_eq!(method, Method::Invite);
                assert_eq!(uri.scheme, Scheme::Sip);
                assert_eq!(uri.user.as_deref(), Some("bob"));
            }
            _ => panic!("expected request"),
        }
    }

    #[test]
    fn first_line_response() {
        let parsed = parse_first_line("SIP/2.0 180 Ringing").expect("parse");
        assert_eq!(
            parsed,
            FirstLine::Response {
                status_code: 180,
                reason_phrase: "Ringing".to_string()
            }
        );
    }

    #[test]
    fn first_line_rejects_lowercase_method_and_bad_status() {
        assert!(parse_first_line("invite sip:bob@example.com SIP/2.0").is_none());
        assert!(parse_first_line("SIP/2.0 99 Too Low").is_none());
        assert!(parse_first_line("SIP/2.0 700 Too High").is_none());
        assert!(parse_first_line("INVITE sip:bob@example.com SIP/1.0").is_none());
    }

    #[test]
    fn via_with_branch() {
        let via =
            parse_via("SIP/2.0/WSS x7kqq1tcnml6.invalid;branch=z9hG4bK563128").expect("parse");
        assert_eq!(via.transport, "WSS");
        assert_eq!(via.host, "x7kqq1tcnml6.invalid");
        assert_eq!(via.branch(), Some("z9hG4bK563128"));
        assert_eq!(
            via.to_string(),
            "SIP/2.0/WSS x7kqq1tcnml6.invalid;branch=z9hG4bK563128"
        );
    }

    #[test]
    fn via_with_port_and_rport() {
        let via = parse_via("SIP/2.0/UDP 203.0.113.5:5060;rport;branch=z9hG4bKabc").expect("parse");
        assert_eq!(via.port, Some(5060));
        assert!(via.params.has("rport"));
    }

    #[test]
    fn cseq_parse() {
        let cseq = parse_cseq("314159 INVITE").expect("parse");
        assert_eq!(cseq.seq, 314159);
        assert_eq!(cseq.method, Method::Invite);
        assert!(parse_cseq("INVITE").is_none());
        assert!(parse_cseq("x INVITE").is_none());
    }

    #[test]
    fn contact_list_splits_on_unquoted_commas() {
        let list = parse_name_addr_list(
            "\"Smith, John\" <sip:john@example.com>;q=0.7, <sips:jane@example.org>",
        )
        .expect("parse");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].display_name.as_deref(), Some("Smith, John"));
        assert_eq!(list[1].uri.scheme, Scheme::Sips);
    }

    #[test]
    fn challenge_parse() {
        let ch = parse_challenge(
            "Digest realm=\"sip.example.com\", nonce=\"abc123\", qop=\"auth,auth-int\", algorithm=MD5, stale=TRUE",
        )
        .expect("parse");
        assert_eq!(ch.realm, "sip.example.com");
        assert_eq!(ch.nonce, "abc123");
        assert_eq!(ch.qop, vec!["auth", "auth-int"]);
        assert_eq!(ch.algorithm.as_deref(), Some("MD5"));
        assert!(ch.stale);
        assert!(parse_challenge("Digest realm=\"r\"").is_none());
    }

    #[test]
    fn replaces_parse() {
        let r = parse_replaces("98732@sip.example.com;to-tag=r33th4x0r;from-tag=ff87ff;early-only")
            .expect("parse");
        assert_eq!(r.call_id, "98732@sip.example.com");
        assert_eq!(r.to_tag, "r33th4x0r");
        assert_eq!(r.from_tag, "ff87ff");
        assert!(r.early_only);
        assert!(parse_replaces("98732@sip.example.com;to-tag=x").is_none());
    }

    #[test]
    fn subscription_state_parse() {
        let s = parse_subscription_state("active;expires=600").expect("parse");
        assert_eq!(s.state, "active");
        assert_eq!(s.expires, Some(600));
        let s = parse_subscription_state("terminated;reason=timeout").expect("parse");
        assert_eq!(s.reason.as_deref(), Some("timeout"));
    }

    #[test]
    fn session_expires_parse() {
        let s = parse_session_expires("1800;refresher=uas").expect("parse");
        assert_eq!(s.interval, 1800);
        assert_eq!(s.refresher, Some(Refresher::Uas));
    }

    #[test]
    fn token_list_parse() {
        assert_eq!(
            parse_token_list("INVITE, ACK,BYE , CANCEL"),
            vec!["INVITE", "ACK", "BYE", "CANCEL"]
        );
    }
}
