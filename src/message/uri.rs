use crate::{Error, Result};

/// Ordered parameter list shared by URIs and name-addr headers.
///
/// Keys are lowercased on insertion and looked up case-insensitively;
/// insertion order is preserved so serialisation is stable. Values are
/// stored verbatim, `None` for valueless parameters (`;lr`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    entries: Vec<(String, Option<String>)>,
}

impl Params {
    pub fn new() -> Self {
        Params {
            entries: Vec::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: Option<&str>) {
        let key = key.to_ascii_lowercase();
        for entry in self.entries.iter_mut() {
            if entry.0 == key {
                entry.1 = value.map(|v| v.to_string());
                return;
            }
        }
        self.entries.push((key, value.map(|v| v.to_string())));
    }

    pub fn get(&self, key: &str) -> Option<Option<&str>> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_deref())
    }

    /// Returns the parameter value, flattening valueless parameters to `None`.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.get(key).flatten()
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: &str) -> Option<Option<String>> {
        let key = key.to_ascii_lowercase();
        let pos = self.entries.iter().position(|(k, _)| *k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn parse_segment(&mut self, segment: &str) {
        let segment = segment.trim();
        if segment.is_empty() {
            return;
        }
        match segment.split_once('=') {
            Some((k, v)) => self.set(k.trim(), Some(v.trim())),
            None => self.set(segment, None),
        }
    }
}

impl std::fmt::Display for Params {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (key, value) in self.iter() {
            match value {
                Some(value) => write!(f, ";{}={}", key, value)?,
                None => write!(f, ";{}", key)?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Sip,
    Sips,
    Tel,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
            Scheme::Tel => "tel",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        if token.eq_ignore_ascii_case("sip") {
            Some(Scheme::Sip)
        } else if token.eq_ignore_ascii_case("sips") {
            Some(Scheme::Sips)
        } else if token.eq_ignore_ascii_case("tel") {
            Some(Scheme::Tel)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed SIP/SIPS/TEL URI (RFC 3261 §19.1).
///
/// The hostname production is deliberately relaxed: labels may begin with a
/// digit, so operator-assigned IP-like domains (`sip:alice@1ss7.carrier.net`)
/// parse without a fallback path. `tel:` numbers are carried in `host`.
#[derive(Debug, Clone)]
pub struct Uri {
    pub scheme: Scheme,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
    pub headers: Vec<(String, Vec<String>)>,
}

impl Uri {
    pub fn new(scheme: Scheme, user: Option<&str>, host: &str, port: Option<u16>) -> Self {
        Uri {
            scheme,
            user: user.map(|u| u.to_string()),
            password: None,
            host: host.to_ascii_lowercase(),
            port,
            params: Params::new(),
            headers: Vec::new(),
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let (scheme_token, rest) = input
            .split_once(':')
            .ok_or_else(|| Error::ParseError(format!("URI without scheme: {}", input)))?;
        let scheme = Scheme::from_token(scheme_token)
            .ok_or_else(|| Error::ParseError(format!("unsupported URI scheme: {}", scheme_token)))?;

        let (addr_part, headers_part) = match rest.split_once('?') {
            Some((addr, headers)) => (addr, Some(headers)),
            None => (rest, None),
        };

        let mut segments = addr_part.split(';');
        let base = segments
            .next()
            .ok_or_else(|| Error::ParseError(format!("empty URI: {}", input)))?
            .trim();
        let mut params = Params::new();
        for segment in segments {
            params.parse_segment(segment);
        }

        // userinfo ends at the last '@'; a password may follow the user
        let (userinfo, host_port) = match base.rfind('@') {
            Some(pos) => (Some(&base[..pos]), &base[pos + 1..]),
            None => (None, base),
        };
        let (user, password) = match userinfo {
            Some(userinfo) => match userinfo.split_once(':') {
                Some((user, password)) => (Some(user.to_string()), Some(password.to_string())),
                None => (Some(userinfo.to_string()), None),
            },
            None => (None, None),
        };
        if let Some(user) = &user {
            if user.is_empty() {
                return Err(Error::ParseError(format!("empty user in URI: {}", input)));
            }
        }

        let (host, port) = split_host_port(host_port.trim())
            .ok_or_else(|| Error::ParseError(format!("bad host in URI: {}", input)))?;
        if host.is_empty() || !is_valid_host(host) {
            return Err(Error::ParseError(format!("bad host in URI: {}", input)));
        }

        let mut headers = Vec::new();
        if let Some(headers_part) = headers_part {
            for pair in headers_part.split('&') {
                if pair.is_empty() {
                    continue;
                }
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                push_uri_header(&mut headers, key, value);
            }
        }

        Ok(Uri {
            scheme,
            user,
            password,
            host: host.to_ascii_lowercase(),
            port,
            params,
            headers,
        })
    }

    pub fn is_sips(&self) -> bool {
        self.scheme == Scheme::Sips
    }

    /// Address-of-record form: scheme, user and host only.
    pub fn aor(&self) -> String {
        match &self.user {
            Some(user) => format!("{}:{}@{}", self.scheme, user, self.host),
            None => format!("{}:{}", self.scheme, self.host),
        }
    }
}

// Parameters whose absence on one side is a mismatch (RFC 3261 §19.1.4).
const SPECIAL_PARAMS: [&str; 4] = ["user", "ttl", "method", "maddr"];

impl PartialEq for Uri {
    fn eq(&self, other: &Uri) -> bool {
        if self.scheme != other.scheme
            || self.user != other.user
            || self.password != other.password
            || self.host != other.host
            || self.port != other.port
        {
            return false;
        }
        for key in SPECIAL_PARAMS {
            match (self.params.get(key), other.params.get(key)) {
                (None, None) => {}
                (Some(a), Some(b)) => {
                    let eq = match (a, b) {
                        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                        (None, None) => true,
                        _ => false,
                    };
                    if !eq {
                        return false;
                    }
                }
                _ => return false,
            }
        }
        // remaining params only compared when both sides carry them
        for (key, value) in self.params.iter() {
            if SPECIAL_PARAMS.contains(&key) {
                continue;
            }
            if let Some(other_value) = other.params.get(key) {
                let eq = match (value, other_value) {
                    (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                    (None, None) => true,
                    _ => false,
                };
                if !eq {
                    return false;
                }
            }
        }
        true
    }
}

impl Eq for Uri {}

impl std::fmt::Display for Uri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}", user)?;
            if let Some(password) = &self.password {
                write!(f, ":{}", password)?;
            }
            write!(f, "@")?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.params)?;
        let mut first = true;
        for (key, values) in &self.headers {
            for value in values {
                write!(f, "{}{}={}", if first { '?' } else { '&' }, key, value)?;
                first = false;
            }
        }
        Ok(())
    }
}

fn push_uri_header(headers: &mut Vec<(String, Vec<String>)>, key: &str, value: &str) {
    for entry in headers.iter_mut() {
        if entry.0.eq_ignore_ascii_case(key) {
            entry.1.push(value.to_string());
            return;
        }
    }
    headers.push((key.to_string(), vec![value.to_string()]));
}

/// Splits `host[:port]` or a bracketed IPv6 reference `[host]:port`.
fn split_host_port(input: &str) -> Option<(&str, Option<u16>)> {
    if let Some(rest) = input.strip_prefix('[') {
        let end = rest.find(']')?;
        let host = &rest[..end];
        let remainder = &rest[end + 1..];
        if let Some(port) = remainder.strip_prefix(':') {
            Some((host, Some(port.parse().ok()?)))
        } else if remainder.is_empty() {
            Some((host, None))
        } else {
            None
        }
    } else if let Some((host, port)) = input.rsplit_once(':') {
        if host.contains(':') {
            // unbracketed IPv6 literal
            return None;
        }
        Some((host, Some(port.parse().ok()?)))
    } else {
        Some((input, None))
    }
}

/// Relaxed hostname check: IPv6 references plus labels of alphanumerics,
/// `-`, `_` and `.`, where a label may start with a digit. Covers IPv4
/// literals and telephone-subscriber strings as a byproduct.
fn is_valid_host(host: &str) -> bool {
    if host.contains(':') {
        // bracketed IPv6 already unwrapped by split_host_port
        return host.chars().all(|c| c.is_ascii_hexdigit() || c == ':');
    }
    host.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+' | '*'))
}

/// Name-address header value: optional display name, a bracketed URI and
/// header parameters (`"Alice" <sip:alice@example.com>;tag=88sja8x`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: Uri,
    pub params: Params,
}

impl NameAddr {
    pub fn new(display_name: Option<&str>, uri: Uri) -> Self {
        NameAddr {
            display_name: display_name.map(|d| d.to_string()),
            uri,
            params: Params::new(),
        }
    }

    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        match input.find('<') {
            Some(open) => {
                let display = input[..open].trim();
                let display_name = if display.is_empty() {
                    None
                } else {
                    Some(unquote_display_name(display)?)
                };
                let close = input[open..]
                    .find('>')
                    .map(|i| open + i)
                    .ok_or_else(|| Error::ParseError(format!("unterminated name-addr: {}", input)))?;
                let uri = Uri::parse(&input[open + 1..close])?;
                let mut params = Params::new();
                for segment in input[close + 1..].split(';') {
                    params.parse_segment(segment);
                }
                Ok(NameAddr {
                    display_name,
                    uri,
                    params,
                })
            }
            None => {
                // bare addr-spec: everything after the first ';' belongs to
                // the header, not the URI (RFC 3261 §20.10)
                let (addr, rest) = match input.split_once(';') {
                    Some((addr, rest)) => (addr, Some(rest)),
                    None => (input, None),
                };
                let uri = Uri::parse(addr)?;
                let mut params = Params::new();
                if let Some(rest) = rest {
                    for segment in rest.split(';') {
                        params.parse_segment(segment);
                    }
                }
                Ok(NameAddr {
                    display_name: None,
                    uri,
                    params,
                })
            }
        }
    }

    pub fn tag(&self) -> Option<&str> {
        self.params.value("tag")
    }

    pub fn set_tag(&mut self, tag: &str) {
        self.params.set("tag", Some(tag));
    }
}

impl std::fmt::Display for NameAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(display_name) = &self.display_name {
            write!(f, "\"{}\" ", quote_display_name(display_name))?;
        }
        write!(f, "<{}>{}", self.uri, self.params)
    }
}

fn quote_display_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn unquote_display_name(display: &str) -> Result<String> {
    if let Some(inner) = display.strip_prefix('"') {
        let inner = inner
            .strip_suffix('"')
            .ok_or_else(|| Error::ParseError(format!("unterminated quoted string: {}", display)))?;
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some(escaped) => out.push(escaped),
                    None => {
                        return Err(Error::ParseError(format!(
                            "dangling escape in display name: {}",
                            display
                        )))
                    }
                }
            } else if c == '"' {
                return Err(Error::ParseError(format!(
                    "unescaped quote in display name: {}",
                    display
                )));
            } else {
                out.push(c);
            }
        }
        Ok(out)
    } else {
        // token sequence; internal whitespace collapses to single spaces
        Ok(display.split_whitespace().collect::<Vec<_>>().join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_uri() {
        let uri = Uri::parse("sips:alice:secret@example.com:5061;transport=ws;lr?subject=call")
            .expect("parse");
        assert_eq!(uri.scheme, Scheme::Sips);
        assert_eq!(uri.user.as_deref(), Some("alice"));
        assert_eq!(uri.password.as_deref(), Some("secret"));
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port, Some(5061));
        assert_eq!(uri.params.value("transport"), Some("ws"));
        assert!(uri.params.has("lr"));
        assert_eq!(uri.headers[0].0, "subject");
    }

    #[test]
    fn host_may_start_with_digit() {
        let uri = Uri::parse("sip:alice@203.0.113.10").expect("parse");
        assert_eq!(uri.host, "203.0.113.10");
        let uri = Uri::parse("sip:bob@1ss7.operator.net:5060").expect("parse");
        assert_eq!(uri.host, "1ss7.operator.net");
        assert_eq!(uri.port, Some(5060));
    }

    #[test]
    fn ipv6_reference_host() {
        let uri = Uri::parse("sip:carol@[2001:db8::1]:5060").expect("parse");
        assert_eq!(uri.host, "2001:db8::1");
        assert_eq!(uri.port, Some(5060));
        let rendered = uri.to_string();
        assert_eq!(rendered, "sip:carol@[2001:db8::1]:5060");
        assert_eq!(Uri::parse(&rendered).expect("reparse").host, "2001:db8::1");
    }

    #[test]
    fn rejects_garbage() {
        assert!(Uri::parse("alice@example.com").is_err());
        assert!(Uri::parse("http://example.com").is_err());
        assert!(Uri::parse("sip:@example.com").is_err());
        assert!(Uri::parse("sip:alice@").is_err());
    }

    #[test]
    fn display_is_idempotent() {
        for input in [
            "sip:alice@example.com",
            "sips:alice@example.com:5061;transport=wss",
            "sip:203.0.113.10;lr",
            "tel:+15551234567",
        ] {
            let uri = Uri::parse(input).expect("parse");
            let rendered = uri.to_string();
            let reparsed = Uri::parse(&rendered).expect("reparse");
            assert_eq!(rendered, reparsed.to_string());
        }
    }

    #[test]
    fn equality_per_rfc() {
        let a = Uri::parse("sip:alice@EXAMPLE.com").unwrap();
        let b = Uri::parse("sip:alice@example.COM").unwrap();
        assert_eq!(a, b);

        // user is case-sensitive
        let c = Uri::parse("sip:Alice@example.com").unwrap();
        assert_ne!(a, c);

        // special param present only on one side is a mismatch
        let d = Uri::parse("sip:alice@example.com;ttl=15").unwrap();
        assert_ne!(a, d);

        // unknown params only compared when both carry them
        let e = Uri::parse("sip:alice@example.com;newparam=5").unwrap();
        assert_eq!(a, e);
        let f = Uri::parse("sip:alice@example.com;newparam=6").unwrap();
        assert_ne!(e, f);
    }

    #[test]
    fn name_addr_quoting_round_trip() {
        let na = NameAddr::parse("\"Bob \\\"Ace\\\" \\\\\" <sip:bob@example.com>;tag=abc")
            .expect("parse");
        assert_eq!(na.display_name.as_deref(), Some("Bob \"Ace\" \\"));
        assert_eq!(na.tag(), Some("abc"));

        let rendered = na.to_string();
        let reparsed = NameAddr::parse(&rendered).expect("reparse");
        assert_eq!(reparsed.display_name, na.display_name);
        assert_eq!(reparsed.tag(), na.tag());
    }

    #[test]
    fn name_addr_token_display_name() {
        let na = NameAddr::parse("Bob   Example <sip:bob@example.com>").expect("parse");
        assert_eq!(na.display_name.as_deref(), Some("Bob Example"));
    }

    #[test]
    fn bare_addr_spec_params_belong_to_header() {
        let na = NameAddr::parse("sip:alice@example.com;tag=77aa").expect("parse");
        assert_eq!(na.tag(), Some("77aa"));
        assert!(!na.uri.params.has("tag"));
    }

    #[test]
    fn params_preserve_insertion_order() {
        let mut params = Params::new();
        params.set("B", Some("2"));
        params.set("a", None);
        params.set("b", Some("3"));
        assert_eq!(params.to_string(), ";b=3;a");
    }
}
