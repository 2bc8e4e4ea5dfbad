use std::sync::OnceLock;

pub mod grammar;
pub mod parser;
pub mod uri;

use grammar::{CSeq, Challenge, ContentType, Credentials, Event, Replaces, SessionExpires, SubscriptionState, Via};
use uri::{NameAddr, Uri};

/// SIP request method.
///
/// The closed set of RFC 3261/3265/3515 methods this stack dispatches on,
/// with an `Extension` carry-all so unknown tokens survive round-trips.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Cancel,
    Bye,
    Register,
    Options,
    Message,
    Subscribe,
    Notify,
    Refer,
    Info,
    Update,
    Extension(String),
}

impl Method {
    pub fn from_token(token: &str) -> Method {
        match token {
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "CANCEL" => Method::Cancel,
            "BYE" => Method::Bye,
            "REGISTER" => Method::Register,
            "OPTIONS" => Method::Options,
            "MESSAGE" => Method::Message,
            "SUBSCRIBE" => Method::Subscribe,
            "NOTIFY" => Method::Notify,
            "REFER" => Method::Refer,
            "INFO" => Method::Info,
            "UPDATE" => Method::Update,
            other => Method::Extension(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Cancel => "CANCEL",
            Method::Bye => "BYE",
            Method::Register => "REGISTER",
            Method::Options => "OPTIONS",
            Method::Message => "MESSAGE",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Refer => "REFER",
            Method::Info => "INFO",
            Method::Update => "UPDATE",
            Method::Extension(token) => token,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed value cached on a stored header instance.
#[derive(Debug, Clone)]
pub enum Parsed {
    Via(Via),
    NameAddr(NameAddr),
    NameAddrList(Vec<NameAddr>),
    CSeq(CSeq),
    ContentType(ContentType),
    Challenge(Challenge),
    Credentials(Credentials),
    Replaces(Replaces),
    Event(Event),
    SubscriptionState(SubscriptionState),
    SessionExpires(SessionExpires),
    Tokens(Vec<String>),
    Uint(u32),
    /// Raw value retained for headers without a grammar.
    Verbatim,
    /// Grammar rejected the value; memoised so the work is not repeated.
    Failed,
}

/// A single stored header: canonical name in its original case, raw value,
/// and a lazily computed typed value so grammar work is paid once.
#[derive(Debug, Clone)]
pub struct HeaderField {
    name: String,
    value: String,
    parsed: OnceLock<Parsed>,
}

impl HeaderField {
    pub fn new(name: &str, value: &str) -> Self {
        HeaderField {
            name: canonical_name(name),
            value: value.trim().to_string(),
            parsed: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn parsed(&self) -> &Parsed {
        self.parsed
            .get_or_init(|| parse_header_value(&self.name, &self.value))
    }

    /// Whether a grammar exists for this header and rejected the value.
    pub fn is_malformed(&self) -> bool {
        matches!(self.parsed(), Parsed::Failed)
    }
}

fn parse_header_value(name: &str, value: &str) -> Parsed {
    let lower = name.to_ascii_lowercase();
    let parsed = match lower.as_str() {
        "via" => grammar::parse_via(value).map(Parsed::Via),
        "from" | "to" | "refer-to" | "referred-by" => {
            grammar::parse_name_addr(value).map(Parsed::NameAddr)
        }
        "contact" => {
            if value.trim() == "*" {
                Some(Parsed::Verbatim)
            } else {
                grammar::parse_name_addr_list(value).map(Parsed::NameAddrList)
            }
        }
        "route" | "record-route" => grammar::parse_name_addr_list(value).map(Parsed::NameAddrList),
        "cseq" => grammar::parse_cseq(value).map(Parsed::CSeq),
        "call-id" => {
            if value.is_empty() {
                None
            } else {
                Some(Parsed::Verbatim)
            }
        }
        "content-length" | "expires" | "min-expires" | "max-forwards" => {
            grammar::parse_u32(value).map(Parsed::Uint)
        }
        "content-type" => grammar::parse_content_type(value).map(Parsed::ContentType),
        "www-authenticate" | "proxy-authenticate" => {
            grammar::parse_challenge(value).map(Parsed::Challenge)
        }
        "authorization" | "proxy-authorization" => {
            grammar::parse_credentials(value).map(Parsed::Credentials)
        }
        "session-expires" => grammar::parse_session_expires(value).map(Parsed::SessionExpires),
        "replaces" => grammar::parse_replaces(value).map(Parsed::Replaces),
        "event" => grammar::parse_event(value).map(Parsed::Event),
        "subscription-state" => {
            grammar::parse_subscription_state(value).map(Parsed::SubscriptionState)
        }
        "allow" | "supported" | "require" | "allow-events" => {
            Some(Parsed::Tokens(grammar::parse_token_list(value)))
        }
        _ => Some(Parsed::Verbatim),
    };
    parsed.unwrap_or(Parsed::Failed)
}

/// Expands RFC 3261 compact forms; other names keep their original case.
pub fn canonical_name(name: &str) -> String {
    let expanded = match name.to_ascii_lowercase().as_str() {
        "i" => "Call-ID",
        "f" => "From",
        "t" => "To",
        "m" => "Contact",
        "l" => "Content-Length",
        "c" => "Content-Type",
        "v" => "Via",
        "k" => "Supported",
        "o" => "Event",
        "s" => "Subject",
        "e" => "Content-Encoding",
        "r" => "Refer-To",
        "b" => "Referred-By",
        "u" => "Allow-Events",
        _ => return name.to_string(),
    };
    expanded.to_string()
}

/// Ordered header collection with case-insensitive access.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    fields: Vec<HeaderField>,
}

impl Headers {
    pub fn new() -> Self {
        Headers { fields: Vec::new() }
    }

    pub fn push(&mut self, name: &str, value: &str) {
        self.fields.push(HeaderField::new(name, value));
    }

    /// Prepends a header; used for the topmost Via of originated requests.
    pub fn push_front(&mut self, name: &str, value: &str) {
        self.fields.insert(0, HeaderField::new(name, value));
    }

    /// Replaces every instance of `name` with a single value.
    pub fn set(&mut self, name: &str, value: &str) {
        self.remove(name);
        self.push(name, value);
    }

    pub fn remove(&mut self, name: &str) {
        self.fields
            .retain(|f| !f.name.eq_ignore_ascii_case(&canonical_name(name)));
    }

    pub fn has(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.field(name).map(|f| f.value())
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.fields_named(name).map(|f| f.value()).collect()
    }

    pub fn field(&self, name: &str) -> Option<&HeaderField> {
        self.fields_named(name).next()
    }

    pub fn fields_named<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a HeaderField> {
        let name = canonical_name(name);
        self.fields
            .iter()
            .filter(move |f| f.name.eq_ignore_ascii_case(&name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &HeaderField> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    // typed accessors used throughout the stack; each clones out of the
    // per-header cache

    pub fn via(&self) -> Option<Via> {
        match self.field("Via")?.parsed() {
            Parsed::Via(via) => Some(via.clone()),
            _ => None,
        }
    }

    pub fn branch(&self) -> Option<String> {
        self.via()?.branch().map(|b| b.to_string())
    }

    pub fn cseq(&self) -> Option<CSeq> {
        match self.field("CSeq")?.parsed() {
            Parsed::CSeq(cseq) => Some(cseq.clone()),
            _ => None,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        self.get("Call-ID")
    }

    pub fn from(&self) -> Option<NameAddr> {
        match self.field("From")?.parsed() {
            Parsed::NameAddr(na) => Some(na.clone()),
            _ => None,
        }
    }

    pub fn to(&self) -> Option<NameAddr> {
        match self.field("To")?.parsed() {
            Parsed::NameAddr(na) => Some(na.clone()),
            _ => None,
        }
    }

    pub fn from_tag(&self) -> Option<String> {
        self.from()?.tag().map(|t| t.to_string())
    }

    pub fn to_tag(&self) -> Option<String> {
        self.to()?.tag().map(|t| t.to_string())
    }

    pub fn contact(&self) -> Option<NameAddr> {
        match self.field("Contact")?.parsed() {
            Parsed::NameAddrList(list) => list.first().cloned(),
            _ => None,
        }
    }

    pub fn contacts(&self) -> Vec<NameAddr> {
        let mut out = Vec::new();
        for field in self.fields_named("Contact") {
            if let Parsed::NameAddrList(list) = field.parsed() {
                out.extend(list.iter().cloned());
            }
        }
        out
    }

    pub fn record_routes(&self) -> Vec<NameAddr> {
        self.addr_list("Record-Route")
    }

    pub fn routes(&self) -> Vec<NameAddr> {
        self.addr_list("Route")
    }

    fn addr_list(&self, name: &str) -> Vec<NameAddr> {
        let mut out = Vec::new();
        for field in self.fields_named(name) {
            if let Parsed::NameAddrList(list) = field.parsed() {
                out.extend(list.iter().cloned());
            }
        }
        out
    }

    pub fn expires(&self) -> Option<u32> {
        match self.field("Expires")?.parsed() {
            Parsed::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn min_expires(&self) -> Option<u32> {
        match self.field("Min-Expires")?.parsed() {
            Parsed::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn content_length(&self) -> Option<u32> {
        match self.field("Content-Length")?.parsed() {
            Parsed::Uint(v) => Some(*v),
            _ => None,
        }
    }

    pub fn challenge(&self) -> Option<Challenge> {
        let field = self
            .field("WWW-Authenticate")
            .or_else(|| self.field("Proxy-Authenticate"))?;
        match field.parsed() {
            Parsed::Challenge(challenge) => Some(challenge.clone()),
            _ => None,
        }
    }

    pub fn replaces(&self) -> Option<Replaces> {
        match self.field("Replaces")?.parsed() {
            Parsed::Replaces(replaces) => Some(replaces.clone()),
            _ => None,
        }
    }

    pub fn event(&self) -> Option<Event> {
        match self.field("Event")?.parsed() {
            Parsed::Event(event) => Some(event.clone()),
            _ => None,
        }
    }

    fn fmt_wire(&self, f: &mut std::fmt::Formatter<'_>, body_len: usize) -> std::fmt::Result {
        for field in &self.fields {
            if field.name.eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            write!(f, "{}: {}\r\n", field.name, field.value)?;
        }
        write!(f, "Content-Length: {}\r\n\r\n", body_len)
    }
}

/// In-memory SIP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub headers: Headers,
    pub body: String,
}

/// In-memory SIP response.
#[derive(Debug, Clone)]
pub struct Response {
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Headers,
    pub body: String,
}

impl Response {
    /// Method of the transaction this response belongs to, from CSeq.
    pub fn cseq_method(&self) -> Option<Method> {
        self.headers.cseq().map(|c| c.method)
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status_code)
    }

    pub fn is_final(&self) -> bool {
        self.status_code >= 200
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    pub fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(req) => &req.headers,
            SipMessage::Response(resp) => &resp.headers,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, SipMessage::Request(_))
    }
}

impl From<Request> for SipMessage {
    fn from(req: Request) -> Self {
        SipMessage::Request(req)
    }
}

impl From<Response> for SipMessage {
    fn from(resp: Response) -> Self {
        SipMessage::Response(resp)
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} SIP/2.0\r\n", self.method, self.uri)?;
        self.headers.fmt_wire(f, self.body.len())?;
        f.write_str(&self.body)
    }
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SIP/2.0 {} {}\r\n", self.status_code, self.reason_phrase)?;
        self.headers.fmt_wire(f, self.body.len())?;
        f.write_str(&self.body)
    }
}

impl std::fmt::Display for SipMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SipMessage::Request(req) => req.fmt(f),
            SipMessage::Response(resp) => resp.fmt(f),
        }
    }
}

/// Default reason phrase for a status code (RFC 3261 §21).
pub fn reason_phrase(status_code: u16) -> &'static str {
    match status_code {
        100 => "Trying",
        180 => "Ringing",
        181 => "Call Is Being Forwarded",
        182 => "Queued",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Moved Temporarily",
        305 => "Use Proxy",
        380 => "Alternative Service",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        410 => "Gone",
        413 => "Request Entity Too Large",
        415 => "Unsupported Media Type",
        416 => "Unsupported URI Scheme",
        420 => "Bad Extension",
        421 => "Extension Required",
        423 => "Interval Too Brief",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        482 => "Loop Detected",
        483 => "Too Many Hops",
        484 => "Address Incomplete",
        485 => "Ambiguous",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        489 => "Bad Event",
        491 => "Request Pending",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Server Time-out",
        505 => "Version Not Supported",
        600 => "Busy Everywhere",
        603 => "Decline",
        604 => "Does Not Exist Anywhere",
        606 => "Not Acceptable",
        _ => "",
    }
}
