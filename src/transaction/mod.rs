use crate::message::{reason_phrase, Headers, Request, Response, SipMessage};
use crate::transport::SipConnection;
use key::TransactionKey;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub mod key;
pub mod timer;
pub mod transaction;
#[cfg(test)]
mod tests;

pub const TAG_LEN: usize = 8;
pub const BRANCH_LEN: usize = 12;
pub const CNONCE_LEN: usize = 8;
pub const CALL_ID_LEN: usize = 22;

pub(crate) const T1: Duration = Duration::from_millis(500);
pub(crate) const T2: Duration = Duration::from_secs(4);
pub(crate) const T4: Duration = Duration::from_secs(5);
/// 64*T1: Timers B, F and H.
pub(crate) const T1X64: Duration = Duration::from_millis(64 * 500);
/// Timer D on unreliable transports.
pub(crate) const TIMER_D_UNRELIABLE: Duration = Duration::from_secs(32);
pub(crate) const TIMER_INTERVAL: Duration = Duration::from_millis(20);

/// SIP transaction state, shared by the four RFC 3261 §17 machines.
///
/// `Idle` is the pre-wire state of a freshly built transaction; `Accepted`
/// is the RFC 6026 extension holding INVITE transactions that saw a 2xx
/// while response retransmissions remain the TU's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Calling,
    Trying,
    Proceeding,
    Completed,
    Accepted,
    Confirmed,
    Terminated,
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransactionState::Idle => "Idle",
            TransactionState::Calling => "Calling",
            TransactionState::Trying => "Trying",
            TransactionState::Proceeding => "Proceeding",
            TransactionState::Completed => "Completed",
            TransactionState::Accepted => "Accepted",
            TransactionState::Confirmed => "Confirmed",
            TransactionState::Terminated => "Terminated",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    InviteClient,
    NonInviteClient,
    InviteServer,
    NonInviteServer,
}

impl TransactionType {
    pub fn is_client(&self) -> bool {
        matches!(
            self,
            TransactionType::InviteClient | TransactionType::NonInviteClient
        )
    }

    pub fn is_invite(&self) -> bool {
        matches!(
            self,
            TransactionType::InviteClient | TransactionType::InviteServer
        )
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransactionType::InviteClient => "InviteClient",
            TransactionType::NonInviteClient => "NonInviteClient",
            TransactionType::InviteServer => "InviteServer",
            TransactionType::NonInviteServer => "NonInviteServer",
        };
        f.write_str(name)
    }
}

/// Timers A-K of RFC 3261 §17 plus L and M of RFC 6026 (Accepted absorb).
///
/// Retransmission timers carry their current interval so the doubling
/// schedule survives the trip through the timer wheel.
pub enum TransactionTimer {
    TimerA(TransactionKey, Duration),
    TimerB(TransactionKey),
    TimerD(TransactionKey),
    TimerE(TransactionKey, Duration),
    TimerF(TransactionKey),
    TimerG(TransactionKey, Duration),
    TimerH(TransactionKey),
    TimerI(TransactionKey),
    TimerJ(TransactionKey),
    TimerK(TransactionKey),
    TimerL(TransactionKey),
    TimerM(TransactionKey),
}

impl TransactionTimer {
    pub fn key(&self) -> &TransactionKey {
        match self {
            TransactionTimer::TimerA(key, _)
            | TransactionTimer::TimerB(key)
            | TransactionTimer::TimerD(key)
            | TransactionTimer::TimerE(key, _)
            | TransactionTimer::TimerF(key)
            | TransactionTimer::TimerG(key, _)
            | TransactionTimer::TimerH(key)
            | TransactionTimer::TimerI(key)
            | TransactionTimer::TimerJ(key)
            | TransactionTimer::TimerK(key)
            | TransactionTimer::TimerL(key)
            | TransactionTimer::TimerM(key) => key,
        }
    }
}

impl std::fmt::Display for TransactionTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionTimer::TimerA(key, d) => write!(f, "TimerA: {} {}ms", key, d.as_millis()),
            TransactionTimer::TimerB(key) => write!(f, "TimerB: {}", key),
            TransactionTimer::TimerD(key) => write!(f, "TimerD: {}", key),
            TransactionTimer::TimerE(key, d) => write!(f, "TimerE: {} {}ms", key, d.as_millis()),
            TransactionTimer::TimerF(key) => write!(f, "TimerF: {}", key),
            TransactionTimer::TimerG(key, d) => write!(f, "TimerG: {} {}ms", key, d.as_millis()),
            TransactionTimer::TimerH(key) => write!(f, "TimerH: {}", key),
            TransactionTimer::TimerI(key) => write!(f, "TimerI: {}", key),
            TransactionTimer::TimerJ(key) => write!(f, "TimerJ: {}", key),
            TransactionTimer::TimerK(key) => write!(f, "TimerK: {}", key),
            TransactionTimer::TimerL(key) => write!(f, "TimerL: {}", key),
            TransactionTimer::TimerM(key) => write!(f, "TimerM: {}", key),
        }
    }
}

/// What a transaction hands to its user.
#[derive(Debug)]
pub enum TransactionOutput {
    Message(SipMessage),
    /// Timer B, F or H expired.
    Timeout,
    /// The shared socket failed while this transaction was in flight.
    TransportError(String),
}

pub(crate) enum TransactionEvent {
    Received(SipMessage, Option<SipConnection>),
    Timer(TransactionTimer),
    TransportError(String),
    Terminate,
}

pub(crate) type TransactionEventReceiver = UnboundedReceiver<TransactionEvent>;
pub(crate) type TransactionEventSender = UnboundedSender<TransactionEvent>;

/// Lifecycle notifications towards the user-agent event bag.
#[derive(Debug, Clone)]
pub enum TransactionLifecycle {
    Created(TransactionKey),
    Destroyed(TransactionKey),
}

pub fn random_text(count: usize) -> String {
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(rand::distributions::Alphanumeric)
        .take(count)
        .map(char::from)
        .collect()
}

pub fn make_branch() -> String {
    format!("z9hG4bK{}", random_text(BRANCH_LEN))
}

pub fn make_tag() -> String {
    random_text(TAG_LEN)
}

pub fn make_call_id(domain: &str) -> String {
    format!("{}@{}", random_text(CALL_ID_LEN), domain)
}

/// Builds a response to `request` per RFC 3261 §8.2.6: Via, From, Call-ID
/// and CSeq copied; To gains `to_tag` unless the request already tagged it
/// or the response is a 100.
pub fn make_response(request: &Request, status_code: u16, to_tag: Option<&str>) -> Response {
    let mut headers = Headers::new();
    for via in request.headers.get_all("Via") {
        headers.push("Via", via);
    }
    if let Some(from) = request.headers.get("From") {
        headers.push("From", from);
    }
    if let Some(to) = request.headers.get("To") {
        match to_tag {
            Some(tag) if status_code > 100 && request.headers.to_tag().is_none() => {
                if let Some(mut parsed) = request.headers.to() {
                    parsed.set_tag(tag);
                    headers.push("To", &parsed.to_string());
                } else {
                    headers.push("To", to);
                }
            }
            _ => headers.push("To", to),
        }
    }
    if let Some(call_id) = request.headers.get("Call-ID") {
        headers.push("Call-ID", call_id);
    }
    if let Some(cseq) = request.headers.get("CSeq") {
        headers.push("CSeq", cseq);
    }
    for rr in request.headers.get_all("Record-Route") {
        headers.push("Record-Route", rr);
    }
    Response {
        status_code,
        reason_phrase: reason_phrase(status_code).to_string(),
        headers,
        body: String::new(),
    }
}

#[cfg(test)]
mod unit_tests {
    use super::*;
    use crate::message::{Method, uri::Uri};

    fn sample_request() -> Request {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/WS host.invalid;branch=z9hG4bKtest");
        headers.push("From", "<sip:alice@example.com>;tag=abc");
        headers.push("To", "<sip:bob@example.com>");
        headers.push("Call-ID", "xyz");
        headers.push("CSeq", "1 INVITE");
        Request {
            method: Method::Invite,
            uri: Uri::parse("sip:bob@example.com").unwrap(),
            headers,
            body: String::new(),
        }
    }

    #[test]
    fn random_generators_have_expected_shape() {
        assert_eq!(random_text(10).len(), 10);
        assert!(make_branch().starts_with("z9hG4bK"));
        assert_eq!(make_branch().len(), 7 + BRANCH_LEN);
        assert!(make_call_id("example.com").ends_with("@example.com"));
    }

    #[test]
    fn response_gains_to_tag_except_on_100() {
        let req = sample_request();
        let trying = make_response(&req, 100, Some("srvtag"));
        assert_eq!(trying.headers.to_tag(), None);

        let ringing = make_response(&req, 180, Some("srvtag"));
        assert_eq!(ringing.headers.to_tag().as_deref(), Some("srvtag"));
        assert_eq!(ringing.reason_phrase, "Ringing");
        assert_eq!(ringing.headers.cseq().unwrap().method, Method::Invite);
    }
}
