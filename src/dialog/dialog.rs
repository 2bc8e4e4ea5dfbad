use super::DialogId;
use crate::message::{
    uri::{NameAddr, Uri},
    Headers, Method, Request, Response,
};
use crate::{Error, Result};
use tracing::debug;

/// CSeq numbers wrap here (RFC 3261 §8.1.1.5 allows 2**31-1 at most).
const CSEQ_LIMIT: u32 = 1 << 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
    Terminated,
}

impl std::fmt::Display for DialogState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DialogState::Early => "Early",
            DialogState::Confirmed => "Confirmed",
            DialogState::Terminated => "Terminated",
        };
        f.write_str(name)
    }
}

/// One side of a SIP dialog (RFC 3261 §12): identity, route set, remote
/// target and CSeq accounting for both directions.
#[derive(Debug, Clone)]
pub struct Dialog {
    pub id: DialogId,
    pub state: DialogState,
    pub local: NameAddr,
    pub remote: NameAddr,
    pub remote_target: Uri,
    pub route_set: Vec<Uri>,
    pub secure: bool,
    pub local_seq: u32,
    pub remote_seq: Option<u32>,
}

impl Dialog {
    /// UAC construction from the first dialog-creating response carrying a
    /// To tag (RFC 3261 §12.1.2): route set is the reversed Record-Route,
    /// remote target the response Contact.
    pub fn new_uac(request: &Request, response: &Response) -> Result<Self> {
        let id = DialogId::try_from(response)?;
        if id.remote_tag.is_empty() {
            return Err(Error::DialogError(
                "response without To tag".to_string(),
                id,
            ));
        }
        let local = request
            .headers
            .from()
            .ok_or_else(|| Error::DialogError("request without From".to_string(), id.clone()))?;
        let remote = response
            .headers
            .to()
            .ok_or_else(|| Error::DialogError("response without To".to_string(), id.clone()))?;
        let remote_target = response
            .headers
            .contact()
            .map(|c| c.uri)
            .ok_or_else(|| Error::DialogError("response without Contact".to_string(), id.clone()))?;
        let mut route_set: Vec<Uri> = response
            .headers
            .record_routes()
            .into_iter()
            .map(|r| r.uri)
            .collect();
        route_set.reverse();
        let local_seq = request
            .headers
            .cseq()
            .ok_or_else(|| Error::DialogError("request without CSeq".to_string(), id.clone()))?
            .seq;
        let state = if response.is_success() {
            DialogState::Confirmed
        } else {
            DialogState::Early
        };
        debug!(id = %id, state = %state, "uac dialog created");
        Ok(Dialog {
            id,
            state,
            local,
            remote,
            remote_target,
            route_set,
            secure: request.uri.is_sips(),
            local_seq,
            remote_seq: None,
        })
    }

    /// UAS construction from a dialog-creating request (RFC 3261 §12.1.1):
    /// route set is the Record-Route as received, remote sequence primed
    /// from the request.
    pub fn new_uas(request: &Request, local_tag: &str) -> Result<Self> {
        let call_id = request
            .headers
            .call_id()
            .ok_or_else(|| Error::ParseError("request without Call-ID".to_string()))?;
        let remote_tag = request
            .headers
            .from_tag()
            .ok_or_else(|| Error::ParseError("request without From tag".to_string()))?;
        let id = DialogId::new(call_id, local_tag, &remote_tag);

        let mut local = request
            .headers
            .to()
            .ok_or_else(|| Error::DialogError("request without To".to_string(), id.clone()))?;
        local.set_tag(local_tag);
        let remote = request
            .headers
            .from()
            .ok_or_else(|| Error::DialogError("request without From".to_string(), id.clone()))?;
        let remote_target = request
            .headers
            .contact()
            .map(|c| c.uri)
            .ok_or_else(|| Error::DialogError("request without Contact".to_string(), id.clone()))?;
        let route_set = request
            .headers
            .record_routes()
            .into_iter()
            .map(|r| r.uri)
            .collect();
        let remote_seq = request
            .headers
            .cseq()
            .ok_or_else(|| Error::DialogError("request without CSeq".to_string(), id.clone()))?
            .seq;
        debug!(id = %id, "uas dialog created");
        Ok(Dialog {
            id,
            state: DialogState::Early,
            local,
            remote,
            remote_target,
            route_set,
            secure: request.uri.is_sips(),
            local_seq: 0,
            remote_seq: Some(remote_seq),
        })
    }

    pub fn confirm(&mut self) {
        if self.state == DialogState::Early {
            debug!(id = %self.id, "dialog confirmed");
            self.state = DialogState::Confirmed;
        }
    }

    pub fn terminate(&mut self) {
        if self.state != DialogState::Terminated {
            debug!(id = %self.id, "dialog terminated");
            self.state = DialogState::Terminated;
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == DialogState::Confirmed
    }

    pub fn is_terminated(&self) -> bool {
        self.state == DialogState::Terminated
    }

    /// Refreshes the remote target from a Contact seen in a later response
    /// or request (target refresh, RFC 3261 §12.2).
    pub fn set_remote_target(&mut self, contact: Uri) {
        self.remote_target = contact;
    }

    pub fn next_local_seq(&mut self) -> u32 {
        self.local_seq = if self.local_seq + 1 >= CSEQ_LIMIT {
            1
        } else {
            self.local_seq + 1
        };
        self.local_seq
    }

    /// UAS-side CSeq check (RFC 3261 §12.2.2): a remote CSeq at or below
    /// the last one seen is stale and must be rejected with 500. ACK and
    /// CANCEL reuse their INVITE's number and are exempt.
    pub fn check_remote_seq(&mut self, method: &Method, cseq: u32) -> bool {
        if matches!(method, Method::Ack | Method::Cancel) {
            return true;
        }
        match self.remote_seq {
            Some(previous) if cseq <= previous => false,
            _ => {
                self.remote_seq = Some(cseq);
                true
            }
        }
    }

    /// Builds an in-dialog request (RFC 3261 §12.2.1.1, loose routing):
    /// Request-URI is the remote target, the route set travels in Route
    /// headers. ACK and CANCEL pass their INVITE's CSeq number in `cseq`.
    pub fn make_request(&mut self, method: Method, cseq: Option<u32>, body: String) -> Request {
        let seq = cseq.unwrap_or_else(|| self.next_local_seq());
        let mut headers = Headers::new();
        headers.push("From", &self.local.to_string());
        headers.push("To", &self.remote.to_string());
        headers.push("Call-ID", &self.id.call_id);
        headers.push("CSeq", &format!("{} {}", seq, method));
        for route in &self.route_set {
            headers.push("Route", &format!("<{}>", route));
        }
        headers.push("Max-Forwards", "70");
        Request {
            method,
            uri: self.remote_target.clone(),
            headers,
            body,
        }
    }
}
