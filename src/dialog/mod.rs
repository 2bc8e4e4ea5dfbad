use crate::message::{Request, Response};
use crate::{Error, Result};

pub mod authenticate;
pub mod dialog;
pub mod registration;

/// SIP dialog identifier: Call-ID plus the two tags (RFC 3261 §12).
///
/// Equality and hashing ignore tag order, so a request arriving from either
/// peer finds the same dialog with a single map lookup. During early dialog
/// establishment `remote_tag` may be empty.
#[derive(Clone, Debug)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    pub fn new(call_id: &str, local_tag: &str, remote_tag: &str) -> Self {
        DialogId {
            call_id: call_id.to_string(),
            local_tag: local_tag.to_string(),
            remote_tag: remote_tag.to_string(),
        }
    }
}

impl PartialEq for DialogId {
    fn eq(&self, other: &DialogId) -> bool {
        if self.call_id != other.call_id {
            return false;
        }
        (self.local_tag == other.local_tag && self.remote_tag == other.remote_tag)
            || (self.local_tag == other.remote_tag && self.remote_tag == other.local_tag)
    }
}

impl Eq for DialogId {}

impl std::hash::Hash for DialogId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.call_id.hash(state);
        if self.local_tag > self.remote_tag {
            self.local_tag.hash(state);
            self.remote_tag.hash(state);
        } else {
            self.remote_tag.hash(state);
            self.local_tag.hash(state);
        }
    }
}

impl std::fmt::Display for DialogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.call_id, self.local_tag, self.remote_tag
        )
    }
}

impl TryFrom<&Request> for DialogId {
    type Error = crate::Error;

    /// Dialog id as seen by the receiver of `request`: the sender's From
    /// tag is the remote tag.
    fn try_from(request: &Request) -> Result<Self> {
        let call_id = request
            .headers
            .call_id()
            .ok_or_else(|| Error::ParseError("request without Call-ID".to_string()))?
            .to_string();
        let remote_tag = request
            .headers
            .from_tag()
            .ok_or_else(|| Error::ParseError("request without From tag".to_string()))?;
        let local_tag = request.headers.to_tag().unwrap_or_default();
        Ok(DialogId {
            call_id,
            local_tag,
            remote_tag,
        })
    }
}

impl TryFrom<&Response> for DialogId {
    type Error = crate::Error;

    /// Dialog id as seen by the receiver of `response`: our From tag is the
    /// local tag.
    fn try_from(response: &Response) -> Result<Self> {
        let call_id = response
            .headers
            .call_id()
            .ok_or_else(|| Error::ParseError("response without Call-ID".to_string()))?
            .to_string();
        let local_tag = response
            .headers
            .from_tag()
            .ok_or_else(|| Error::ParseError("response without From tag".to_string()))?;
        let remote_tag = response.headers.to_tag().unwrap_or_default();
        Ok(DialogId {
            call_id,
            local_tag,
            remote_tag,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn tag_order_does_not_matter() {
        let a = DialogId::new("call1", "alice", "bob");
        let b = DialogId::new("call1", "bob", "alice");
        assert_eq!(a, b);

        let mut map = HashMap::new();
        map.insert(a, 1);
        assert_eq!(map.get(&DialogId::new("call1", "bob", "alice")), Some(&1));
    }

    #[test]
    fn different_call_id_differs() {
        let a = DialogId::new("call1", "alice", "bob");
        let b = DialogId::new("call2", "alice", "bob");
        assert_ne!(a, b);
    }
}
