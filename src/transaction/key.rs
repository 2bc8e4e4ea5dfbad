use crate::message::{Method, Request, Response};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionRole {
    Client,
    Server,
}

/// Transaction identity: role, Via branch and CSeq method.
///
/// An ACK to a non-2xx final response carries the INVITE's branch and must
/// match the INVITE server transaction, so its key is built with method
/// INVITE. CANCEL keeps its own method and therefore its own transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub role: TransactionRole,
    pub branch: String,
    pub method: Method,
}

impl TransactionKey {
    pub fn from_request(request: &Request, role: TransactionRole) -> Result<Self> {
        let branch = request.headers.branch().ok_or_else(|| {
            Error::ParseError(format!("request without Via branch: {}", request.method))
        })?;
        let method = match request.method {
            Method::Ack => Method::Invite,
            ref method => method.clone(),
        };
        Ok(TransactionKey {
            role,
            branch,
            method,
        })
    }

    pub fn from_response(response: &Response, role: TransactionRole) -> Result<Self> {
        let branch = response.headers.branch().ok_or_else(|| {
            Error::ParseError(format!(
                "response without Via branch: {}",
                response.status_code
            ))
        })?;
        let cseq = response
            .headers
            .cseq()
            .ok_or_else(|| Error::ParseError("response without CSeq".to_string()))?;
        Ok(TransactionKey {
            role,
            branch,
            method: cseq.method,
        })
    }
}

impl std::fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let role = match self.role {
            TransactionRole::Client => "uac",
            TransactionRole::Server => "uas",
        };
        write!(f, "{}/{}({})", role, self.method, self.branch)
    }
}
