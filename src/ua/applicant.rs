use super::UserAgentInner;
use crate::dialog::authenticate::authenticate_request;
use crate::message::{Method, Request, Response, SipMessage};
use crate::transaction::{random_text, TransactionOutput};
use crate::{Error, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Drives one out-of-dialog request (MESSAGE, OPTIONS) to its final
/// response, answering a single 401/407 challenge when credentials are
/// configured. The applicant is tracked on the UA so `stop()` can abort it.
pub(crate) async fn send_request(ua: Arc<UserAgentInner>, request: Request) -> Result<Response> {
    let id = random_text(12);
    let token = CancellationToken::new();
    ua.applicants
        .lock()
        .unwrap()
        .insert(id.clone(), token.clone());
    let result = tokio::select! {
        result = drive(&ua, request) => result,
        _ = token.cancelled() => Err(Error::CanceledError),
    };
    ua.applicants.lock().unwrap().remove(&id);
    result
}

async fn drive(ua: &Arc<UserAgentInner>, request: Request) -> Result<Response> {
    let mut request = request;
    let mut auth_sent = false;
    loop {
        let mut tx = ua.new_client_transaction(request.clone())?;
        tx.send().await?;
        let mut retry = None;
        while let Some(output) = tx.receive().await {
            match output {
                TransactionOutput::Message(SipMessage::Response(resp)) => {
                    if resp.is_provisional() {
                        continue;
                    }
                    if matches!(resp.status_code, 401 | 407) && !auth_sent {
                        let challenge = resp.headers.challenge();
                        let cred = ua.credential();
                        if let (Some(challenge), Some(cred)) = (challenge, cred) {
                            let next_seq = request
                                .headers
                                .cseq()
                                .map(|c| c.seq + 1)
                                .unwrap_or(2);
                            retry = Some(authenticate_request(
                                &request,
                                &challenge,
                                &cred,
                                resp.status_code == 407,
                                next_seq,
                            )?);
                            auth_sent = true;
                            break;
                        }
                        return Err(Error::AuthError(format!(
                            "{} without usable challenge or credentials",
                            resp.status_code
                        )));
                    }
                    if resp.is_success() {
                        return Ok(resp);
                    }
                    return Err(Error::PeerError(resp.status_code, resp.reason_phrase));
                }
                TransactionOutput::Message(_) => {}
                TransactionOutput::Timeout => return Err(Error::TimeoutError(tx.key.clone())),
                TransactionOutput::TransportError(reason) => {
                    return Err(Error::TransportError(reason))
                }
            }
        }
        match retry {
            Some(next) => {
                debug!("retrying {} with credentials", next.method);
                request = next;
            }
            None => {
                return Err(Error::InvalidStateError(
                    "transaction ended without a final response".to_string(),
                ))
            }
        }
    }
}

/// Out-of-dialog request skeleton shared by MESSAGE and OPTIONS.
pub(crate) fn make_applicant_request(
    ua: &UserAgentInner,
    method: Method,
    target: &crate::message::uri::Uri,
    body: String,
    content_type: Option<&str>,
) -> Request {
    let mut headers = crate::message::Headers::new();
    headers.push("From", &ua.local_identity(&crate::transaction::make_tag()));
    headers.push("To", &format!("<{}>", target));
    headers.push(
        "Call-ID",
        &crate::transaction::make_call_id(&ua.via_host),
    );
    headers.push("CSeq", &format!("1 {}", method));
    if let Some(content_type) = content_type {
        headers.push("Content-Type", content_type);
    }
    let mut request = Request {
        method,
        uri: target.clone(),
        headers,
        body,
    };
    ua.prepare_request(&mut request);
    request
}
