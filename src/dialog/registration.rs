use super::authenticate::authenticate_request;
use crate::message::{uri::Uri, Headers, Method, Request, SipMessage};
use crate::transaction::{make_call_id, make_tag, TransactionOutput};
use crate::ua::{events::UaEvent, UserAgentInner};
use crate::{Error, Result};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Refresh this many seconds before the registration expires.
const REFRESH_MARGIN: u32 = 5;

/// Registrar client: keeps one binding alive, answers one 401/407
/// challenge per attempt, adopts Min-Expires on 423 (RFC 3261 §10.2.8)
/// and owns at most one outstanding REGISTER.
pub struct Registrator {
    inner: Arc<RegistratorInner>,
}

struct RegistratorInner {
    ua: Arc<UserAgentInner>,
    registrar: Uri,
    call_id: String,
    from_tag: String,
    cseq: AtomicU32,
    expires: AtomicU32,
    registered: AtomicBool,
    in_flight: AtomicBool,
    cancel_token: CancellationToken,
}

impl Registrator {
    pub(crate) fn new(ua: Arc<UserAgentInner>) -> Self {
        let registrar = ua.config.registrar_server.clone().unwrap_or_else(|| {
            Uri::new(ua.config.uri.scheme, None, &ua.config.uri.host, None)
        });
        let call_id = make_call_id(&ua.via_host);
        let expires = ua.config.register_expires;
        Registrator {
            inner: Arc::new(RegistratorInner {
                ua,
                registrar,
                call_id,
                from_tag: make_tag(),
                cseq: AtomicU32::new(0),
                expires: AtomicU32::new(expires),
                registered: AtomicBool::new(false),
                in_flight: AtomicBool::new(false),
                cancel_token: CancellationToken::new(),
            }),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.inner.registered.load(Ordering::SeqCst)
    }

    /// Registers now, then refreshes shortly before each expiry until the
    /// registrator is closed.
    pub(crate) fn start(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                inner.register_once().await.ok();
                let expires = inner.expires.load(Ordering::SeqCst);
                let refresh = expires.saturating_sub(REFRESH_MARGIN).max(1);
                tokio::select! {
                    _ = inner.cancel_token.cancelled() => return,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(refresh as u64)) => {}
                }
            }
        });
    }

    /// One registration cycle; concurrent calls coalesce onto the cycle
    /// already in flight.
    pub async fn register(&self) -> Result<()> {
        self.inner.register_once().await
    }

    /// Removes the binding: `Expires: 0` with our contact, or `Contact: *`
    /// when `all`.
    pub async fn unregister(&self, all: bool) -> Result<()> {
        self.inner.unregister(all).await
    }

    pub(crate) async fn close(&self) {
        self.inner.cancel_token.cancel();
        if self.inner.registered.load(Ordering::SeqCst) {
            self.inner.unregister(false).await.ok();
        }
    }
}

impl RegistratorInner {
    fn make_register(&self, expires_value: Option<u32>, wildcard_contact: bool) -> Request {
        let aor = &self.ua.config.uri;
        let mut headers = Headers::new();
        headers.push(
            "From",
            &format!("<{}>;tag={}", aor.aor(), self.from_tag),
        );
        headers.push("To", &format!("<{}>", aor.aor()));
        headers.push("Call-ID", &self.call_id);
        headers.push(
            "CSeq",
            &format!(
                "{} {}",
                self.cseq.fetch_add(1, Ordering::SeqCst) + 1,
                Method::Register
            ),
        );
        if wildcard_contact {
            headers.push("Contact", "*");
        } else {
            headers.push("Contact", &self.ua.contact_value());
        }
        if let Some(expires) = expires_value {
            headers.push("Expires", &expires.to_string());
        }
        let mut request = Request {
            method: Method::Register,
            uri: self.registrar.clone(),
            headers,
            body: String::new(),
        };
        self.ua.prepare_request(&mut request);
        request
    }

    async fn register_once(&self) -> Result<()> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            // coalesce onto the REGISTER already out
            return Ok(());
        }
        let result = self.register_cycle().await;
        self.in_flight.store(false, Ordering::SeqCst);
        if let Err(e) = &result {
            warn!("registration failed: {}", e);
        }
        result
    }

    async fn register_cycle(&self) -> Result<()> {
        let mut auth_sent = false;
        let mut interval_retried = false;
        let mut request = self.make_register(Some(self.expires.load(Ordering::SeqCst)), false);
        loop {
            let response = match self.transact(request.clone()).await {
                Ok(response) => response,
                Err(e) => {
                    self.fail(0, &e.to_string());
                    return Err(e);
                }
            };
            match response.status_code {
                code if (200..300).contains(&code) => {
                    self.adopt_expires(&response);
                    self.registered.store(true, Ordering::SeqCst);
                    let expires = self.expires.load(Ordering::SeqCst);
                    info!(expires, "registered");
                    self.ua.emit(UaEvent::Registered { expires });
                    return Ok(());
                }
                401 | 407 => {
                    if auth_sent {
                        self.fail(response.status_code, &response.reason_phrase);
                        return Err(Error::AuthError(
                            "challenge repeated after credentials sent".to_string(),
                        ));
                    }
                    let challenge = response.headers.challenge();
                    let cred = self.ua.credential();
                    let (Some(challenge), Some(cred)) = (challenge, cred) else {
                        self.fail(response.status_code, &response.reason_phrase);
                        return Err(Error::AuthError(format!(
                            "{} without usable challenge or credentials",
                            response.status_code
                        )));
                    };
                    let next_seq = self.cseq.fetch_add(1, Ordering::SeqCst) + 1;
                    request = authenticate_request(
                        &request,
                        &challenge,
                        &cred,
                        response.status_code == 407,
                        next_seq,
                    )?;
                    auth_sent = true;
                }
                423 => {
                    let min_expires = response.headers.min_expires();
                    match min_expires {
                        Some(min) if !interval_retried => {
                            debug!(min, "interval too brief, adopting Min-Expires");
                            self.expires.store(min, Ordering::SeqCst);
                            interval_retried = true;
                            request = self.make_register(Some(min), false);
                        }
                        _ => {
                            self.fail(423, &response.reason_phrase);
                            return Err(Error::PeerError(423, response.reason_phrase));
                        }
                    }
                }
                code => {
                    self.fail(code, &response.reason_phrase);
                    return Err(Error::PeerError(code, response.reason_phrase));
                }
            }
        }
    }

    async fn unregister(&self, all: bool) -> Result<()> {
        let request = self.make_register(Some(0), all);
        let was_registered = self.registered.swap(false, Ordering::SeqCst);
        let result = self.transact(request).await;
        if was_registered {
            self.ua.emit(UaEvent::Unregistered);
        }
        result.map(|_| ())
    }

    /// Sends one REGISTER and returns its final response.
    async fn transact(&self, request: Request) -> Result<crate::message::Response> {
        let mut tx = self.ua.new_client_transaction(request)?;
        tx.send().await?;
        while let Some(output) = tx.receive().await {
            match output {
                TransactionOutput::Message(SipMessage::Response(resp)) => {
                    if resp.is_provisional() {
                        continue;
                    }
                    return Ok(resp);
                }
                TransactionOutput::Message(_) => {}
                TransactionOutput::Timeout => return Err(Error::TimeoutError(tx.key.clone())),
                TransactionOutput::TransportError(reason) => {
                    return Err(Error::TransportError(reason))
                }
            }
        }
        Err(Error::InvalidStateError(
            "REGISTER transaction ended without a final response".to_string(),
        ))
    }

    /// Picks the granted lifetime: the expires parameter on our Contact,
    /// else the Expires header, else what we asked for.
    fn adopt_expires(&self, response: &crate::message::Response) {
        let ours = &self.ua.contact_uri;
        let from_contact = response.headers.contacts().iter().find_map(|c| {
            if c.uri.user == ours.user && c.uri.host == ours.host {
                c.params.value("expires").and_then(|v| v.parse().ok())
            } else {
                None
            }
        });
        if let Some(expires) = from_contact.or_else(|| response.headers.expires()) {
            if expires > 0 {
                self.expires.store(expires, Ordering::SeqCst);
            }
        }
    }

    fn fail(&self, status_code: u16, reason_phrase: &str) {
        self.registered.store(false, Ordering::SeqCst);
        self.ua.emit(UaEvent::RegistrationFailed {
            status_code,
            reason_phrase: reason_phrase.to_string(),
        });
    }
}
