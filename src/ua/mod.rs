use crate::dialog::authenticate::Credential;
use crate::dialog::registration::Registrator;
use crate::dialog::DialogId;
use crate::message::{
    parser, uri::Scheme, uri::Uri, Method, Request, Response, SipMessage,
};
use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::transaction::{
    client_key, server_key, Transaction, TransactionCore, TransactionCoreRef,
};
use crate::transaction::{make_response, make_tag, random_text, TransactionLifecycle};
use crate::transport::{
    SipConnection, TransportEvent, TransportReceiver, TransportSender, KEEPALIVE_REQUEST,
    KEEPALIVE_RESPONSE,
};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod applicant;
pub mod config;
pub mod events;
pub mod session;
pub mod subscriber;

use config::UAConfig;
use events::{UaEvent, UaEventReceiver, UaEventSender};
use session::{SdpEngine, Session};
use subscriber::Subscriber;

const USER_AGENT: &str = "sipua/0.1.0";
const ALLOWED_METHODS: &str = "INVITE, ACK, CANCEL, BYE, OPTIONS, MESSAGE, NOTIFY, INFO, UPDATE";
/// Socket teardown grace while BYE/CANCEL exchanges drain after `stop()`.
const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UAStatus {
    Init,
    Ready,
    NotReady,
    UserClosed,
}

#[derive(Clone)]
pub(crate) enum DialogOwner {
    Session(String),
    Subscription(String),
}

/// Shared user-agent state: configuration, the transaction core and the
/// correlation maps. Sessions, subscriptions and the registrator hold an
/// `Arc` of this and look siblings up through it; nothing owns anything
/// else, so there are no reference cycles.
pub struct UserAgentInner {
    pub(crate) config: UAConfig,
    pub(crate) sdp: Option<Arc<dyn SdpEngine>>,
    pub(crate) via_host: String,
    pub(crate) contact_uri: Uri,
    pub(crate) core: TransactionCoreRef,
    pub(crate) applicants: Mutex<HashMap<String, CancellationToken>>,
    events: UaEventSender,
    status: Mutex<UAStatus>,
    connection: Mutex<Option<SipConnection>>,
    sessions: Mutex<HashMap<String, Session>>,
    dialogs: Mutex<HashMap<DialogId, DialogOwner>>,
    subscriptions: Mutex<HashMap<String, Subscriber>>,
    merged_guard: Mutex<HashMap<(String, String, u32), String>>,
    registrator: Mutex<Option<Arc<Registrator>>>,
    transport_tx: TransportSender,
    transport_rx: Mutex<Option<TransportReceiver>>,
    lifecycle_rx: Mutex<Option<UnboundedReceiver<TransactionLifecycle>>>,
    cancel_token: CancellationToken,
    serving: AtomicBool,
    pump_started: AtomicBool,
}

pub struct UserAgentBuilder {
    config: Option<UAConfig>,
    sdp: Option<Arc<dyn SdpEngine>>,
}

impl UserAgentBuilder {
    pub fn new() -> Self {
        UserAgentBuilder {
            config: None,
            sdp: None,
        }
    }

    pub fn config(mut self, config: UAConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn sdp_engine(mut self, engine: Arc<dyn SdpEngine>) -> Self {
        self.sdp = Some(engine);
        self
    }

    /// Validates the configuration and assembles the agent. Configuration
    /// problems are fatal and reported here, before anything runs.
    pub fn build(self) -> Result<UserAgent> {
        let config = self
            .config
            .ok_or_else(|| Error::ConfigurationError("config is required".to_string()))?;
        config.validate()?;

        let via_host = format!("{}.invalid", random_text(12).to_ascii_lowercase());
        let contact_uri = config.contact_uri.clone().unwrap_or_else(|| {
            Uri::new(
                config.uri.scheme,
                Some(&random_text(8).to_ascii_lowercase()),
                &via_host,
                None,
            )
        });

        let cancel_token = CancellationToken::new();
        let (lifecycle_tx, lifecycle_rx) = unbounded_channel();
        let core = TransactionCore::new(lifecycle_tx, cancel_token.child_token(), None);
        let (events_tx, events_rx) = unbounded_channel();
        let (transport_tx, transport_rx) = unbounded_channel();

        let inner = Arc::new(UserAgentInner {
            config,
            sdp: self.sdp,
            via_host,
            contact_uri,
            core,
            applicants: Mutex::new(HashMap::new()),
            events: events_tx,
            status: Mutex::new(UAStatus::Init),
            connection: Mutex::new(None),
            sessions: Mutex::new(HashMap::new()),
            dialogs: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            merged_guard: Mutex::new(HashMap::new()),
            registrator: Mutex::new(None),
            transport_tx,
            transport_rx: Mutex::new(Some(transport_rx)),
            lifecycle_rx: Mutex::new(Some(lifecycle_rx)),
            cancel_token,
            serving: AtomicBool::new(false),
            pump_started: AtomicBool::new(false),
        });

        Ok(UserAgent {
            inner,
            events: events_rx,
        })
    }
}

impl Default for UserAgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The top-level user agent: owns the socket, correlates inbound traffic
/// with transactions, dialogs, sessions and applicants, and reports
/// everything through the event stream.
pub struct UserAgent {
    pub(crate) inner: Arc<UserAgentInner>,
    events: UaEventReceiver,
}

impl UserAgent {
    pub fn builder() -> UserAgentBuilder {
        UserAgentBuilder::new()
    }

    pub fn status(&self) -> UAStatus {
        *self.inner.status.lock().unwrap()
    }

    /// Opens the socket and begins serving. A no-op while `Ready`; after
    /// `stop()` the agent reconnects from scratch.
    pub fn start(&self) {
        {
            let mut status = self.inner.status.lock().unwrap();
            if *status == UAStatus::Ready {
                return;
            }
            *status = UAStatus::Init;
        }
        if self.inner.serving.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.inner.pump_started.swap(true, Ordering::SeqCst) {
            let core = self.inner.core.clone();
            tokio::spawn(async move { core.process_timer().await });
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            serve(inner.clone()).await;
            inner.serving.store(false, Ordering::SeqCst);
        });
    }

    /// Unregisters, terminates every session, subscription and applicant,
    /// and disconnects. When exchanges are still draining the socket stays
    /// up for a short grace window so BYE/CANCEL can complete.
    pub async fn stop(&self) {
        {
            let mut status = self.inner.status.lock().unwrap();
            if *status == UAStatus::UserClosed {
                return;
            }
            *status = UAStatus::UserClosed;
        }
        info!("stopping user agent");

        let registrator = self.inner.registrator.lock().unwrap().clone();
        if let Some(registrator) = registrator {
            registrator.close().await;
        }

        let sessions: Vec<Session> = self.inner.sessions.lock().unwrap().values().cloned().collect();
        for session in &sessions {
            session.terminate();
        }
        let subscriptions: Vec<Subscriber> = self
            .inner
            .subscriptions
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for subscription in &subscriptions {
            subscription.unsubscribe();
        }
        let applicants: Vec<CancellationToken> = self
            .inner
            .applicants
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for token in applicants {
            token.cancel();
        }

        if self.inner.core.len() > 0 || !self.inner.sessions.lock().unwrap().is_empty() {
            debug!("draining transactions before disconnect");
            tokio::time::sleep(STOP_GRACE).await;
        }
        let connection = self.inner.connection.lock().unwrap().take();
        if let Some(connection) = connection {
            connection.close().await.ok();
            self.inner
                .emit(UaEvent::SocketDisconnected { cause: None });
        }
    }

    pub async fn recv_event(&mut self) -> Option<UaEvent> {
        self.events.recv().await
    }

    /// Starts an outbound call. `body` overrides the media engine's offer.
    pub fn call(&self, target: &str, body: Option<String>) -> Result<Session> {
        let uri = Uri::parse(target)?;
        self.inner.connection()?;
        let session = session::start_outgoing(self.inner.clone(), uri, body);
        self.inner
            .sessions
            .lock()
            .unwrap()
            .insert(session.id().to_string(), session.clone());
        Ok(session)
    }

    pub async fn send_message(
        &self,
        target: &str,
        body: &str,
        content_type: Option<&str>,
    ) -> Result<Response> {
        let uri = Uri::parse(target)?;
        let request = applicant::make_applicant_request(
            &self.inner,
            Method::Message,
            &uri,
            body.to_string(),
            Some(content_type.unwrap_or("text/plain")),
        );
        applicant::send_request(self.inner.clone(), request).await
    }

    pub async fn send_options(&self, target: &str) -> Result<Response> {
        let uri = Uri::parse(target)?;
        let request = applicant::make_applicant_request(
            &self.inner,
            Method::Options,
            &uri,
            String::new(),
            None,
        );
        applicant::send_request(self.inner.clone(), request).await
    }

    pub fn subscribe(&self, target: &str, event: &str, expires: u32) -> Result<Subscriber> {
        let uri = Uri::parse(target)?;
        self.inner.connection()?;
        let subscriber = subscriber::start_subscribe(self.inner.clone(), uri, event, expires);
        self.inner
            .subscriptions
            .lock()
            .unwrap()
            .insert(subscriber.id().to_string(), subscriber.clone());
        Ok(subscriber)
    }

    pub fn is_registered(&self) -> bool {
        self.inner
            .registrator
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| r.is_registered())
            .unwrap_or(false)
    }

    pub async fn register(&self) -> Result<()> {
        let registrator = self.inner.registrator_arc();
        registrator.register().await
    }

    pub async fn unregister(&self, all: bool) -> Result<()> {
        let registrator = self.inner.registrator_arc();
        registrator.unregister(all).await
    }

    /// Live transactions; drains to zero after `stop()`.
    pub fn active_transactions(&self) -> usize {
        self.inner.core.len()
    }
}

impl Drop for UserAgent {
    fn drop(&mut self) {
        self.inner.cancel_token.cancel();
    }
}

impl UserAgentInner {
    pub(crate) fn emit(&self, event: UaEvent) {
        self.events.send(event).ok();
    }

    pub(crate) fn connection(&self) -> Result<SipConnection> {
        self.connection
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::TransportError("not connected".to_string()))
    }

    fn set_status(&self, status: UAStatus) {
        *self.status.lock().unwrap() = status;
    }

    fn is_user_closed(&self) -> bool {
        *self.status.lock().unwrap() == UAStatus::UserClosed
    }

    pub(crate) fn credential(&self) -> Option<Credential> {
        if self.config.password.is_none() && self.config.ha1.is_none() {
            return None;
        }
        Some(Credential {
            username: self.config.auth_username(),
            password: self.config.password.clone().unwrap_or_default(),
            realm: self.config.realm.clone(),
            ha1: self.config.ha1.clone(),
        })
    }

    /// From/To identity for requests this agent originates.
    pub(crate) fn local_identity(&self, tag: &str) -> String {
        let aor = self.config.uri.aor();
        match &self.config.display_name {
            Some(name) => format!("\"{}\" <{}>;tag={}", name, aor, tag),
            None => format!("<{}>;tag={}", aor, tag),
        }
    }

    /// Contact for registrations, invitations and dialog establishment.
    pub(crate) fn contact_value(&self) -> String {
        let transport = self
            .connection
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.via_transport().to_ascii_lowercase())
            .unwrap_or_else(|| "ws".to_string());
        let mut value = format!("<{};transport={}>", self.contact_uri, transport);
        if let Some(instance_id) = &self.config.instance_id {
            value.push_str(&format!(";+sip.instance=\"<{}>\"", instance_id));
        }
        value
    }

    /// Stamps the headers every originated request carries: topmost Via
    /// with a fresh branch, Max-Forwards, identity and Allow.
    pub(crate) fn prepare_request(&self, request: &mut Request) {
        let transport = self
            .connection
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.via_transport().to_string())
            .unwrap_or_else(|| "WS".to_string());
        request.headers.push_front(
            "Via",
            &format!(
                "SIP/2.0/{} {};branch={}",
                transport,
                self.via_host,
                crate::transaction::make_branch()
            ),
        );
        if !request.headers.has("Max-Forwards") {
            request.headers.push("Max-Forwards", "70");
        }
        if !request.headers.has("Allow") {
            request.headers.push("Allow", ALLOWED_METHODS);
        }
        request.headers.push("User-Agent", USER_AGENT);
    }

    pub(crate) fn new_client_transaction(&self, request: Request) -> Result<Transaction> {
        let key = client_key(&request)?;
        let connection = self.connection()?;
        Ok(Transaction::new_client(
            key,
            request,
            self.core.clone(),
            connection,
        ))
    }

    pub(crate) fn registrator_arc(self: &Arc<Self>) -> Arc<Registrator> {
        let mut guard = self.registrator.lock().unwrap();
        match guard.as_ref() {
            Some(registrator) => registrator.clone(),
            None => {
                let registrator = Arc::new(Registrator::new(self.clone()));
                *guard = Some(registrator.clone());
                registrator
            }
        }
    }

    pub(crate) fn link_dialog(&self, id: &DialogId, session_id: &str) {
        self.dialogs
            .lock()
            .unwrap()
            .insert(id.clone(), DialogOwner::Session(session_id.to_string()));
    }

    pub(crate) fn link_subscription_dialog(&self, id: &DialogId, subscription_id: &str) {
        self.dialogs.lock().unwrap().insert(
            id.clone(),
            DialogOwner::Subscription(subscription_id.to_string()),
        );
    }

    pub(crate) fn unlink_session(&self, session_id: &str, dialog_id: Option<&DialogId>) {
        self.sessions.lock().unwrap().remove(session_id);
        if let Some(dialog_id) = dialog_id {
            self.dialogs.lock().unwrap().remove(dialog_id);
        }
    }

    pub(crate) fn unlink_subscription(&self, subscription_id: &str, dialog_id: Option<&DialogId>) {
        self.subscriptions.lock().unwrap().remove(subscription_id);
        if let Some(dialog_id) = dialog_id {
            self.dialogs.lock().unwrap().remove(dialog_id);
        }
    }

    fn find_session(&self, call_id: &str, tag: &str) -> Option<Session> {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .find(|s| s.inner.call_id == call_id && s.matches_tag(tag))
            .cloned()
    }

    fn find_subscription(&self, call_id: &str, tag: &str) -> Option<Subscriber> {
        self.subscriptions
            .lock()
            .unwrap()
            .values()
            .find(|s| s.matches(call_id, tag))
            .cloned()
    }

    fn scrub_merged(&self, key: &TransactionKey) {
        self.merged_guard
            .lock()
            .unwrap()
            .retain(|_, branch| branch != &key.branch);
    }

    async fn reply_stateless(&self, request: &Request, status_code: u16, connection: &SipConnection) {
        let response = make_response(request, status_code, Some(&make_tag()));
        connection.send(&response.to_string()).await.ok();
    }

    async fn handle_frame(self: &Arc<Self>, frame: String, connection: SipConnection) {
        if frame == KEEPALIVE_REQUEST {
            connection.send(KEEPALIVE_RESPONSE).await.ok();
            return;
        }
        if frame == KEEPALIVE_RESPONSE || frame.trim().is_empty() {
            return;
        }
        match parser::parse(&frame) {
            Ok(SipMessage::Request(request)) => self.receive_request(request, connection).await,
            Ok(SipMessage::Response(response)) => self.receive_response(response).await,
            Err(e) => {
                debug!("dropping inbound message: {}", e);
            }
        }
    }

    /// Minimal well-formedness beyond the parser: the headers every
    /// dispatchable request must carry.
    fn request_is_sane(&self, request: &Request) -> bool {
        let Some(cseq) = request.headers.cseq() else {
            return false;
        };
        cseq.method == request.method
            && request.headers.call_id().is_some()
            && request.headers.get("To").is_some()
            && request.headers.from_tag().is_some()
            && request.headers.branch().is_some()
    }

    async fn receive_request(self: &Arc<Self>, request: Request, connection: SipConnection) {
        if !self.request_is_sane(&request) {
            if request.method != Method::Ack && request.headers.branch().is_some() {
                self.reply_stateless(&request, 400, &connection).await;
            }
            return;
        }
        let call_id = request.headers.call_id().unwrap_or_default().to_string();
        let from_tag = request.headers.from_tag().unwrap_or_default();
        let Some(cseq) = request.headers.cseq() else {
            return;
        };

        // request-URI checks
        let ruri_user = request.uri.user.as_deref();
        if ruri_user != self.config.uri.user.as_deref()
            && ruri_user != self.contact_uri.user.as_deref()
        {
            debug!(user = ?ruri_user, "request-URI user is not us");
            if request.method != Method::Ack {
                self.reply_stateless(&request, 404, &connection).await;
            }
            return;
        }
        if request.uri.scheme == Scheme::Sips && !connection.is_sips() {
            self.reply_stateless(&request, 416, &connection).await;
            return;
        }

        // an existing server transaction absorbs retransmissions and ACK
        let key = match server_key(&request) {
            Ok(key) => key,
            Err(_) => return,
        };
        let request = match self
            .core
            .dispatch(&key, request.into(), Some(connection.clone()))
        {
            Ok(()) => return,
            Err(SipMessage::Request(request)) => request,
            Err(_) => return,
        };

        if request.method == Method::Cancel {
            self.receive_cancel(request, &key, &call_id, &from_tag, &connection)
                .await;
            return;
        }
        if request.method == Method::Ack {
            // ACK for a 2xx arrives outside any transaction
            if let Some(to_tag) = request.headers.to_tag() {
                if let Some(session) = self.find_session(&call_id, &to_tag) {
                    session.deliver_ack();
                }
            }
            return;
        }

        // merged request (RFC 3261 §8.2.2.2): same dialog-forming triple
        // through a different branch
        let merged_key = (call_id.clone(), from_tag.clone(), cseq.seq);
        let is_merged = {
            let guard = self.merged_guard.lock().unwrap();
            guard
                .get(&merged_key)
                .map(|branch| branch != &key.branch)
                .unwrap_or(false)
        };
        if is_merged {
            self.reply_stateless(&request, 482, &connection).await;
            return;
        }

        let mut tx =
            Transaction::new_server(key.clone(), request.clone(), self.core.clone(), connection);
        self.merged_guard
            .lock()
            .unwrap()
            .insert(merged_key, key.branch.clone());

        match request.headers.to_tag() {
            None => self.route_out_of_dialog(tx, request).await,
            Some(to_tag) => {
                let id = DialogId::new(&call_id, &to_tag, &from_tag);
                let owner = self.dialogs.lock().unwrap().get(&id).cloned();
                match owner {
                    Some(DialogOwner::Session(session_id)) => {
                        let session = self.sessions.lock().unwrap().get(&session_id).cloned();
                        match session {
                            Some(session) => session.receive_in_dialog(tx).await,
                            None => {
                                tx.reply(481, None).await.ok();
                            }
                        }
                    }
                    Some(DialogOwner::Subscription(subscription_id)) => {
                        let subscription = self
                            .subscriptions
                            .lock()
                            .unwrap()
                            .get(&subscription_id)
                            .cloned();
                        match subscription {
                            Some(subscription) => subscription.receive_in_dialog(tx).await,
                            None => {
                                tx.reply(481, None).await.ok();
                            }
                        }
                    }
                    None => {
                        // NOTIFY may beat the dialog-forming 200 home
                        if request.method == Method::Notify {
                            if let Some(subscription) = self.find_subscription(&call_id, &to_tag) {
                                subscription.receive_in_dialog(tx).await;
                                return;
                            }
                        }
                        tx.reply(481, None).await.ok();
                    }
                }
            }
        }
    }

    /// Out-of-dialog method routing (dispatcher step 5).
    async fn route_out_of_dialog(self: &Arc<Self>, mut tx: Transaction, request: Request) {
        match request.method {
            Method::Options => {
                let mut response = make_response(&request, 200, Some(&make_tag()));
                response.headers.push("Allow", ALLOWED_METHODS);
                response.headers.push("Accept", "application/sdp");
                tx.respond(response).await.ok();
                self.emit(UaEvent::NewOptions { request });
            }
            Method::Message => {
                if self.events.is_closed() {
                    tx.reply(405, Some(&make_tag())).await.ok();
                    return;
                }
                tx.reply(200, Some(&make_tag())).await.ok();
                self.emit(UaEvent::NewMessage { request });
            }
            Method::Invite => {
                if request.headers.contact().is_none() {
                    tx.reply(400, Some(&make_tag())).await.ok();
                    return;
                }
                if let Some(replaces) = request.headers.replaces() {
                    let replaced = DialogId::new(
                        &replaces.call_id,
                        &replaces.to_tag,
                        &replaces.from_tag,
                    );
                    let owner = self.dialogs.lock().unwrap().get(&replaced).cloned();
                    match owner {
                        Some(DialogOwner::Session(session_id)) => {
                            let replaced = self.sessions.lock().unwrap().get(&session_id).cloned();
                            match replaced {
                                Some(replaced) if !replaced.is_ended() => {
                                    if replaces.early_only && replaced.is_established() {
                                        // RFC 3891 §3: early-only may not
                                        // replace a confirmed dialog
                                        tx.reply(486, Some(&make_tag())).await.ok();
                                        return;
                                    }
                                }
                                _ => {
                                    tx.reply(603, Some(&make_tag())).await.ok();
                                    return;
                                }
                            }
                        }
                        _ => {
                            tx.reply(481, Some(&make_tag())).await.ok();
                            return;
                        }
                    }
                }
                let session = session::start_incoming(self.clone(), tx, request.clone());
                self.sessions
                    .lock()
                    .unwrap()
                    .insert(session.id().to_string(), session.clone());
                self.emit(UaEvent::NewSession {
                    session,
                    request: Some(request),
                });
            }
            Method::Bye => {
                tx.reply(481, Some(&make_tag())).await.ok();
            }
            Method::Notify => {
                tx.reply(200, Some(&make_tag())).await.ok();
                self.emit(UaEvent::SipEvent { request });
            }
            Method::Subscribe => {
                // notifier role is not offered; let the peer know and
                // surface the attempt
                self.emit(UaEvent::NewSubscribe {
                    request: request.clone(),
                });
                tx.reply(405, Some(&make_tag())).await.ok();
            }
            _ => {
                let mut response = make_response(&request, 405, Some(&make_tag()));
                response.headers.push("Allow", ALLOWED_METHODS);
                tx.respond(response).await.ok();
            }
        }
    }

    /// CANCEL never creates a server transaction here: it is answered
    /// statelessly and delivered to the session owning the INVITE.
    async fn receive_cancel(
        self: &Arc<Self>,
        request: Request,
        key: &TransactionKey,
        call_id: &str,
        from_tag: &str,
        connection: &SipConnection,
    ) {
        let invite_key = TransactionKey {
            role: TransactionRole::Server,
            branch: key.branch.clone(),
            method: Method::Invite,
        };
        let session = self.find_session(call_id, from_tag);
        if self.core.contains(&invite_key) {
            if let Some(session) = session {
                self.reply_stateless(&request, 200, connection).await;
                session.deliver_cancel();
                return;
            }
        }
        self.reply_stateless(&request, 481, connection).await;
    }

    /// Response dispatch: client transaction by branch and method;
    /// unmatched responses are dropped (dispatcher last step).
    async fn receive_response(self: &Arc<Self>, response: Response) {
        let key = match TransactionKey::from_response(&response, TransactionRole::Client) {
            Ok(key) => key,
            Err(e) => {
                debug!("unroutable response: {}", e);
                return;
            }
        };
        if self.core.dispatch(&key, response.into(), None).is_err() {
            debug!(key = %key, "response without transaction dropped");
        }
    }
}

fn recovery_backoff(config: &UAConfig, attempt: u32) -> Duration {
    let min = config.connection_recovery_min_interval;
    let max = config.connection_recovery_max_interval;
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    (min * factor).min(max)
}

/// Main serve loop: connect (with recovery backoff), pump the socket, and
/// dispatch until the agent is closed.
async fn serve(inner: Arc<UserAgentInner>) {
    let mut transport_rx = match inner.transport_rx.lock().unwrap().take() {
        Some(rx) => rx,
        None => return,
    };
    let mut lifecycle_rx = match inner.lifecycle_rx.lock().unwrap().take() {
        Some(rx) => rx,
        None => {
            *inner.transport_rx.lock().unwrap() = Some(transport_rx);
            return;
        }
    };

    let mut attempt: u32 = 0;
    let mut registered_before = false;
    'recovery: loop {
        if inner.is_user_closed() || inner.cancel_token.is_cancelled() {
            break;
        }
        if attempt > 0 {
            let backoff = recovery_backoff(&inner.config, attempt);
            debug!(attempt, "reconnecting in {:?}", backoff);
            tokio::select! {
                _ = inner.cancel_token.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            if inner.is_user_closed() {
                break;
            }
        }
        let socket_index = attempt as usize % inner.config.sockets.len();
        let connection = inner.config.sockets[socket_index].clone();
        inner.emit(UaEvent::SocketConnecting { attempt });
        if let Err(e) = connection.connect().await {
            debug!("connect failed: {}", e);
            attempt += 1;
            continue;
        }
        *inner.connection.lock().unwrap() = Some(connection.clone());
        inner.set_status(UAStatus::Ready);
        inner.emit(UaEvent::SocketConnected);
        info!(socket = %connection, "socket connected");

        if inner.config.register {
            let registrator = inner.registrator_arc();
            if registered_before {
                // fresh binding over the new socket; lost INVITEs stay lost
                let registrator = registrator.clone();
                tokio::spawn(async move { registrator.register().await.ok() });
            } else {
                registrator.start();
                registered_before = true;
            }
        }
        attempt = 0;

        let pump = tokio::spawn({
            let connection = connection.clone();
            let sender = inner.transport_tx.clone();
            async move {
                let result = connection.serve_loop(sender.clone()).await;
                sender
                    .send(TransportEvent::Disconnected(
                        result.err().map(|e| e.to_string()),
                    ))
                    .ok();
            }
        });

        loop {
            tokio::select! {
                _ = inner.cancel_token.cancelled() => {
                    pump.abort();
                    break 'recovery;
                }
                event = transport_rx.recv() => match event {
                    Some(TransportEvent::Incoming(frame, connection)) => {
                        inner.handle_frame(frame, connection).await;
                    }
                    Some(TransportEvent::Disconnected(cause)) => {
                        pump.abort();
                        inner.connection.lock().unwrap().take();
                        if inner.is_user_closed() {
                            // stop() already reported the teardown
                            break 'recovery;
                        }
                        warn!(cause = ?cause, "socket disconnected");
                        inner.emit(UaEvent::SocketDisconnected { cause: cause.clone() });
                        inner
                            .core
                            .abort_all(cause.as_deref().unwrap_or("socket disconnected"));
                        inner.set_status(UAStatus::NotReady);
                        attempt = 1;
                        continue 'recovery;
                    }
                    Some(_) => {}
                    None => break 'recovery,
                },
                lifecycle = lifecycle_rx.recv() => match lifecycle {
                    Some(TransactionLifecycle::Created(key)) => {
                        inner.emit(UaEvent::NewTransaction { key });
                    }
                    Some(TransactionLifecycle::Destroyed(key)) => {
                        inner.scrub_merged(&key);
                        inner.emit(UaEvent::TransactionDestroyed { key });
                    }
                    None => {}
                },
            }
        }
    }

    *inner.transport_rx.lock().unwrap() = Some(transport_rx);
    *inner.lifecycle_rx.lock().unwrap() = Some(lifecycle_rx);
}
