use super::UserAgentInner;
use crate::dialog::dialog::Dialog;
use crate::message::{uri::Uri, Method, Request};
use crate::transaction::transaction::{make_cancel, Transaction};
use crate::transaction::{TransactionOutput, T1X64};
use crate::ua::events::UaEvent;
use crate::{Error, Result};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

/// Media engine hooks consumed by sessions; SDP semantics live outside
/// this crate.
pub trait SdpEngine: Send + Sync {
    fn create_offer(&self) -> String;
    fn create_answer(&self, remote_sdp: &str) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Null,
    InviteSent,
    Progress,
    WaitingForAnswer,
    WaitingForAck,
    Confirmed,
    Terminated,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Null => "Null",
            SessionState::InviteSent => "InviteSent",
            SessionState::Progress => "Progress",
            SessionState::WaitingForAnswer => "WaitingForAnswer",
            SessionState::WaitingForAck => "WaitingForAck",
            SessionState::Confirmed => "Confirmed",
            SessionState::Terminated => "Terminated",
        };
        f.write_str(name)
    }
}

/// Why a session ended. `status_code` is 0 for locally-originated causes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationCause {
    pub cause: String,
    pub status_code: u16,
    pub reason_phrase: String,
}

impl TerminationCause {
    pub fn local(cause: &str) -> Self {
        TerminationCause {
            cause: cause.to_string(),
            status_code: 0,
            reason_phrase: String::new(),
        }
    }

    pub fn remote(cause: &str, status_code: u16, reason_phrase: &str) -> Self {
        TerminationCause {
            cause: cause.to_string(),
            status_code,
            reason_phrase: reason_phrase.to_string(),
        }
    }
}

pub(crate) enum SessionCommand {
    Answer { body: Option<String> },
    Reject { status_code: u16 },
    Terminate,
    RemoteCancel,
    AckReceived,
    Shutdown,
}

pub(crate) struct SessionInner {
    pub id: String,
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: Mutex<Option<String>>,
    pub direction: SessionDirection,
    pub state: Mutex<SessionState>,
    pub dialog: Mutex<Option<Dialog>>,
    pub ua: Arc<UserAgentInner>,
    cmd_tx: UnboundedSender<SessionCommand>,
    reinvite_outstanding: AtomicBool,
}

/// One call leg. Cloneable handle; the INVITE exchange runs in a spawned
/// task, in-dialog traffic is delivered by the dispatcher.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Session({} {:?} {})",
            self.inner.id,
            self.inner.direction,
            self.state()
        )
    }
}

impl Session {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock().unwrap()
    }

    pub fn direction(&self) -> SessionDirection {
        self.inner.direction
    }

    pub fn is_established(&self) -> bool {
        self.state() == SessionState::Confirmed
    }

    pub fn is_ended(&self) -> bool {
        self.state() == SessionState::Terminated
    }

    /// Accepts an incoming call. `body` overrides the media engine's answer.
    pub fn answer(&self, body: Option<String>) -> Result<()> {
        if self.state() != SessionState::WaitingForAnswer {
            return Err(Error::InvalidStateError(format!(
                "cannot answer in {} state",
                self.state()
            )));
        }
        self.inner
            .cmd_tx
            .send(SessionCommand::Answer { body })
            .map_err(Into::into)
    }

    /// Rejects an incoming call with a final status (486, 603, ...).
    pub fn reject(&self, status_code: u16) -> Result<()> {
        if self.state() != SessionState::WaitingForAnswer {
            return Err(Error::InvalidStateError(format!(
                "cannot reject in {} state",
                self.state()
            )));
        }
        self.inner
            .cmd_tx
            .send(SessionCommand::Reject { status_code })
            .map_err(Into::into)
    }

    /// Ends the call whatever its state: CANCEL before the final response,
    /// 486 before answering, BYE once established.
    pub fn terminate(&self) {
        match self.state() {
            SessionState::InviteSent | SessionState::Progress => {
                self.inner.cmd_tx.send(SessionCommand::Terminate).ok();
            }
            SessionState::WaitingForAnswer => {
                self.inner
                    .cmd_tx
                    .send(SessionCommand::Reject { status_code: 486 })
                    .ok();
            }
            SessionState::WaitingForAck | SessionState::Confirmed => {
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    inner.send_bye().await;
                    inner.terminated(TerminationCause::local("Terminated"));
                });
            }
            SessionState::Null | SessionState::Terminated => {}
        }
    }

    /// Sends an in-dialog re-INVITE. While it is outstanding, a crossing
    /// re-INVITE from the peer is answered with 491 (RFC 3261 §14.2).
    pub fn renegotiate(&self, body: Option<String>) -> Result<()> {
        if self.state() != SessionState::Confirmed {
            return Err(Error::InvalidStateError(format!(
                "cannot renegotiate in {} state",
                self.state()
            )));
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.run_reinvite(body).await;
        });
        Ok(())
    }

    pub(crate) fn matches_tag(&self, tag: &str) -> bool {
        self.inner.local_tag == tag
            || self
                .inner
                .remote_tag
                .lock()
                .unwrap()
                .as_deref()
                .map(|t| t == tag)
                .unwrap_or(false)
    }

    pub(crate) fn deliver_cancel(&self) {
        self.inner.cmd_tx.send(SessionCommand::RemoteCancel).ok();
    }

    pub(crate) fn deliver_ack(&self) {
        self.inner.cmd_tx.send(SessionCommand::AckReceived).ok();
    }

    /// In-dialog request routing (dispatcher step 6). The server
    /// transaction is already created; this decides the response.
    pub(crate) async fn receive_in_dialog(&self, mut tx: Transaction) {
        let request = tx.original.clone();
        let cseq = match request.headers.cseq() {
            Some(cseq) => cseq,
            None => {
                tx.reply(400, None).await.ok();
                return;
            }
        };
        let cseq_ok = match self.inner.dialog.lock().unwrap().as_mut() {
            Some(dialog) => dialog.check_remote_seq(&request.method, cseq.seq),
            None => true,
        };
        if !cseq_ok {
            warn!(id = %self.inner.id, "stale CSeq {} on in-dialog {}", cseq.seq, request.method);
            tx.reply(500, Some(&self.inner.local_tag)).await.ok();
            return;
        }
        match request.method {
            Method::Bye => {
                tx.reply(200, Some(&self.inner.local_tag)).await.ok();
                info!(id = %self.inner.id, "session ended by remote BYE");
                self.inner
                    .terminated(TerminationCause::remote("BYE", 200, "OK"));
                self.inner.cmd_tx.send(SessionCommand::Shutdown).ok();
            }
            Method::Invite => {
                if self.inner.reinvite_outstanding.load(Ordering::SeqCst) {
                    // our own re-INVITE is in flight; the glare rule says 491
                    tx.reply(491, Some(&self.inner.local_tag)).await.ok();
                    return;
                }
                let answer = self
                    .inner
                    .ua
                    .sdp
                    .as_ref()
                    .map(|engine| engine.create_answer(&request.body));
                if let Some(contact) = request.headers.contact() {
                    if let Some(dialog) = self.inner.dialog.lock().unwrap().as_mut() {
                        dialog.set_remote_target(contact.uri);
                    }
                }
                let mut response =
                    crate::transaction::make_response(&request, 200, Some(&self.inner.local_tag));
                response
                    .headers
                    .push("Contact", &self.inner.ua.contact_value());
                if let Some(answer) = answer {
                    response.headers.push("Content-Type", "application/sdp");
                    response.body = answer;
                }
                tx.respond(response).await.ok();
            }
            Method::Options | Method::Info | Method::Update => {
                tx.reply(200, Some(&self.inner.local_tag)).await.ok();
            }
            Method::Notify => {
                tx.reply(200, Some(&self.inner.local_tag)).await.ok();
                self.inner.ua.emit(UaEvent::SipEvent { request });
            }
            _ => {
                tx.reply(405, Some(&self.inner.local_tag)).await.ok();
            }
        }
    }
}

impl SessionInner {
    fn emit_terminated(&self, cause: TerminationCause) {
        self.ua.emit(UaEvent::SessionTerminated {
            session_id: self.id.clone(),
            cause,
        });
    }

    /// Idempotent terminal transition: flips the state, tears the dialog
    /// down, unlinks the session from the UA maps and reports the cause.
    pub(crate) fn terminated(&self, cause: TerminationCause) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == SessionState::Terminated {
                return;
            }
            *state = SessionState::Terminated;
        }
        let dialog_id = {
            let mut dialog = self.dialog.lock().unwrap();
            if let Some(dialog) = dialog.as_mut() {
                dialog.terminate();
                Some(dialog.id.clone())
            } else {
                None
            }
        };
        self.ua.unlink_session(&self.id, dialog_id.as_ref());
        debug!(id = %self.id, cause = %cause.cause, "session terminated");
        self.emit_terminated(cause);
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    async fn send_bye(&self) {
        let bye = {
            let mut dialog = self.dialog.lock().unwrap();
            match dialog.as_mut() {
                Some(dialog) if !dialog.is_terminated() => {
                    Some(dialog.make_request(Method::Bye, None, String::new()))
                }
                _ => None,
            }
        };
        let Some(mut bye) = bye else { return };
        self.ua.prepare_request(&mut bye);
        let Ok(mut tx) = self.ua.new_client_transaction(bye) else {
            return;
        };
        if tx.send().await.is_err() {
            return;
        }
        while let Some(output) = tx.receive().await {
            match output {
                TransactionOutput::Message(crate::message::SipMessage::Response(resp)) => {
                    if resp.is_final() {
                        break;
                    }
                }
                _ => break,
            }
        }
    }

    async fn run_reinvite(self: &Arc<Self>, body: Option<String>) {
        let offer = body.or_else(|| self.ua.sdp.as_ref().map(|engine| engine.create_offer()));
        let (mut request, cseq) = {
            let mut dialog = self.dialog.lock().unwrap();
            let Some(dialog) = dialog.as_mut() else {
                return;
            };
            let request =
                dialog.make_request(Method::Invite, None, offer.unwrap_or_default());
            (request, dialog.local_seq)
        };
        request
            .headers
            .push("Contact", &self.ua.contact_value());
        if !request.body.is_empty() {
            request.headers.push("Content-Type", "application/sdp");
        }
        self.ua.prepare_request(&mut request);

        self.reinvite_outstanding.store(true, Ordering::SeqCst);
        let result = self.drive_reinvite(request, cseq).await;
        self.reinvite_outstanding.store(false, Ordering::SeqCst);
        if let Err(e) = result {
            debug!(id = %self.id, "re-INVITE failed: {}", e);
        }
    }

    async fn drive_reinvite(self: &Arc<Self>, request: Request, cseq: u32) -> Result<()> {
        let mut tx = self.ua.new_client_transaction(request)?;
        tx.send().await?;
        while let Some(output) = tx.receive().await {
            match output {
                TransactionOutput::Message(crate::message::SipMessage::Response(resp)) => {
                    if resp.is_provisional() {
                        continue;
                    }
                    if resp.is_success() {
                        if let Some(contact) = resp.headers.contact() {
                            if let Some(dialog) = self.dialog.lock().unwrap().as_mut() {
                                dialog.set_remote_target(contact.uri);
                            }
                        }
                        self.send_ack(cseq).await;
                    } else if resp.status_code == 491 {
                        debug!(id = %self.id, "re-INVITE glare, peer wins");
                    }
                    return Ok(());
                }
                TransactionOutput::Message(_) => {}
                TransactionOutput::Timeout => {
                    return Err(Error::TimeoutError(tx.key.clone()));
                }
                TransactionOutput::TransportError(reason) => {
                    return Err(Error::TransportError(reason));
                }
            }
        }
        Ok(())
    }

    /// ACK for a 2xx travels outside any transaction (RFC 3261 §13.2.2.4).
    async fn send_ack(&self, invite_cseq: u32) {
        let ack = {
            let mut dialog = self.dialog.lock().unwrap();
            match dialog.as_mut() {
                Some(dialog) => dialog.make_request(Method::Ack, Some(invite_cseq), String::new()),
                None => return,
            }
        };
        let mut ack = ack;
        self.ua.prepare_request(&mut ack);
        if let Ok(connection) = self.ua.connection() {
            connection.send(&ack.to_string()).await.ok();
        }
    }
}

/// Creates the outgoing-call session and spawns its INVITE exchange.
pub(crate) fn start_outgoing(
    ua: Arc<UserAgentInner>,
    target: Uri,
    body: Option<String>,
) -> Session {
    let (cmd_tx, cmd_rx) = unbounded_channel();
    let local_tag = crate::transaction::make_tag();
    let call_id = crate::transaction::make_call_id(&ua.via_host);
    let inner = Arc::new(SessionInner {
        id: format!("{}{}", call_id, local_tag),
        call_id,
        local_tag,
        remote_tag: Mutex::new(None),
        direction: SessionDirection::Outgoing,
        state: Mutex::new(SessionState::Null),
        dialog: Mutex::new(None),
        ua,
        cmd_tx,
        reinvite_outstanding: AtomicBool::new(false),
    });
    let session = Session {
        inner: inner.clone(),
    };
    tokio::spawn(run_uac(inner, target, body, cmd_rx));
    session
}

async fn run_uac(
    inner: Arc<SessionInner>,
    target: Uri,
    body: Option<String>,
    mut cmd_rx: UnboundedReceiver<SessionCommand>,
) {
    use crate::message::{Headers, SipMessage};

    let offer = body.or_else(|| inner.ua.sdp.as_ref().map(|engine| engine.create_offer()));
    let invite_cseq: u32 = {
        use rand::Rng;
        rand::thread_rng().gen_range(1..=8192)
    };

    let mut headers = Headers::new();
    headers.push("From", &inner.ua.local_identity(&inner.local_tag));
    headers.push("To", &format!("<{}>", target));
    headers.push("Call-ID", &inner.call_id);
    headers.push("CSeq", &format!("{} {}", invite_cseq, Method::Invite));
    headers.push("Contact", &inner.ua.contact_value());
    if inner.ua.config.session_timers_enabled {
        headers.push("Supported", "timer");
        headers.push("Session-Expires", "1800");
    }
    if offer.is_some() {
        headers.push("Content-Type", "application/sdp");
    }
    let mut request = Request {
        method: Method::Invite,
        uri: target,
        headers,
        body: offer.unwrap_or_default(),
    };
    inner.ua.prepare_request(&mut request);

    let mut tx = match inner.ua.new_client_transaction(request.clone()) {
        Ok(tx) => tx,
        Err(e) => {
            warn!(id = %inner.id, "cannot create INVITE transaction: {}", e);
            inner.terminated(TerminationCause::local("Transport Error"));
            return;
        }
    };
    if tx.send().await.is_err() {
        inner.terminated(TerminationCause::local("Transport Error"));
        return;
    }
    inner.set_state(SessionState::InviteSent);
    info!(id = %inner.id, "INVITE sent");

    let mut pending_cancel = false;
    let mut cancel_sent = false;
    let mut last_ack_cseq = None;
    let mut cause: Option<TerminationCause> = None;

    loop {
        tokio::select! {
            output = tx.receive() => match output {
                Some(TransactionOutput::Message(SipMessage::Response(resp))) => {
                    if resp.status_code == 100 {
                        continue;
                    }
                    if resp.is_provisional() {
                        inner.set_state(SessionState::Progress);
                        if let Some(tag) = resp.headers.to_tag() {
                            *inner.remote_tag.lock().unwrap() = Some(tag);
                            if resp.headers.contact().is_some() {
                                if let Ok(dialog) = Dialog::new_uac(&request, &resp) {
                                    inner.ua.link_dialog(&dialog.id, &inner.id);
                                    inner.dialog.lock().unwrap().replace(dialog);
                                }
                            }
                        }
                        inner.ua.emit(UaEvent::SessionProgress {
                            session_id: inner.id.clone(),
                            status_code: resp.status_code,
                        });
                        if pending_cancel && !cancel_sent {
                            cancel_sent = true;
                            send_cancel(&inner, &request).await;
                        }
                        continue;
                    }
                    if resp.is_success() {
                        if last_ack_cseq.is_some() {
                            // 2xx retransmission: repeat the ACK
                            inner.send_ack(invite_cseq).await;
                            continue;
                        }
                        let remote_tag = resp.headers.to_tag().unwrap_or_default();
                        let known = inner
                            .dialog
                            .lock()
                            .unwrap()
                            .as_ref()
                            .map(|d| d.id.remote_tag == remote_tag)
                            .unwrap_or(false);
                        if known {
                            if let Some(dialog) = inner.dialog.lock().unwrap().as_mut() {
                                dialog.confirm();
                                if let Some(contact) = resp.headers.contact() {
                                    dialog.set_remote_target(contact.uri);
                                }
                            }
                        } else {
                            match Dialog::new_uac(&request, &resp) {
                                Ok(dialog) => {
                                    *inner.remote_tag.lock().unwrap() =
                                        Some(dialog.id.remote_tag.clone());
                                    inner.ua.link_dialog(&dialog.id, &inner.id);
                                    inner.dialog.lock().unwrap().replace(dialog);
                                }
                                Err(e) => {
                                    warn!(id = %inner.id, "unusable 200: {}", e);
                                    cause = Some(TerminationCause::local("SIP Failure"));
                                    break;
                                }
                            }
                        }
                        inner.send_ack(invite_cseq).await;
                        last_ack_cseq = Some(invite_cseq);
                        if pending_cancel {
                            // answer crossed our cancel attempt: close politely
                            inner.send_bye().await;
                            cause = Some(TerminationCause::local("Canceled"));
                            break;
                        }
                        inner.set_state(SessionState::Confirmed);
                        inner.ua.emit(UaEvent::SessionConfirmed {
                            session_id: inner.id.clone(),
                        });
                        continue;
                    }
                    // non-2xx final: the transaction has already ACKed
                    let terminal = if resp.status_code == 487 {
                        TerminationCause::remote("Canceled", 487, &resp.reason_phrase)
                    } else if resp.status_code == 486 || resp.status_code == 600 {
                        TerminationCause::remote("Busy", resp.status_code, &resp.reason_phrase)
                    } else {
                        TerminationCause::remote(
                            "Rejected",
                            resp.status_code,
                            &resp.reason_phrase,
                        )
                    };
                    cause = Some(terminal);
                }
                Some(TransactionOutput::Message(_)) => {}
                Some(TransactionOutput::Timeout) => {
                    cause = Some(TerminationCause::local("Request Timeout"));
                    break;
                }
                Some(TransactionOutput::TransportError(_)) => {
                    cause = Some(TerminationCause::local("Transport Error"));
                    break;
                }
                None => break,
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(SessionCommand::Terminate) => {
                    pending_cancel = true;
                    if inner.state() == SessionState::Progress && !cancel_sent {
                        cancel_sent = true;
                        send_cancel(&inner, &request).await;
                    }
                }
                Some(SessionCommand::Shutdown) | None => break,
                Some(_) => {}
            },
        }
    }
    if let Some(cause) = cause {
        inner.terminated(cause);
    } else if inner.state() != SessionState::Confirmed {
        inner.terminated(TerminationCause::local("Terminated"));
    }
}

async fn send_cancel(inner: &Arc<SessionInner>, invite: &Request) {
    let cancel = make_cancel(invite);
    let Ok(mut tx) = inner.ua.new_client_transaction(cancel) else {
        return;
    };
    if tx.send().await.is_err() {
        return;
    }
    // drive to its final response in the background
    tokio::spawn(async move { while tx.receive().await.is_some() {} });
}

/// Creates the incoming-call session and spawns the answer/reject loop
/// owning the INVITE server transaction.
pub(crate) fn start_incoming(
    ua: Arc<UserAgentInner>,
    tx: Transaction,
    request: Request,
) -> Session {
    let (cmd_tx, cmd_rx) = unbounded_channel();
    let local_tag = crate::transaction::make_tag();
    let call_id = request
        .headers
        .call_id()
        .unwrap_or_default()
        .to_string();
    let remote_tag = request.headers.from_tag();
    let inner = Arc::new(SessionInner {
        id: format!("{}{}", call_id, local_tag),
        call_id,
        local_tag,
        remote_tag: Mutex::new(remote_tag),
        direction: SessionDirection::Incoming,
        state: Mutex::new(SessionState::WaitingForAnswer),
        dialog: Mutex::new(None),
        ua,
        cmd_tx,
        reinvite_outstanding: AtomicBool::new(false),
    });
    let session = Session {
        inner: inner.clone(),
    };
    tokio::spawn(run_uas(inner, tx, request, cmd_rx));
    session
}

async fn run_uas(
    inner: Arc<SessionInner>,
    mut tx: Transaction,
    request: Request,
    mut cmd_rx: UnboundedReceiver<SessionCommand>,
) {
    use crate::message::SipMessage;

    tx.reply(100, None).await.ok();
    info!(id = %inner.id, "incoming INVITE, waiting for answer");

    let no_answer = tokio::time::sleep(inner.ua.config.no_answer_timeout);
    tokio::pin!(no_answer);

    // phase 1: waiting for the application's verdict
    let answered_body = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(SessionCommand::Answer { body }) => break Some(body),
                Some(SessionCommand::Reject { status_code }) => {
                    tx.reply(status_code, Some(&inner.local_tag)).await.ok();
                    inner.terminated(TerminationCause::local("Rejected"));
                    break None;
                }
                Some(SessionCommand::RemoteCancel) => {
                    tx.reply(487, Some(&inner.local_tag)).await.ok();
                    inner.terminated(TerminationCause::remote("Canceled", 487, "Request Terminated"));
                    break None;
                }
                Some(SessionCommand::Terminate) => {
                    tx.reply(486, Some(&inner.local_tag)).await.ok();
                    inner.terminated(TerminationCause::local("Rejected"));
                    break None;
                }
                Some(SessionCommand::Shutdown) | None => {
                    inner.terminated(TerminationCause::local("Terminated"));
                    break None;
                }
                Some(_) => continue,
            },
            output = tx.receive() => match output {
                Some(TransactionOutput::TransportError(_)) => {
                    inner.terminated(TerminationCause::local("Transport Error"));
                    break None;
                }
                Some(TransactionOutput::Timeout) | None => {
                    inner.terminated(TerminationCause::local("Request Timeout"));
                    break None;
                }
                Some(TransactionOutput::Message(_)) => continue,
            },
            _ = &mut no_answer => {
                tx.reply(408, Some(&inner.local_tag)).await.ok();
                inner.terminated(TerminationCause::local("No Answer"));
                break None;
            }
        }
    };
    let Some(body) = answered_body else { return };

    // phase 2: 200 sent, waiting for the ACK
    let answer = body.or_else(|| {
        inner
            .ua
            .sdp
            .as_ref()
            .map(|engine| engine.create_answer(&request.body))
    });
    match Dialog::new_uas(&request, &inner.local_tag) {
        Ok(mut dialog) => {
            dialog.confirm();
            inner.ua.link_dialog(&dialog.id, &inner.id);
            inner.dialog.lock().unwrap().replace(dialog);
        }
        Err(e) => {
            warn!(id = %inner.id, "cannot build dialog: {}", e);
            tx.reply(400, Some(&inner.local_tag)).await.ok();
            inner.terminated(TerminationCause::local("SIP Failure"));
            return;
        }
    }
    let mut response =
        crate::transaction::make_response(&request, 200, Some(&inner.local_tag));
    response
        .headers
        .push("Contact", &inner.ua.contact_value());
    if let Some(answer) = answer {
        response.headers.push("Content-Type", "application/sdp");
        response.body = answer;
    }
    if tx.respond(response).await.is_err() {
        inner.terminated(TerminationCause::local("Transport Error"));
        return;
    }
    inner.set_state(SessionState::WaitingForAck);

    let ack_deadline = tokio::time::sleep(T1X64);
    tokio::pin!(ack_deadline);
    let mut tx_done = false;
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(SessionCommand::AckReceived) => {
                    inner.set_state(SessionState::Confirmed);
                    info!(id = %inner.id, "session confirmed");
                    inner.ua.emit(UaEvent::SessionConfirmed {
                        session_id: inner.id.clone(),
                    });
                    return;
                }
                Some(SessionCommand::Shutdown) | None => return,
                Some(_) => continue,
            },
            output = tx.receive(), if !tx_done => match output {
                Some(TransactionOutput::Message(SipMessage::Request(req)))
                    if req.method == Method::Ack =>
                {
                    inner.set_state(SessionState::Confirmed);
                    inner.ua.emit(UaEvent::SessionConfirmed {
                        session_id: inner.id.clone(),
                    });
                    return;
                }
                Some(TransactionOutput::TransportError(_)) => {
                    inner.terminated(TerminationCause::local("Transport Error"));
                    return;
                }
                Some(_) => continue,
                None => {
                    tx_done = true;
                    continue;
                }
            },
            _ = &mut ack_deadline => {
                warn!(id = %inner.id, "no ACK for 200, hanging up");
                inner.send_bye().await;
                inner.terminated(TerminationCause::local("No ACK"));
                return;
            }
        }
    }
}

impl SessionInner {
    fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }
}
