use super::key::{TransactionKey, TransactionRole};
use super::timer::Timer;
use super::{
    make_response, TransactionEvent, TransactionEventReceiver, TransactionEventSender,
    TransactionLifecycle, TransactionOutput, TransactionState, TransactionTimer, TransactionType,
    T1, T1X64, T2, T4, TIMER_D_UNRELIABLE, TIMER_INTERVAL,
};
use crate::message::{Method, Request, Response, SipMessage};
use crate::transport::SipConnection;
use crate::{Error, Result};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// Shared transaction-layer state owned by the user agent.
///
/// Holds the timer wheel and the live map from transaction key to the
/// channel feeding that transaction. A transaction is in the map from
/// attach until its terminal state; the destroy notification fires only
/// after removal.
pub(crate) struct TransactionCore {
    pub timers: Timer<TransactionTimer>,
    transactions: Mutex<HashMap<TransactionKey, TransactionEventSender>>,
    lifecycle: UnboundedSender<TransactionLifecycle>,
    cancel_token: CancellationToken,
    timer_interval: Duration,
}

pub(crate) type TransactionCoreRef = Arc<TransactionCore>;

impl TransactionCore {
    pub fn new(
        lifecycle: UnboundedSender<TransactionLifecycle>,
        cancel_token: CancellationToken,
        timer_interval: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new(TransactionCore {
            timers: Timer::new(),
            transactions: Mutex::new(HashMap::new()),
            lifecycle,
            cancel_token,
            timer_interval: timer_interval.unwrap_or(TIMER_INTERVAL),
        })
    }

    /// Timer pump; runs until the owning user agent is cancelled.
    pub async fn process_timer(&self) {
        while !self.cancel_token.is_cancelled() {
            for timer in self.timers.poll(Instant::now()) {
                let sender = self
                    .transactions
                    .lock()
                    .unwrap()
                    .get(timer.key())
                    .cloned();
                if let Some(sender) = sender {
                    // a dropped receiver means the TU went away early
                    sender.send(TransactionEvent::Timer(timer)).ok();
                }
            }
            tokio::time::sleep(self.timer_interval).await;
        }
    }

    /// Routes an incoming message to its transaction. Returns the message
    /// back when no transaction matches.
    pub fn dispatch(
        &self,
        key: &TransactionKey,
        msg: SipMessage,
        connection: Option<SipConnection>,
    ) -> std::result::Result<(), SipMessage> {
        let sender = self.transactions.lock().unwrap().get(key).cloned();
        match sender {
            Some(sender) => match sender.send(TransactionEvent::Received(msg, connection)) {
                Ok(()) => Ok(()),
                Err(e) => match e.0 {
                    TransactionEvent::Received(msg, _) => Err(msg),
                    _ => unreachable!(),
                },
            },
            None => Err(msg),
        }
    }

    /// Aborts every in-flight transaction with a transport-error cause.
    pub fn abort_all(&self, reason: &str) {
        let senders: Vec<TransactionEventSender> =
            self.transactions.lock().unwrap().values().cloned().collect();
        for sender in senders {
            sender
                .send(TransactionEvent::TransportError(reason.to_string()))
                .ok();
        }
    }

    pub fn len(&self) -> usize {
        self.transactions.lock().unwrap().len()
    }

    pub fn contains(&self, key: &TransactionKey) -> bool {
        self.transactions.lock().unwrap().contains_key(key)
    }

    fn attach(&self, key: &TransactionKey, sender: TransactionEventSender) {
        self.transactions
            .lock()
            .unwrap()
            .insert(key.clone(), sender);
        self.lifecycle
            .send(TransactionLifecycle::Created(key.clone()))
            .ok();
    }

    fn detach(&self, key: &TransactionKey) {
        let removed = self.transactions.lock().unwrap().remove(key);
        if removed.is_some() {
            self.lifecycle
                .send(TransactionLifecycle::Destroyed(key.clone()))
                .ok();
        }
    }
}

/// One RFC 3261 §17 transaction, driven by its TU through `send`/`respond`
/// and observed through `receive`.
pub struct Transaction {
    pub transaction_type: TransactionType,
    pub key: TransactionKey,
    pub original: Request,
    pub state: TransactionState,
    pub connection: SipConnection,
    pub last_response: Option<Response>,
    pub(crate) core: TransactionCoreRef,
    last_ack: Option<Request>,
    tu_receiver: TransactionEventReceiver,
    tu_sender: TransactionEventSender,
    retransmit_timer: Option<u64>,
    timeout_timer: Option<u64>,
    wait_timer: Option<u64>,
    attached: bool,
}

impl Transaction {
    fn new(
        transaction_type: TransactionType,
        key: TransactionKey,
        original: Request,
        connection: SipConnection,
        core: TransactionCoreRef,
    ) -> Self {
        let (tu_sender, tu_receiver) = unbounded_channel();
        Transaction {
            transaction_type,
            key,
            original,
            state: TransactionState::Idle,
            connection,
            last_response: None,
            core,
            last_ack: None,
            tu_receiver,
            tu_sender,
            retransmit_timer: None,
            timeout_timer: None,
            wait_timer: None,
            attached: false,
        }
    }

    pub(crate) fn new_client(
        key: TransactionKey,
        original: Request,
        core: TransactionCoreRef,
        connection: SipConnection,
    ) -> Self {
        let tx_type = match original.method {
            Method::Invite => TransactionType::InviteClient,
            _ => TransactionType::NonInviteClient,
        };
        Transaction::new(tx_type, key, original, connection, core)
    }

    pub(crate) fn new_server(
        key: TransactionKey,
        original: Request,
        core: TransactionCoreRef,
        connection: SipConnection,
    ) -> Self {
        let tx_type = match original.method {
            Method::Invite => TransactionType::InviteServer,
            _ => TransactionType::NonInviteServer,
        };
        let mut tx = Transaction::new(tx_type, key, original, connection, core);
        tx.core.attach(&tx.key, tx.tu_sender.clone());
        tx.attached = true;
        tx.state = match tx_type {
            TransactionType::InviteServer => TransactionState::Proceeding,
            _ => TransactionState::Trying,
        };
        tx
    }

    /// Sends the client request and starts the machine.
    pub async fn send(&mut self) -> Result<()> {
        if !self.transaction_type.is_client() {
            return Err(Error::TransactionError(
                "send is only valid for client transactions".to_string(),
                self.key.clone(),
            ));
        }
        self.core.attach(&self.key, self.tu_sender.clone());
        self.attached = true;
        if let Err(e) = self.connection.send(&self.original.to_string()).await {
            self.post_transport_error(&e);
            return Err(e);
        }
        match self.transaction_type {
            TransactionType::InviteClient => self.transition(TransactionState::Calling),
            _ => self.transition(TransactionState::Trying),
        }
        Ok(())
    }

    /// Sends a server response and advances the machine.
    pub async fn respond(&mut self, response: Response) -> Result<()> {
        if self.transaction_type.is_client() {
            return Err(Error::TransactionError(
                "respond is only valid for server transactions".to_string(),
                self.key.clone(),
            ));
        }
        if matches!(
            self.state,
            TransactionState::Completed
                | TransactionState::Accepted
                | TransactionState::Confirmed
                | TransactionState::Terminated
        ) {
            return Err(Error::InvalidStateError(format!(
                "cannot respond in {} state",
                self.state
            )));
        }
        if let Err(e) = self.connection.send(&response.to_string()).await {
            self.post_transport_error(&e);
            return Err(e);
        }
        let status = response.status_code;
        self.last_response.replace(response);
        if status < 200 {
            self.transition(TransactionState::Proceeding);
        } else if status < 300 {
            match self.transaction_type {
                // 2xx retransmission is the TU's responsibility (RFC 6026)
                TransactionType::InviteServer => self.transition(TransactionState::Accepted),
                _ => self.transition(TransactionState::Completed),
            }
        } else {
            self.transition(TransactionState::Completed);
        }
        Ok(())
    }

    /// Builds and sends a response with the default reason phrase.
    pub async fn reply(&mut self, status_code: u16, to_tag: Option<&str>) -> Result<()> {
        let response = make_response(&self.original, status_code, to_tag);
        self.respond(response).await
    }

    /// Waits for the next TU-visible output. `None` means the transaction
    /// reached its terminal state.
    pub async fn receive(&mut self) -> Option<TransactionOutput> {
        while let Some(event) = self.tu_receiver.recv().await {
            match event {
                TransactionEvent::Received(msg, connection) => {
                    if let Some(connection) = connection {
                        self.connection = connection;
                    }
                    let output = match msg {
                        SipMessage::Request(req) => self.on_received_request(req).await,
                        SipMessage::Response(resp) => self.on_received_response(resp).await,
                    };
                    if output.is_some() {
                        return output;
                    }
                }
                TransactionEvent::Timer(timer) => {
                    if let Some(output) = self.on_timer(timer).await {
                        return Some(output);
                    }
                }
                TransactionEvent::TransportError(reason) => {
                    self.transition(TransactionState::Terminated);
                    return Some(TransactionOutput::TransportError(reason));
                }
                TransactionEvent::Terminate => return None,
            }
        }
        None
    }

    async fn on_received_response(&mut self, resp: Response) -> Option<TransactionOutput> {
        if !self.transaction_type.is_client() {
            return None;
        }
        let invite = self.transaction_type.is_invite();
        match self.state {
            TransactionState::Calling | TransactionState::Trying | TransactionState::Proceeding => {
                if resp.is_provisional() {
                    self.transition(TransactionState::Proceeding);
                    return Some(TransactionOutput::Message(resp.into()));
                }
                if resp.is_success() {
                    if invite {
                        // ACK for 2xx belongs to the dialog layer
                        self.transition(TransactionState::Accepted);
                    } else {
                        self.transition(TransactionState::Completed);
                    }
                    return Some(TransactionOutput::Message(resp.into()));
                }
                if invite {
                    self.ack_non_2xx(&resp).await;
                    self.transition(TransactionState::Completed);
                } else {
                    self.transition(TransactionState::Completed);
                }
                Some(TransactionOutput::Message(resp.into()))
            }
            TransactionState::Accepted => {
                // 2xx retransmission; the TU re-sends its ACK
                if resp.is_success() {
                    return Some(TransactionOutput::Message(resp.into()));
                }
                None
            }
            TransactionState::Completed => {
                // final-response retransmission: replay ACK, absorb
                if invite {
                    if let Some(ack) = self.last_ack.clone() {
                        self.connection.send(&ack.to_string()).await.ok();
                    }
                }
                None
            }
            _ => None,
        }
    }

    async fn on_received_request(&mut self, req: Request) -> Option<TransactionOutput> {
        if self.transaction_type.is_client() {
            return None;
        }
        match self.state {
            TransactionState::Trying | TransactionState::Proceeding => {
                if req.method == self.original.method {
                    // request retransmission: replay the latest response
                    if let Some(last) = self.last_response.clone() {
                        self.connection.send(&last.to_string()).await.ok();
                    }
                    return None;
                }
                None
            }
            TransactionState::Completed => {
                if req.method == Method::Ack {
                    self.transition(TransactionState::Confirmed);
                    return Some(TransactionOutput::Message(req.into()));
                }
                if req.method == self.original.method {
                    if let Some(last) = self.last_response.clone() {
                        self.connection.send(&last.to_string()).await.ok();
                    }
                }
                None
            }
            TransactionState::Accepted => {
                // ACK for 2xx reaching the transaction is handed upward
                if req.method == Method::Ack {
                    return Some(TransactionOutput::Message(req.into()));
                }
                None
            }
            _ => None,
        }
    }

    async fn on_timer(&mut self, timer: TransactionTimer) -> Option<TransactionOutput> {
        match timer {
            TransactionTimer::TimerA(key, interval) => {
                if self.state == TransactionState::Calling {
                    self.connection.send(&self.original.to_string()).await.ok();
                    let interval = interval * 2;
                    self.retransmit_timer.replace(
                        self.core
                            .timers
                            .timeout(interval, TransactionTimer::TimerA(key, interval)),
                    );
                }
                None
            }
            TransactionTimer::TimerE(key, interval) => {
                if matches!(
                    self.state,
                    TransactionState::Trying | TransactionState::Proceeding
                ) {
                    self.connection.send(&self.original.to_string()).await.ok();
                    let interval = (interval * 2).min(T2);
                    self.retransmit_timer.replace(
                        self.core
                            .timers
                            .timeout(interval, TransactionTimer::TimerE(key, interval)),
                    );
                }
                None
            }
            TransactionTimer::TimerG(key, interval) => {
                if self.state == TransactionState::Completed {
                    if let Some(last) = self.last_response.clone() {
                        self.connection.send(&last.to_string()).await.ok();
                    }
                    let interval = (interval * 2).min(T2);
                    self.retransmit_timer.replace(
                        self.core
                            .timers
                            .timeout(interval, TransactionTimer::TimerG(key, interval)),
                    );
                }
                None
            }
            TransactionTimer::TimerB(_) | TransactionTimer::TimerF(_) => {
                if matches!(
                    self.state,
                    TransactionState::Calling
                        | TransactionState::Trying
                        | TransactionState::Proceeding
                ) {
                    warn!(key = %self.key, "transaction timed out");
                    self.transition(TransactionState::Terminated);
                    return Some(TransactionOutput::Timeout);
                }
                None
            }
            TransactionTimer::TimerH(_) => {
                if self.state == TransactionState::Completed {
                    // no ACK ever arrived
                    warn!(key = %self.key, "timed out waiting for ACK");
                    self.transition(TransactionState::Terminated);
                    return Some(TransactionOutput::Timeout);
                }
                None
            }
            TransactionTimer::TimerD(_)
            | TransactionTimer::TimerI(_)
            | TransactionTimer::TimerJ(_)
            | TransactionTimer::TimerK(_)
            | TransactionTimer::TimerL(_)
            | TransactionTimer::TimerM(_) => {
                self.transition(TransactionState::Terminated);
                None
            }
        }
    }

    /// Transaction-level ACK for a non-2xx final response (RFC 3261
    /// §17.1.1.3): same branch and From, To taken from the response.
    async fn ack_non_2xx(&mut self, resp: &Response) {
        let mut ack = Request {
            method: Method::Ack,
            uri: self.original.uri.clone(),
            headers: crate::message::Headers::new(),
            body: String::new(),
        };
        if let Some(via) = self.original.headers.get("Via") {
            ack.headers.push("Via", via);
        }
        if let Some(from) = self.original.headers.get("From") {
            ack.headers.push("From", from);
        }
        if let Some(to) = resp.headers.get("To") {
            ack.headers.push("To", to);
        }
        if let Some(call_id) = self.original.headers.get("Call-ID") {
            ack.headers.push("Call-ID", call_id);
        }
        if let Some(cseq) = self.original.headers.cseq() {
            ack.headers
                .push("CSeq", &format!("{} {}", cseq.seq, Method::Ack));
        }
        for route in self.original.headers.get_all("Route") {
            ack.headers.push("Route", route);
        }
        ack.headers.push("Max-Forwards", "70");
        self.connection.send(&ack.to_string()).await.ok();
        self.last_ack.replace(ack);
    }

    fn post_transport_error(&mut self, error: &Error) {
        self.tu_sender
            .send(TransactionEvent::TransportError(error.to_string()))
            .ok();
    }

    fn transition(&mut self, state: TransactionState) {
        if self.state == state {
            return;
        }
        let reliable = self.connection.is_reliable();
        match state {
            TransactionState::Idle => {}
            TransactionState::Calling => {
                if !reliable {
                    self.restart_retransmit(TransactionTimer::TimerA(self.key.clone(), T1), T1);
                }
                self.restart_timeout(TransactionTimer::TimerB(self.key.clone()));
            }
            TransactionState::Trying => {
                if !reliable {
                    self.restart_retransmit(TransactionTimer::TimerE(self.key.clone(), T1), T1);
                }
                self.restart_timeout(TransactionTimer::TimerF(self.key.clone()));
            }
            TransactionState::Proceeding => {
                if self.transaction_type == TransactionType::InviteClient {
                    self.cancel_retransmit();
                }
            }
            TransactionState::Completed => {
                self.cancel_retransmit();
                match self.transaction_type {
                    TransactionType::InviteClient => {
                        self.cancel_timeout();
                        let wait = if reliable {
                            Duration::ZERO
                        } else {
                            TIMER_D_UNRELIABLE
                        };
                        self.start_wait(wait, TransactionTimer::TimerD(self.key.clone()));
                    }
                    TransactionType::NonInviteClient => {
                        self.cancel_timeout();
                        let wait = if reliable { Duration::ZERO } else { T4 };
                        self.start_wait(wait, TransactionTimer::TimerK(self.key.clone()));
                    }
                    TransactionType::InviteServer => {
                        if !reliable {
                            self.restart_retransmit(
                                TransactionTimer::TimerG(self.key.clone(), T1),
                                T1,
                            );
                        }
                        self.restart_timeout(TransactionTimer::TimerH(self.key.clone()));
                    }
                    TransactionType::NonInviteServer => {
                        let wait = if reliable { Duration::ZERO } else { T1X64 };
                        self.start_wait(wait, TransactionTimer::TimerJ(self.key.clone()));
                    }
                }
            }
            TransactionState::Accepted => {
                self.cancel_retransmit();
                self.cancel_timeout();
                let timer = match self.transaction_type {
                    TransactionType::InviteServer => TransactionTimer::TimerL(self.key.clone()),
                    _ => TransactionTimer::TimerM(self.key.clone()),
                };
                self.start_wait(T1X64, timer);
            }
            TransactionState::Confirmed => {
                self.cancel_retransmit();
                self.cancel_timeout();
                let wait = if reliable { Duration::ZERO } else { T4 };
                self.start_wait(wait, TransactionTimer::TimerI(self.key.clone()));
            }
            TransactionState::Terminated => {
                self.cleanup();
                self.tu_sender.send(TransactionEvent::Terminate).ok();
            }
        }
        trace!(key = %self.key, "transition: {} -> {}", self.state, state);
        self.state = state;
    }

    fn restart_retransmit(&mut self, timer: TransactionTimer, interval: Duration) {
        self.cancel_retransmit();
        self.retransmit_timer
            .replace(self.core.timers.timeout(interval, timer));
    }

    fn restart_timeout(&mut self, timer: TransactionTimer) {
        self.cancel_timeout();
        self.timeout_timer
            .replace(self.core.timers.timeout(T1X64, timer));
    }

    fn start_wait(&mut self, duration: Duration, timer: TransactionTimer) {
        if let Some(id) = self.wait_timer.take() {
            self.core.timers.cancel(id);
        }
        self.wait_timer
            .replace(self.core.timers.timeout(duration, timer));
    }

    fn cancel_retransmit(&mut self) {
        if let Some(id) = self.retransmit_timer.take() {
            self.core.timers.cancel(id);
        }
    }

    fn cancel_timeout(&mut self) {
        if let Some(id) = self.timeout_timer.take() {
            self.core.timers.cancel(id);
        }
    }

    fn cleanup(&mut self) {
        self.cancel_retransmit();
        self.cancel_timeout();
        if let Some(id) = self.wait_timer.take() {
            self.core.timers.cancel(id);
        }
        if self.attached {
            self.attached = false;
            self.core.detach(&self.key);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl std::fmt::Display for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} [{}]", self.transaction_type, self.key, self.state)
    }
}

/// Builds a CANCEL for an in-flight INVITE client transaction
/// (RFC 3261 §9.1): same Request-URI, branch, From, To, Call-ID and CSeq
/// number, method CANCEL.
pub fn make_cancel(invite: &Request) -> Request {
    let mut headers = crate::message::Headers::new();
    if let Some(via) = invite.headers.get("Via") {
        headers.push("Via", via);
    }
    if let Some(from) = invite.headers.get("From") {
        headers.push("From", from);
    }
    if let Some(to) = invite.headers.get("To") {
        headers.push("To", to);
    }
    if let Some(call_id) = invite.headers.get("Call-ID") {
        headers.push("Call-ID", call_id);
    }
    if let Some(cseq) = invite.headers.cseq() {
        headers.push("CSeq", &format!("{} {}", cseq.seq, Method::Cancel));
    }
    for route in invite.headers.get_all("Route") {
        headers.push("Route", route);
    }
    headers.push("Max-Forwards", "70");
    Request {
        method: Method::Cancel,
        uri: invite.uri.clone(),
        headers,
        body: String::new(),
    }
}

pub(crate) fn client_key(request: &Request) -> Result<TransactionKey> {
    TransactionKey::from_request(request, TransactionRole::Client)
}

pub(crate) fn server_key(request: &Request) -> Result<TransactionKey> {
    TransactionKey::from_request(request, TransactionRole::Server)
}
