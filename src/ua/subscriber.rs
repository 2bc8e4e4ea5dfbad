use super::{events::UaEvent, UserAgentInner};
use crate::dialog::dialog::Dialog;
use crate::message::{uri::Uri, Headers, Method, Request, SipMessage};
use crate::transaction::transaction::Transaction;
use crate::transaction::TransactionOutput;
use crate::{Error, Result};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Pending,
    Active,
    Terminated,
}

pub(crate) struct SubscriberInner {
    pub id: String,
    pub call_id: String,
    pub local_tag: String,
    pub event: String,
    pub expires: u32,
    pub state: Mutex<SubscriberState>,
    pub dialog: Mutex<Option<Dialog>>,
    pub ua: Arc<UserAgentInner>,
}

/// An outgoing event subscription (RFC 6665). NOTIFYs are routed in by the
/// dispatcher; refreshing and unsubscribing run over the dialog.
#[derive(Clone)]
pub struct Subscriber {
    pub(crate) inner: Arc<SubscriberInner>,
}

impl Subscriber {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> SubscriberState {
        *self.inner.state.lock().unwrap()
    }

    pub(crate) fn matches(&self, call_id: &str, tag: &str) -> bool {
        self.inner.call_id == call_id && self.inner.local_tag == tag
    }

    /// Handles an in-dialog request for this subscription; NOTIFY carries
    /// the state, anything else is refused.
    pub(crate) async fn receive_in_dialog(&self, mut tx: Transaction) {
        let request = tx.original.clone();
        if request.method != Method::Notify {
            tx.reply(405, Some(&self.inner.local_tag)).await.ok();
            return;
        }
        tx.reply(200, Some(&self.inner.local_tag)).await.ok();
        let terminated = request
            .headers
            .field("Subscription-State")
            .map(|f| match f.parsed() {
                crate::message::Parsed::SubscriptionState(s) => s.state == "terminated",
                _ => false,
            })
            .unwrap_or(false);
        self.inner.ua.emit(UaEvent::SubscriptionNotify {
            subscription_id: self.inner.id.clone(),
            request,
        });
        if terminated {
            info!(id = %self.inner.id, "subscription terminated by notifier");
            self.inner.terminate();
        }
    }

    /// Sends an in-dialog SUBSCRIBE with `Expires: 0`.
    pub fn unsubscribe(&self) {
        if self.state() == SubscriberState::Terminated {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.refresh(0).await.ok();
            inner.terminate();
        });
    }
}

impl SubscriberInner {
    fn terminate(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == SubscriberState::Terminated {
                return;
            }
            *state = SubscriberState::Terminated;
        }
        let dialog_id = self
            .dialog
            .lock()
            .unwrap()
            .as_ref()
            .map(|d| d.id.clone());
        self.ua.unlink_subscription(&self.id, dialog_id.as_ref());
        self.ua.emit(UaEvent::SubscriptionTerminated {
            subscription_id: self.id.clone(),
        });
    }

    async fn refresh(&self, expires: u32) -> Result<()> {
        let request = {
            let mut dialog = self.dialog.lock().unwrap();
            let Some(dialog) = dialog.as_mut() else {
                return Err(Error::InvalidStateError(
                    "subscription has no dialog".to_string(),
                ));
            };
            let mut request = dialog.make_request(Method::Subscribe, None, String::new());
            request.headers.push("Event", &self.event);
            request.headers.push("Expires", &expires.to_string());
            request
        };
        let mut request = request;
        self.ua.prepare_request(&mut request);
        let mut tx = self.ua.new_client_transaction(request)?;
        tx.send().await?;
        while let Some(output) = tx.receive().await {
            match output {
                TransactionOutput::Message(SipMessage::Response(resp)) => {
                    if resp.is_provisional() {
                        continue;
                    }
                    return Ok(());
                }
                _ => break,
            }
        }
        Ok(())
    }
}

/// Creates the subscription and spawns the initial SUBSCRIBE exchange.
pub(crate) fn start_subscribe(
    ua: Arc<UserAgentInner>,
    target: Uri,
    event: &str,
    expires: u32,
) -> Subscriber {
    let local_tag = crate::transaction::make_tag();
    let call_id = crate::transaction::make_call_id(&ua.via_host);
    let inner = Arc::new(SubscriberInner {
        id: format!("{}{}", call_id, local_tag),
        call_id,
        local_tag,
        event: event.to_string(),
        expires,
        state: Mutex::new(SubscriberState::Pending),
        dialog: Mutex::new(None),
        ua,
    });
    let subscriber = Subscriber {
        inner: inner.clone(),
    };
    tokio::spawn(run_subscribe(inner, target));
    subscriber
}

async fn run_subscribe(inner: Arc<SubscriberInner>, target: Uri) {
    let mut headers = Headers::new();
    headers.push("From", &inner.ua.local_identity(&inner.local_tag));
    headers.push("To", &format!("<{}>", target));
    headers.push("Call-ID", &inner.call_id);
    headers.push("CSeq", &format!("1 {}", Method::Subscribe));
    headers.push("Contact", &inner.ua.contact_value());
    headers.push("Event", &inner.event);
    headers.push("Expires", &inner.expires.to_string());
    let mut request = Request {
        method: Method::Subscribe,
        uri: target,
        headers,
        body: String::new(),
    };
    inner.ua.prepare_request(&mut request);

    let mut tx = match inner.ua.new_client_transaction(request.clone()) {
        Ok(tx) => tx,
        Err(e) => {
            warn!(id = %inner.id, "cannot create SUBSCRIBE transaction: {}", e);
            inner.terminate();
            return;
        }
    };
    if tx.send().await.is_err() {
        inner.terminate();
        return;
    }
    while let Some(output) = tx.receive().await {
        match output {
            TransactionOutput::Message(SipMessage::Response(resp)) => {
                if resp.is_provisional() {
                    continue;
                }
                if resp.is_success() {
                    match Dialog::new_uac(&request, &resp) {
                        Ok(dialog) => {
                            *inner.state.lock().unwrap() = SubscriberState::Active;
                            inner.ua.link_subscription_dialog(&dialog.id, &inner.id);
                            inner.dialog.lock().unwrap().replace(dialog);
                            info!(id = %inner.id, event = %inner.event, "subscription active");
                        }
                        Err(e) => {
                            debug!(id = %inner.id, "2xx without usable dialog: {}", e);
                            inner.terminate();
                        }
                    }
                } else {
                    debug!(id = %inner.id, status = resp.status_code, "subscribe rejected");
                    inner.terminate();
                }
                return;
            }
            TransactionOutput::Message(_) => {}
            TransactionOutput::Timeout | TransactionOutput::TransportError(_) => {
                inner.terminate();
                return;
            }
        }
    }
    if *inner.state.lock().unwrap() == SubscriberState::Pending {
        inner.terminate();
    }
}
