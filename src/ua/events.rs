use super::session::{Session, TerminationCause};
use crate::message::Request;
use crate::transaction::key::TransactionKey;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Everything a user agent reports to its application.
///
/// One sealed enum instead of per-name listener maps; the application owns
/// the receiving end and matches on what it cares about.
#[derive(Debug)]
pub enum UaEvent {
    NewSession {
        session: Session,
        request: Option<Request>,
    },
    NewMessage {
        request: Request,
    },
    NewOptions {
        request: Request,
    },
    Registered {
        expires: u32,
    },
    Unregistered,
    RegistrationFailed {
        status_code: u16,
        reason_phrase: String,
    },
    NewTransaction {
        key: TransactionKey,
    },
    TransactionDestroyed {
        key: TransactionKey,
    },
    SocketConnecting {
        attempt: u32,
    },
    SocketConnected,
    SocketDisconnected {
        cause: Option<String>,
    },
    /// Out-of-dialog NOTIFY.
    SipEvent {
        request: Request,
    },
    NewSubscribe {
        request: Request,
    },
    SessionProgress {
        session_id: String,
        status_code: u16,
    },
    SessionConfirmed {
        session_id: String,
    },
    SessionTerminated {
        session_id: String,
        cause: TerminationCause,
    },
    SubscriptionNotify {
        subscription_id: String,
        request: Request,
    },
    SubscriptionTerminated {
        subscription_id: String,
    },
}

pub type UaEventReceiver = UnboundedReceiver<UaEvent>;
pub type UaEventSender = UnboundedSender<UaEvent>;
