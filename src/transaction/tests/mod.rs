use super::transaction::{TransactionCore, TransactionCoreRef};
use super::TransactionLifecycle;
use crate::message::{parser, Request, Response, SipMessage};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

mod test_server;

pub(super) fn create_test_core() -> (TransactionCoreRef, UnboundedReceiver<TransactionLifecycle>) {
    let (lifecycle_tx, lifecycle_rx) = unbounded_channel();
    let core = TransactionCore::new(
        lifecycle_tx,
        CancellationToken::new(),
        Some(Duration::from_millis(5)),
    );
    let pump = core.clone();
    tokio::spawn(async move { pump.process_timer().await });
    (core, lifecycle_rx)
}

pub(super) fn request(raw: &str) -> Request {
    match parser::parse(raw).expect("parse request") {
        SipMessage::Request(req) => req,
        _ => panic!("expected a request"),
    }
}

pub(super) fn response_of(frame: &str) -> Response {
    match parser::parse(frame).expect("parse response") {
        SipMessage::Response(resp) => resp,
        _ => panic!("expected a response"),
    }
}
