use super::{create_test_core, request, response_of};
use crate::message::Method;
use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::transaction::Transaction;
use crate::transaction::{TransactionOutput, TransactionState};
use crate::transport::ChannelConnection;
use std::time::Duration;
use tokio::time::timeout;

const MESSAGE: &str = "MESSAGE sip:alice@example.com SIP/2.0\r\n\
    Via: SIP/2.0/WS peer.invalid;branch=z9hG4bKmsg1\r\n\
    From: <sip:bob@example.com>;tag=bobtag\r\n\
    To: <sip:alice@example.com>\r\n\
    Call-ID: msg-call-1\r\n\
    CSeq: 1 MESSAGE\r\n\
    Content-Type: text/plain\r\n\
    Content-Length: 2\r\n\r\nhi";

const INVITE: &str = "INVITE sip:alice@example.com SIP/2.0\r\n\
    Via: SIP/2.0/WS peer.invalid;branch=z9hG4bKsrv1\r\n\
    From: <sip:bob@example.com>;tag=bobtag\r\n\
    To: <sip:alice@example.com>\r\n\
    Call-ID: srv-call-1\r\n\
    CSeq: 10 INVITE\r\n\
    Contact: <sip:bob@peer.invalid;transport=ws>\r\n\
    Content-Length: 0\r\n\r\n";

const ACK: &str = "ACK sip:alice@example.com SIP/2.0\r\n\
    Via: SIP/2.0/WS peer.invalid;branch=z9hG4bKsrv1\r\n\
    From: <sip:bob@example.com>;tag=bobtag\r\n\
    To: <sip:alice@example.com>;tag=srvtag\r\n\
    Call-ID: srv-call-1\r\n\
    CSeq: 10 ACK\r\n\
    Content-Length: 0\r\n\r\n";

#[tokio::test]
async fn non_invite_server_replies_and_terminates() {
    let (core, _lifecycle) = create_test_core();
    let (ua_side, peer) = ChannelConnection::pair("WS");
    let req = request(MESSAGE);
    let key = TransactionKey::from_request(&req, TransactionRole::Server).unwrap();

    let mut tx = Transaction::new_server(key.clone(), req, core.clone(), ua_side.into());
    assert_eq!(tx.state, TransactionState::Trying);
    assert!(core.contains(&key));

    tx.reply(200, Some("srvtag")).await.expect("reply");
    let wire = peer.recv().await.expect("200 on the wire");
    let resp = response_of(&wire);
    assert_eq!(resp.status_code, 200);
    assert_eq!(resp.headers.to_tag().as_deref(), Some("srvtag"));
    assert_eq!(resp.headers.cseq().unwrap().method, Method::Message);

    // Timer J is zero on reliable transports
    assert!(timeout(Duration::from_secs(1), tx.receive())
        .await
        .expect("receive timeout")
        .is_none());
    assert_eq!(tx.state, TransactionState::Terminated);
    assert_eq!(core.len(), 0);
}

#[tokio::test]
async fn invite_server_retransmission_replays_last_response() {
    let (core, _lifecycle) = create_test_core();
    let (ua_side, peer) = ChannelConnection::pair("WS");
    let req = request(INVITE);
    let key = TransactionKey::from_request(&req, TransactionRole::Server).unwrap();

    let mut tx = Transaction::new_server(key.clone(), req.clone(), core.clone(), ua_side.into());
    assert_eq!(tx.state, TransactionState::Proceeding);

    tx.reply(180, Some("srvtag")).await.expect("reply");
    assert_eq!(response_of(&peer.recv().await.unwrap()).status_code, 180);

    // a retransmitted INVITE is absorbed by replaying the 180
    core.dispatch(&key, request(INVITE).into(), None).expect("dispatch");
    let absorb = async {
        tokio::select! {
            output = tx.receive() => panic!("retransmission must not surface: {:?}", output),
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    };
    absorb.await;
    assert_eq!(response_of(&peer.recv().await.unwrap()).status_code, 180);
}

#[tokio::test]
async fn invite_server_non_2xx_waits_for_ack() {
    let (core, _lifecycle) = create_test_core();
    let (ua_side, peer) = ChannelConnection::pair("WS");
    let req = request(INVITE);
    let key = TransactionKey::from_request(&req, TransactionRole::Server).unwrap();

    let mut tx = Transaction::new_server(key.clone(), req, core.clone(), ua_side.into());
    tx.reply(486, Some("srvtag")).await.expect("reply");
    assert_eq!(tx.state, TransactionState::Completed);
    assert_eq!(response_of(&peer.recv().await.unwrap()).status_code, 486);

    // the ACK shares the INVITE branch and lands in the same transaction
    let ack = request(ACK);
    let ack_key = TransactionKey::from_request(&ack, TransactionRole::Server).unwrap();
    assert_eq!(ack_key, key);
    core.dispatch(&ack_key, ack.into(), None).expect("dispatch");

    match timeout(Duration::from_secs(1), tx.receive()).await.unwrap() {
        Some(TransactionOutput::Message(crate::message::SipMessage::Request(req))) => {
            assert_eq!(req.method, Method::Ack);
        }
        other => panic!("expected ACK, got {:?}", other),
    }
    // Timer I is zero on reliable transports
    assert!(timeout(Duration::from_secs(1), tx.receive())
        .await
        .expect("receive timeout")
        .is_none());
    assert_eq!(tx.state, TransactionState::Terminated);
}

#[tokio::test]
async fn invite_server_2xx_moves_to_accepted() {
    let (core, _lifecycle) = create_test_core();
    let (ua_side, peer) = ChannelConnection::pair("WS");
    let req = request(INVITE);
    let key = TransactionKey::from_request(&req, TransactionRole::Server).unwrap();

    let mut tx = Transaction::new_server(key, req, core.clone(), ua_side.into());
    tx.reply(200, Some("srvtag")).await.expect("reply");
    assert_eq!(tx.state, TransactionState::Accepted);
    assert_eq!(response_of(&peer.recv().await.unwrap()).status_code, 200);

    // responding twice is an API error, not a retransmission path
    assert!(tx.reply(200, Some("srvtag")).await.is_err());
}
