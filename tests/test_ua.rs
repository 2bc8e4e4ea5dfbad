use sipua::message::{parser, Method, Request, SipMessage};
use sipua::transaction::make_response;
use sipua::transport::ChannelConnection;
use sipua::ua::events::UaEvent;
use sipua::ua::UAStatus;
use sipua::{UAConfig, UserAgent};
use std::time::Duration;
use tokio::time::timeout;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .ok();
}

struct Peer {
    conn: ChannelConnection,
}

impl Peer {
    async fn recv_message(&self) -> SipMessage {
        loop {
            let frame = timeout(Duration::from_secs(5), self.conn.recv())
                .await
                .expect("peer recv timeout")
                .expect("peer channel closed");
            if frame.trim().is_empty() {
                continue;
            }
            return parser::parse(&frame).expect("peer got unparseable frame");
        }
    }

    async fn recv_request(&self) -> Request {
        match self.recv_message().await {
            SipMessage::Request(req) => req,
            SipMessage::Response(resp) => panic!("expected request, got {}", resp.status_code),
        }
    }

    async fn recv_response(&self) -> sipua::message::Response {
        match self.recv_message().await {
            SipMessage::Response(resp) => resp,
            SipMessage::Request(req) => panic!("expected response, got {}", req.method),
        }
    }

    async fn reply(
        &self,
        request: &Request,
        status_code: u16,
        to_tag: Option<&str>,
        extra: &[(&str, &str)],
        body: &str,
    ) {
        let mut response = make_response(request, status_code, to_tag);
        for (name, value) in extra {
            response.headers.push(name, value);
        }
        response.body = body.to_string();
        self.conn
            .send(&response.to_string())
            .await
            .expect("peer send");
    }

    async fn send_frame(&self, frame: &str) {
        self.conn.send(frame).await.expect("peer send");
    }

    async fn expect_silence(&self, for_ms: u64) {
        assert!(
            timeout(Duration::from_millis(for_ms), self.conn.recv())
                .await
                .is_err(),
            "peer expected silence"
        );
    }
}

fn make_ua(configure: impl FnOnce(&mut UAConfig)) -> (UserAgent, Peer) {
    let (ua_side, peer_side) = ChannelConnection::pair("WS");
    let mut config = UAConfig::new("sip:alice@example.com", vec![ua_side.into()]).unwrap();
    configure(&mut config);
    let ua = UserAgent::builder().config(config).build().unwrap();
    (ua, Peer { conn: peer_side })
}

async fn expect_event(
    ua: &mut UserAgent,
    what: &str,
    mut pred: impl FnMut(&UaEvent) -> bool,
) -> UaEvent {
    loop {
        let event = timeout(Duration::from_secs(5), ua.recv_event())
            .await
            .unwrap_or_else(|_| panic!("timeout waiting for {}", what))
            .expect("event stream closed");
        if pred(&event) {
            return event;
        }
    }
}

async fn wait_connected(ua: &mut UserAgent) {
    expect_event(ua, "SocketConnected", |e| {
        matches!(e, UaEvent::SocketConnected)
    })
    .await;
}

// scenario: REGISTER challenged with 401, retried with credentials,
// accepted; stop() unregisters and empties the transaction map
#[tokio::test]
async fn register_with_digest_challenge() {
    init_tracing();
    let (mut ua, peer) = make_ua(|config| {
        config.register = true;
        config.password = Some("secret".to_string());
    });
    ua.start();
    wait_connected(&mut ua).await;

    let first = peer.recv_request().await;
    assert_eq!(first.method, Method::Register);
    assert!(first.headers.get("Authorization").is_none());
    peer.reply(
        &first,
        401,
        Some("regtag"),
        &[(
            "WWW-Authenticate",
            "Digest realm=\"example.com\", nonce=\"abc\", qop=\"auth\"",
        )],
        "",
    )
    .await;

    let second = peer.recv_request().await;
    assert_eq!(second.method, Method::Register);
    let authorization = second
        .headers
        .get("Authorization")
        .expect("authorization on retry");
    assert!(authorization.contains("username=\"alice\""));
    assert!(authorization.contains("nonce=\"abc\""));
    assert!(authorization.contains("response=\""));
    assert!(
        second.headers.cseq().unwrap().seq > first.headers.cseq().unwrap().seq,
        "retry must advance CSeq"
    );
    peer.reply(&second, 200, Some("regtag"), &[("Expires", "60")], "")
        .await;

    expect_event(&mut ua, "Registered", |e| {
        matches!(e, UaEvent::Registered { expires: 60 })
    })
    .await;
    assert!(ua.is_registered());

    // stop(): one unregister with Expires: 0, then a clean shutdown
    let unregister_peer = tokio::spawn(async move {
        let req = peer.recv_request().await;
        assert_eq!(req.method, Method::Register);
        assert_eq!(req.headers.get("Expires"), Some("0"));
        peer.reply(&req, 200, Some("regtag"), &[], "").await;
        peer
    });
    ua.stop().await;
    unregister_peer.await.expect("peer task");

    expect_event(&mut ua, "Unregistered", |e| {
        matches!(e, UaEvent::Unregistered)
    })
    .await;
    assert_eq!(ua.status(), UAStatus::UserClosed);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ua.active_transactions(), 0);
}

// scenario: outbound INVITE, 100/180/200, exactly one ACK with the
// INVITE's CSeq and the 200's to-tag; dialog confirmed
#[tokio::test]
async fn invite_200_ack() {
    init_tracing();
    let (mut ua, peer) = make_ua(|_| {});
    ua.start();
    wait_connected(&mut ua).await;

    let session = ua
        .call("sip:bob@example.com", Some("v=0".to_string()))
        .expect("call");

    let invite = peer.recv_request().await;
    assert_eq!(invite.method, Method::Invite);
    assert_eq!(invite.body, "v=0");
    let invite_cseq = invite.headers.cseq().unwrap().seq;

    peer.reply(&invite, 100, None, &[], "").await;
    peer.reply(&invite, 180, Some("bobtag"), &[], "").await;
    expect_event(&mut ua, "SessionProgress", |e| {
        matches!(e, UaEvent::SessionProgress { status_code: 180, .. })
    })
    .await;

    peer.reply(
        &invite,
        200,
        Some("bobtag"),
        &[("Contact", "<sip:bob@192.0.2.9;transport=ws>")],
        "v=0",
    )
    .await;

    let ack = peer.recv_request().await;
    assert_eq!(ack.method, Method::Ack);
    let ack_cseq = ack.headers.cseq().unwrap();
    assert_eq!(ack_cseq.seq, invite_cseq);
    assert_eq!(ack_cseq.method, Method::Ack);
    assert_eq!(ack.headers.to_tag().as_deref(), Some("bobtag"));
    assert_eq!(ack.uri.host, "192.0.2.9");

    expect_event(&mut ua, "SessionConfirmed", |e| {
        matches!(e, UaEvent::SessionConfirmed { .. })
    })
    .await;
    assert!(session.is_established());

    // exactly one ACK
    peer.expect_silence(150).await;
}

// scenario: 486 Busy Here is ACKed by the transaction and the session
// ends with the peer's status code
#[tokio::test]
async fn invite_486_ack() {
    init_tracing();
    let (mut ua, peer) = make_ua(|_| {});
    ua.start();
    wait_connected(&mut ua).await;

    let session = ua.call("sip:bob@example.com", None).expect("call");

    let invite = peer.recv_request().await;
    peer.reply(&invite, 100, None, &[], "").await;
    peer.reply(&invite, 486, Some("bobtag"), &[], "").await;

    let ack = peer.recv_request().await;
    assert_eq!(ack.method, Method::Ack);
    assert_eq!(
        ack.headers.branch(),
        invite.headers.branch(),
        "non-2xx ACK stays in the INVITE transaction"
    );

    let event = expect_event(&mut ua, "SessionTerminated", |e| {
        matches!(e, UaEvent::SessionTerminated { .. })
    })
    .await;
    match event {
        UaEvent::SessionTerminated { cause, .. } => {
            assert_eq!(cause.status_code, 486);
            assert_eq!(cause.cause, "Busy");
        }
        _ => unreachable!(),
    }
    assert!(session.is_ended());
}

// scenario: CANCEL before the final response; 200 for the CANCEL, 487
// for the INVITE, session ends Canceled
#[tokio::test]
async fn incoming_cancel_before_answer() {
    init_tracing();
    let (mut ua, peer) = make_ua(|_| {});
    ua.start();
    wait_connected(&mut ua).await;

    peer.send_frame(
        "INVITE sip:alice@example.com SIP/2.0\r\n\
         Via: SIP/2.0/WS peer.invalid;branch=z9hG4bKcan1\r\n\
         From: <sip:bob@example.com>;tag=bobtag\r\n\
         To: <sip:alice@example.com>\r\n\
         Call-ID: cancel-call-1\r\n\
         CSeq: 1 INVITE\r\n\
         Contact: <sip:bob@peer.invalid;transport=ws>\r\n\
         Content-Length: 0\r\n\r\n",
    )
    .await;

    expect_event(&mut ua, "NewSession", |e| {
        matches!(e, UaEvent::NewSession { .. })
    })
    .await;
    assert_eq!(peer.recv_response().await.status_code, 100);

    peer.send_frame(
        "CANCEL sip:alice@example.com SIP/2.0\r\n\
         Via: SIP/2.0/WS peer.invalid;branch=z9hG4bKcan1\r\n\
         From: <sip:bob@example.com>;tag=bobtag\r\n\
         To: <sip:alice@example.com>\r\n\
         Call-ID: cancel-call-1\r\n\
         CSeq: 1 CANCEL\r\n\
         Content-Length: 0\r\n\r\n",
    )
    .await;

    let cancel_ok = peer.recv_response().await;
    assert_eq!(cancel_ok.status_code, 200);
    assert_eq!(cancel_ok.headers.cseq().unwrap().method, Method::Cancel);

    let invite_487 = peer.recv_response().await;
    assert_eq!(invite_487.status_code, 487);
    assert_eq!(invite_487.headers.cseq().unwrap().method, Method::Invite);

    let to_tag = invite_487.headers.to_tag().expect("487 carries a to-tag");
    peer.send_frame(&format!(
        "ACK sip:alice@example.com SIP/2.0\r\n\
         Via: SIP/2.0/WS peer.invalid;branch=z9hG4bKcan1\r\n\
         From: <sip:bob@example.com>;tag=bobtag\r\n\
         To: <sip:alice@example.com>;tag={}\r\n\
         Call-ID: cancel-call-1\r\n\
         CSeq: 1 ACK\r\n\
         Content-Length: 0\r\n\r\n",
        to_tag
    ))
    .await;

    let event = expect_event(&mut ua, "SessionTerminated", |e| {
        matches!(e, UaEvent::SessionTerminated { .. })
    })
    .await;
    match event {
        UaEvent::SessionTerminated { cause, .. } => {
            assert_eq!(cause.cause, "Canceled");
            assert_eq!(cause.status_code, 487);
        }
        _ => unreachable!(),
    }
}

// scenario: re-INVITEs cross on the wire; the side with its own INVITE
// outstanding answers the peer's with 491
#[tokio::test]
async fn reinvite_collision_yields_491() {
    init_tracing();
    let (mut ua, peer) = make_ua(|_| {});
    ua.start();
    wait_connected(&mut ua).await;

    let session = ua
        .call("sip:bob@example.com", Some("v=0".to_string()))
        .expect("call");

    let invite = peer.recv_request().await;
    let our_contact = invite.headers.contact().expect("INVITE carries Contact");
    let our_tag = invite.headers.from_tag().unwrap();
    let call_id = invite.headers.call_id().unwrap().to_string();
    peer.reply(
        &invite,
        200,
        Some("bobtag"),
        &[("Contact", "<sip:bob@192.0.2.9;transport=ws>")],
        "v=0",
    )
    .await;
    let ack = peer.recv_request().await;
    assert_eq!(ack.method, Method::Ack);
    expect_event(&mut ua, "SessionConfirmed", |e| {
        matches!(e, UaEvent::SessionConfirmed { .. })
    })
    .await;

    // our re-INVITE goes out...
    session.renegotiate(Some("v=1".to_string())).expect("renegotiate");
    let reinvite = peer.recv_request().await;
    assert_eq!(reinvite.method, Method::Invite);
    assert_eq!(reinvite.headers.to_tag().as_deref(), Some("bobtag"));

    // ...and the peer's own re-INVITE crosses it on the wire
    peer.send_frame(&format!(
        "INVITE {} SIP/2.0\r\n\
         Via: SIP/2.0/WS peer.invalid;branch=z9hG4bKglare\r\n\
         From: <sip:bob@example.com>;tag=bobtag\r\n\
         To: <sip:alice@example.com>;tag={}\r\n\
         Call-ID: {}\r\n\
         CSeq: 1000 INVITE\r\n\
         Contact: <sip:bob@192.0.2.9;transport=ws>\r\n\
         Content-Length: 0\r\n\r\n",
        our_contact.uri, our_tag, call_id
    ))
    .await;

    let glare = peer.recv_response().await;
    assert_eq!(glare.status_code, 491);
    assert_eq!(glare.headers.cseq().unwrap().seq, 1000);

    // let our re-INVITE finish; its 491 is ACKed by the transaction
    peer.reply(&reinvite, 491, Some("bobtag"), &[], "").await;
    let ack = peer.recv_request().await;
    assert_eq!(ack.method, Method::Ack);
    assert_eq!(ack.headers.branch(), reinvite.headers.branch());
    assert!(session.is_established());
}

// scenario: socket drops between 180 and 200; the transaction aborts
// with a transport error and the recovered socket carries a fresh
// REGISTER but no replayed INVITE
#[tokio::test]
async fn transport_drop_during_invite() {
    init_tracing();
    let (socket0_ua, socket0_peer) = ChannelConnection::pair("WS");
    let (socket1_ua, socket1_peer) = ChannelConnection::pair("WS");
    let mut config = UAConfig::new(
        "sip:alice@example.com",
        vec![socket0_ua.into(), socket1_ua.into()],
    )
    .unwrap();
    config.register = true;
    config.connection_recovery_min_interval = Duration::from_millis(50);
    config.connection_recovery_max_interval = Duration::from_millis(200);
    let mut ua = UserAgent::builder().config(config).build().unwrap();
    let peer0 = Peer { conn: socket0_peer };
    let peer1 = Peer { conn: socket1_peer };

    ua.start();
    wait_connected(&mut ua).await;

    let register = peer0.recv_request().await;
    assert_eq!(register.method, Method::Register);
    peer0
        .reply(&register, 200, Some("regtag"), &[("Expires", "60")], "")
        .await;
    expect_event(&mut ua, "Registered", |e| {
        matches!(e, UaEvent::Registered { .. })
    })
    .await;

    let _session = ua.call("sip:bob@example.com", None).expect("call");
    let invite = peer0.recv_request().await;
    assert_eq!(invite.method, Method::Invite);
    peer0.reply(&invite, 180, Some("bobtag"), &[], "").await;
    expect_event(&mut ua, "SessionProgress", |e| {
        matches!(e, UaEvent::SessionProgress { .. })
    })
    .await;

    // the socket dies between 180 and 200
    drop(peer0);

    expect_event(&mut ua, "SocketDisconnected", |e| {
        matches!(e, UaEvent::SocketDisconnected { .. })
    })
    .await;
    let event = expect_event(&mut ua, "SessionTerminated", |e| {
        matches!(e, UaEvent::SessionTerminated { .. })
    })
    .await;
    match event {
        UaEvent::SessionTerminated { cause, .. } => {
            assert_eq!(cause.cause, "Transport Error");
            assert_eq!(cause.status_code, 0);
        }
        _ => unreachable!(),
    }

    // recovery lands on the second socket and re-registers
    expect_event(&mut ua, "SocketConnected", |e| {
        matches!(e, UaEvent::SocketConnected)
    })
    .await;
    let reregister = peer1.recv_request().await;
    assert_eq!(reregister.method, Method::Register);

    // the lost INVITE is not reissued
    peer1.expect_silence(200).await;
}

// incoming MESSAGE and OPTIONS are answered and surfaced
#[tokio::test]
async fn incoming_message_and_options() {
    init_tracing();
    let (mut ua, peer) = make_ua(|_| {});
    ua.start();
    wait_connected(&mut ua).await;

    peer.send_frame(
        "MESSAGE sip:alice@example.com SIP/2.0\r\n\
         Via: SIP/2.0/WS peer.invalid;branch=z9hG4bKmsg9\r\n\
         From: <sip:bob@example.com>;tag=bobtag\r\n\
         To: <sip:alice@example.com>\r\n\
         Call-ID: msg-call-9\r\n\
         CSeq: 1 MESSAGE\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: 5\r\n\r\nhello",
    )
    .await;
    assert_eq!(peer.recv_response().await.status_code, 200);
    let event = expect_event(&mut ua, "NewMessage", |e| {
        matches!(e, UaEvent::NewMessage { .. })
    })
    .await;
    match event {
        UaEvent::NewMessage { request } => assert_eq!(request.body, "hello"),
        _ => unreachable!(),
    }

    peer.send_frame(
        "OPTIONS sip:alice@example.com SIP/2.0\r\n\
         Via: SIP/2.0/WS peer.invalid;branch=z9hG4bKopt9\r\n\
         From: <sip:bob@example.com>;tag=bobtag\r\n\
         To: <sip:alice@example.com>\r\n\
         Call-ID: opt-call-9\r\n\
         CSeq: 1 OPTIONS\r\n\
         Content-Length: 0\r\n\r\n",
    )
    .await;
    let options_ok = peer.recv_response().await;
    assert_eq!(options_ok.status_code, 200);
    assert!(options_ok.headers.get("Allow").is_some());
}

// a request whose request-URI names someone else is refused with 404
#[tokio::test]
async fn foreign_request_uri_is_404() {
    init_tracing();
    let (mut ua, peer) = make_ua(|_| {});
    ua.start();
    wait_connected(&mut ua).await;

    peer.send_frame(
        "MESSAGE sip:carol@example.com SIP/2.0\r\n\
         Via: SIP/2.0/WS peer.invalid;branch=z9hG4bKnot4me\r\n\
         From: <sip:bob@example.com>;tag=bobtag\r\n\
         To: <sip:carol@example.com>\r\n\
         Call-ID: not-for-us\r\n\
         CSeq: 1 MESSAGE\r\n\
         Content-Length: 0\r\n\r\n",
    )
    .await;
    assert_eq!(peer.recv_response().await.status_code, 404);
}

// a 423 answer adopts Min-Expires and retries once
#[tokio::test]
async fn register_interval_too_brief() {
    init_tracing();
    let (mut ua, peer) = make_ua(|config| {
        config.register = true;
        config.register_expires = 10;
    });
    ua.start();
    wait_connected(&mut ua).await;

    let first = peer.recv_request().await;
    assert_eq!(first.headers.get("Expires"), Some("10"));
    peer.reply(
        &first,
        423,
        Some("regtag"),
        &[("Min-Expires", "120")],
        "",
    )
    .await;

    let second = peer.recv_request().await;
    assert_eq!(second.headers.get("Expires"), Some("120"));
    peer.reply(&second, 200, Some("regtag"), &[], "").await;
    expect_event(&mut ua, "Registered", |e| {
        matches!(e, UaEvent::Registered { expires: 120 })
    })
    .await;
}

// CRLF keep-alive: a double CRLF ping is answered with a single CRLF pong
#[tokio::test]
async fn keepalive_ping_pong() {
    init_tracing();
    let (mut ua, peer) = make_ua(|_| {});
    ua.start();
    wait_connected(&mut ua).await;

    peer.send_frame("\r\n\r\n").await;
    let pong = timeout(Duration::from_secs(2), peer.conn.recv())
        .await
        .expect("pong timeout")
        .expect("channel closed");
    assert_eq!(pong, "\r\n");
}

// outbound MESSAGE applicant resolves with the peer's final response
#[tokio::test]
async fn outbound_message_applicant() {
    init_tracing();
    let (mut ua, peer) = make_ua(|_| {});
    ua.start();
    wait_connected(&mut ua).await;

    let peer_task = tokio::spawn(async move {
        let req = peer.recv_request().await;
        assert_eq!(req.method, Method::Message);
        assert_eq!(req.body, "ping");
        peer.reply(&req, 200, Some("msgtag"), &[], "").await;
    });
    let response = ua
        .send_message("sip:bob@example.com", "ping", None)
        .await
        .expect("MESSAGE accepted");
    assert_eq!(response.status_code, 200);
    peer_task.await.expect("peer task");
}
