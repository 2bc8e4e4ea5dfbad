use crate::message::{grammar::Challenge, Method, Request};
use crate::transaction::{make_branch, random_text, CNONCE_LEN};
use crate::{Error, Result};

/// Client credentials for digest authentication.
///
/// `realm` restricts the credential to one realm when set; `ha1` replaces
/// the password with a precomputed `md5(user:realm:password)`.
#[derive(Clone, Debug)]
pub struct Credential {
    pub username: String,
    pub password: String,
    pub realm: Option<String>,
    pub ha1: Option<String>,
}

impl Credential {
    pub fn new(username: &str, password: &str) -> Self {
        Credential {
            username: username.to_string(),
            password: password.to_string(),
            realm: None,
            ha1: None,
        }
    }
}

fn md5_hex(data: &str) -> String {
    format!("{:x}", md5::compute(data.as_bytes()))
}

/// Computes a Digest Authorization header value for `challenge`
/// (RFC 2617 §3.2.2): qop=auth with a fresh cnonce when offered, plain
/// HA1:nonce:HA2 otherwise.
pub fn digest_authorization(
    cred: &Credential,
    challenge: &Challenge,
    method: &Method,
    uri: &str,
) -> Result<String> {
    if let Some(realm) = &cred.realm {
        if !realm.eq_ignore_ascii_case(&challenge.realm) {
            return Err(Error::AuthError(format!(
                "challenge realm {} does not match credential realm {}",
                challenge.realm, realm
            )));
        }
    }
    if let Some(algorithm) = &challenge.algorithm {
        if !algorithm.eq_ignore_ascii_case("MD5") {
            return Err(Error::AuthError(format!(
                "unsupported digest algorithm: {}",
                algorithm
            )));
        }
    }
    if !challenge.scheme.eq_ignore_ascii_case("Digest") || challenge.nonce.is_empty() {
        return Err(Error::AuthError(format!(
            "unusable challenge scheme: {}",
            challenge.scheme
        )));
    }

    let ha1 = match &cred.ha1 {
        Some(ha1) => ha1.clone(),
        None => md5_hex(&format!(
            "{}:{}:{}",
            cred.username, challenge.realm, cred.password
        )),
    };
    let ha2 = md5_hex(&format!("{}:{}", method, uri));

    let mut auth = format!(
        "Digest algorithm=MD5, username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\"",
        cred.username, challenge.realm, challenge.nonce, uri
    );

    let response = if challenge.qop.iter().any(|q| q == "auth") {
        let cnonce = random_text(CNONCE_LEN);
        let nc = "00000001";
        auth.push_str(&format!(", qop=auth, cnonce=\"{}\", nc={}", cnonce, nc));
        md5_hex(&format!(
            "{}:{}:{}:{}:auth:{}",
            ha1, challenge.nonce, nc, cnonce, ha2
        ))
    } else if challenge.qop.is_empty() {
        md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2))
    } else {
        return Err(Error::AuthError(format!(
            "unsupported qop options: {}",
            challenge.qop.join(",")
        )));
    };

    auth.push_str(&format!(", response=\"{}\"", response));
    if let Some(opaque) = &challenge.opaque {
        auth.push_str(&format!(", opaque=\"{}\"", opaque));
    }
    Ok(auth)
}

/// Rebuilds `request` with a fresh branch, the next CSeq and an
/// Authorization answering the 401/407 challenge.
pub(crate) fn authenticate_request(
    request: &Request,
    challenge: &Challenge,
    cred: &Credential,
    proxy: bool,
    new_seq: u32,
) -> Result<Request> {
    let mut request = request.clone();
    let uri = request.uri.to_string();
    let authorization = digest_authorization(cred, challenge, &request.method, &uri)?;

    let header = if proxy {
        "Proxy-Authorization"
    } else {
        "Authorization"
    };
    request.headers.remove("Authorization");
    request.headers.remove("Proxy-Authorization");
    request.headers.set(header, &authorization);

    request
        .headers
        .set("CSeq", &format!("{} {}", new_seq, request.method));

    // the retry is a new transaction
    if let Some(mut via) = request.headers.via() {
        via.params.set("branch", Some(&make_branch()));
        request.headers.set("Via", &via.to_string());
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::grammar::parse_challenge;
    use crate::message::parser::parse;
    use crate::message::SipMessage;

    #[test]
    fn digest_without_qop_matches_rfc2617_vector() {
        // RFC 2617 §3.5 example adapted to MD5 without qop
        let cred = Credential::new("Mufasa", "Circle Of Life");
        let challenge = Challenge {
            scheme: "Digest".to_string(),
            realm: "testrealm@host.com".to_string(),
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093".to_string(),
            ..Default::default()
        };
        let value = digest_authorization(
            &cred,
            &challenge,
            &Method::Extension("GET".to_string()),
            "/dir/index.html",
        )
        .unwrap();
        assert!(value.contains("response=\"670fd8c2df070c60b045671b8b24ff02\""));
    }

    #[test]
    fn qop_auth_emits_cnonce_and_nc() {
        let cred = Credential::new("alice", "secret");
        let challenge =
            parse_challenge("Digest realm=\"example.com\", nonce=\"abc\", qop=\"auth\"").unwrap();
        let value =
            digest_authorization(&cred, &challenge, &Method::Register, "sip:example.com").unwrap();
        assert!(value.contains("qop=auth"));
        assert!(value.contains("nc=00000001"));
        assert!(value.contains("cnonce=\""));
        assert!(value.contains("username=\"alice\""));
    }

    #[test]
    fn realm_mismatch_is_an_auth_error() {
        let mut cred = Credential::new("alice", "secret");
        cred.realm = Some("other.com".to_string());
        let challenge =
            parse_challenge("Digest realm=\"example.com\", nonce=\"abc\"").unwrap();
        assert!(matches!(
            digest_authorization(&cred, &challenge, &Method::Register, "sip:example.com"),
            Err(Error::AuthError(_))
        ));
    }

    #[test]
    fn retry_request_gets_new_branch_and_cseq() {
        let raw = "REGISTER sip:example.com SIP/2.0\r\n\
            Via: SIP/2.0/WS host.invalid;branch=z9hG4bKold\r\n\
            From: <sip:alice@example.com>;tag=a\r\n\
            To: <sip:alice@example.com>\r\n\
            Call-ID: c\r\n\
            CSeq: 1 REGISTER\r\n\
            Content-Length: 0\r\n\r\n";
        let req = match parse(raw).unwrap() {
            SipMessage::Request(req) => req,
            _ => unreachable!(),
        };
        let challenge =
            parse_challenge("Digest realm=\"example.com\", nonce=\"abc\"").unwrap();
        let cred = Credential::new("alice", "secret");
        let retry = authenticate_request(&req, &challenge, &cred, false, 2).unwrap();
        assert_eq!(retry.headers.cseq().unwrap().seq, 2);
        assert_ne!(retry.headers.branch(), req.headers.branch());
        assert!(retry.headers.get("Authorization").unwrap().starts_with("Digest"));
    }
}
