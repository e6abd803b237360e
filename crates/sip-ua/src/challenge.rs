//! Digest challenge handling for outgoing requests.
//!
//! One challenge per attempt is answered; the attempt objects in the
//! handlers carry the "already challenged" flag so a second 401/407 ends the
//! attempt instead of looping.

use parking_lot::Mutex;
use sip_auth::{DigestChallenge, DigestClient};
use sip_core::{Request, Response};
use sip_parse::cseq;
use smol_str::SmolStr;
use tracing::debug;

use crate::UaError;

pub struct ChallengeManager {
    client: Option<Mutex<DigestClient>>,
    /// Last challenge answered, reused to pre-authorize in-dialog requests
    cached: Mutex<Option<DigestChallenge>>,
}

impl ChallengeManager {
    pub fn new(username: &str, password: Option<&str>) -> Self {
        Self {
            client: password.map(|password| Mutex::new(DigestClient::new(username, password))),
            cached: Mutex::new(None),
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.client.is_some()
    }

    /// Builds the retry for a challenged request: same request with CSeq
    /// incremented and the Authorization (or Proxy-Authorization) header set.
    /// The transaction layer gives it a fresh branch.
    pub fn retry_with_credentials(
        &self,
        original: &Request,
        challenge_response: &Response,
    ) -> Result<Request, UaError> {
        let client = self.client.as_ref().ok_or(UaError::NoCredentials)?;
        let challenge = DigestChallenge::from_response(challenge_response)?;

        let mut request = original.clone();
        let (number, method) = cseq(request.headers()).ok_or(UaError::MissingHeader("CSeq"))?;
        request
            .headers_mut()
            .set("CSeq", format!("{} {}", number.saturating_add(1), method));

        let value = client.lock().authorize(
            &challenge,
            request.method(),
            &request.uri().to_string(),
            request.body(),
        );
        request
            .headers_mut()
            .set(challenge.authorization_header(), value);
        debug!(
            realm = %challenge.realm,
            proxy = challenge.proxy,
            method = %request.method(),
            "answering digest challenge"
        );
        *self.cached.lock() = Some(challenge);
        Ok(request)
    }

    /// Adds credentials for the cached challenge, with the next nonce count.
    /// Returns false when nothing is cached.
    pub fn preauthorize(&self, request: &mut Request) -> bool {
        let Some(client) = self.client.as_ref() else {
            return false;
        };
        let Some(challenge) = self.cached.lock().clone() else {
            return false;
        };
        let value: SmolStr = client.lock().authorize(
            &challenge,
            request.method(),
            &request.uri().to_string(),
            request.body(),
        );
        request
            .headers_mut()
            .set(challenge.authorization_header(), value);
        true
    }

    pub fn forget(&self) {
        self.cached.lock().take();
    }
}

/// True when a request carries credentials of either kind.
pub fn is_authorized(request: &Request) -> bool {
    request.header("Authorization").is_some() || request.header("Proxy-Authorization").is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sip_core::{Headers, Method, RequestLine, SipUri, StatusLine};

    fn register() -> Request {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKc1");
        headers.push("Call-ID", "reg@10.0.0.1");
        headers.push("CSeq", "4 REGISTER");
        Request::new(
            RequestLine::new(Method::Register, SipUri::parse("sip:example.com").unwrap()),
            headers,
            Bytes::new(),
        )
        .unwrap()
    }

    fn challenge(code: u16, header: &str) -> Response {
        let mut headers = Headers::new();
        headers.push(header, "Digest realm=\"example.com\", nonce=\"n1\", qop=\"auth\"");
        Response::new(StatusLine::new(code, "Challenge").unwrap(), headers, Bytes::new()).unwrap()
    }

    #[test]
    fn retry_increments_cseq_and_adds_authorization() {
        let manager = ChallengeManager::new("alice", Some("secret"));
        let retry = manager
            .retry_with_credentials(&register(), &challenge(401, "WWW-Authenticate"))
            .unwrap();
        assert_eq!(retry.header("CSeq").unwrap(), "5 REGISTER");
        assert!(retry
            .header("Authorization")
            .unwrap()
            .contains("uri=\"sip:example.com\""));
        assert!(is_authorized(&retry));
    }

    #[test]
    fn proxy_challenge_uses_proxy_header() {
        let manager = ChallengeManager::new("alice", Some("secret"));
        let retry = manager
            .retry_with_credentials(&register(), &challenge(407, "Proxy-Authenticate"))
            .unwrap();
        assert!(retry.header("Proxy-Authorization").is_some());
        assert!(retry.header("Authorization").is_none());
    }

    #[test]
    fn no_password_means_no_retry() {
        let manager = ChallengeManager::new("alice", None);
        assert!(!manager.has_credentials());
        assert!(matches!(
            manager.retry_with_credentials(&register(), &challenge(401, "WWW-Authenticate")),
            Err(UaError::NoCredentials)
        ));
    }

    #[test]
    fn preauthorize_reuses_cached_challenge_with_next_nc() {
        let manager = ChallengeManager::new("alice", Some("secret"));
        let mut bye = register();
        assert!(!manager.preauthorize(&mut bye));

        manager
            .retry_with_credentials(&register(), &challenge(401, "WWW-Authenticate"))
            .unwrap();
        assert!(manager.preauthorize(&mut bye));
        assert!(bye.header("Authorization").unwrap().contains("nc=00000002"));

        manager.forget();
        let mut other = register();
        assert!(!manager.preauthorize(&mut other));
    }
}
