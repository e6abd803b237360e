//! RFC 3261 §17 transaction layer for the user agent.
//!
//! - [`timers`]: the RFC timer table and the cancellable one-shot timer service
//! - [`fsm`]: the four transaction state machines, pure and I/O free
//! - [`manager`]: id-keyed transaction storage, dispatch, timers and transport
//! - [`ids`]: per-instance branch, tag and Call-ID generation

use std::fmt;

use sip_core::{Headers, Method, Request, ViaHeader};
use smol_str::SmolStr;

pub mod fsm;
pub mod ids;
pub mod manager;
pub mod timers;

pub use fsm::{
    build_non2xx_ack, ClientAction, ClientEvent, ClientInviteFsm, ClientNonInviteFsm,
    ServerAction, ServerEvent, ServerInviteFsm, ServerNonInviteFsm, TerminationCause,
};
pub use ids::IdGenerator;
pub use manager::{
    InboundRequest, ServerTransactionHandle, TransactionEvent, TransactionManager,
    TransactionUser,
};
pub use timers::{schedule, TimerDefaults, TimerHandle, TransportAwareTimers};

/// Timers referenced by the SIP transaction state machines (RFC 3261 §17).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionTimer {
    A,
    B,
    D,
    E,
    F,
    G,
    H,
    I,
    J,
    K,
}

/// Client INVITE transaction states (RFC 3261 Figure 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientInviteState {
    Init,
    Calling,
    Proceeding,
    Completed,
    Terminated,
}

/// Server INVITE transaction states (RFC 3261 Figure 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerInviteState {
    Init,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

/// Client non-INVITE transaction states (RFC 3261 Figure 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientNonInviteState {
    Init,
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Server non-INVITE transaction states (RFC 3261 Figure 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerNonInviteState {
    Init,
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Aggregate of client-side transaction states (INVITE or non-INVITE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientTransactionState {
    Invite(ClientInviteState),
    NonInvite(ClientNonInviteState),
}

/// Aggregate of server-side transaction states (INVITE or non-INVITE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerTransactionState {
    Invite(ServerInviteState),
    NonInvite(ServerNonInviteState),
}

/// Unique key identifying a transaction (branch + method + direction).
///
/// Client keys carry the method too: a CANCEL reuses its INVITE's branch
/// and must still land in its own transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: SmolStr,
    pub method: Method,
    pub is_server: bool,
}

impl TransactionKey {
    pub fn new(branch: impl Into<SmolStr>, method: Method, is_server: bool) -> Self {
        Self {
            branch: branch.into(),
            method,
            is_server,
        }
    }

    /// Builds a transaction key from a request, deriving the branch parameter.
    pub fn from_request(req: &Request, is_server: bool) -> Option<Self> {
        let branch = request_branch_id(req)?;
        Some(Self {
            branch,
            method: req.method().clone(),
            is_server,
        })
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = if self.is_server { "server" } else { "client" };
        write!(f, "{}/{}/{}", side, self.method, self.branch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    MissingVia,
    MissingBranch,
    Duplicate(TransactionKey),
    AlreadyStarted,
    Unknown(TransactionKey),
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingVia => write!(f, "request has no Via header"),
            Self::MissingBranch => write!(f, "top Via has no branch parameter"),
            Self::Duplicate(key) => write!(f, "transaction {} already exists", key),
            Self::AlreadyStarted => write!(f, "transaction was already started"),
            Self::Unknown(key) => write!(f, "no transaction {}", key),
        }
    }
}

impl std::error::Error for TransactionError {}

/// Returns the top-most Via header, parsed.
pub fn top_via(headers: &Headers) -> Option<ViaHeader> {
    headers.get("Via").and_then(|v| ViaHeader::parse(v))
}

/// Extracts the `branch=` parameter from a Via header string.
pub fn branch_from_via(via: &str) -> Option<&str> {
    via.split(';').skip(1).find_map(|part| {
        let (name, value) = part.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("branch") {
            Some(value.trim())
        } else {
            None
        }
    })
}

/// Returns the branch ID for the given request, if one is present.
pub fn request_branch_id(req: &Request) -> Option<SmolStr> {
    let via = req.headers().get("Via")?;
    branch_from_via(via)
        .filter(|b| !b.is_empty())
        .map(SmolStr::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sip_core::{RequestLine, SipUri};

    fn build_request(headers: Vec<(&str, &str)>) -> Request {
        let mut hdrs = Headers::new();
        for (name, value) in headers {
            hdrs.push(name, value);
        }

        Request::new(
            RequestLine::new(Method::Invite, SipUri::parse("sip:example.com").unwrap()),
            hdrs,
            Bytes::new(),
        )
        .unwrap()
    }

    #[test]
    fn extracts_branch_from_top_via() {
        let branch = "z9hG4bKabc123";
        let via_value = format!("SIP/2.0/UDP host;branch={branch};received=1");
        assert_eq!(branch_from_via(via_value.as_str()), Some(branch));

        let req = build_request(vec![
            ("Via", via_value.as_str()),
            ("Via", "SIP/2.0/TCP other;branch=z9hG4bKignored"),
        ]);
        let extracted = request_branch_id(&req).expect("branch");
        assert_eq!(extracted.as_str(), branch);
    }

    #[test]
    fn empty_branch_is_no_branch() {
        let req = build_request(vec![("Via", "SIP/2.0/UDP host;branch=")]);
        assert!(request_branch_id(&req).is_none());
        assert!(TransactionKey::from_request(&req, true).is_none());
    }

    #[test]
    fn transaction_key_derives_from_request() {
        let branch = "z9hG4bKtest";
        let via_value = format!("SIP/2.0/UDP host;branch={branch}");
        let req = build_request(vec![("Via", via_value.as_str()), ("CSeq", "1 INVITE")]);

        let key = TransactionKey::from_request(&req, true).expect("key");
        assert_eq!(key.branch.as_str(), branch);
        assert_eq!(key.method, Method::Invite);
        assert!(key.is_server);
        assert_eq!(key.to_string(), "server/INVITE/z9hG4bKtest");
    }

    #[test]
    fn cancel_and_invite_keys_differ() {
        let invite = TransactionKey::new("z9hG4bK1", Method::Invite, false);
        let cancel = TransactionKey::new("z9hG4bK1", Method::Cancel, false);
        assert_ne!(invite, cancel);
    }
}
