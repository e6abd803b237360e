//! Shared harness: a user agent wired to a recording transport and an event
//! channel.

#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sip_core::{Method, Request, Response, SipMessage};
use sip_parse::{cseq, parse_message};
use sip_transport::{InboundPacket, TransportError, TransportKind, TransportPort, TransportTarget};
use sip_ua::{response::build_generic_response, UaConfig, UaEvent, UserAgent};
use tokio::sync::mpsc::{self, UnboundedReceiver};

pub const PEER: &str = "192.0.2.50:5060";

#[derive(Default)]
pub struct Wire {
    sent: Mutex<Vec<(TransportTarget, Bytes)>>,
}

#[async_trait]
impl TransportPort for Wire {
    async fn send(&self, target: &TransportTarget, payload: Bytes) -> Result<(), TransportError> {
        self.sent.lock().push((target.clone(), payload));
        Ok(())
    }
}

impl Wire {
    fn messages(&self) -> Vec<(TransportTarget, SipMessage)> {
        self.sent
            .lock()
            .iter()
            .filter_map(|(target, bytes)| parse_message(bytes).map(|m| (target.clone(), m)))
            .collect()
    }

    pub fn requests(&self, method: Method) -> Vec<Request> {
        self.requests_to(method).into_iter().map(|(_, r)| r).collect()
    }

    pub fn requests_to(&self, method: Method) -> Vec<(TransportTarget, Request)> {
        self.messages()
            .into_iter()
            .filter_map(|(target, message)| match message {
                SipMessage::Request(request) if *request.method() == method => {
                    Some((target, request))
                }
                _ => None,
            })
            .collect()
    }

    pub fn last_request(&self, method: Method) -> Request {
        self.requests(method.clone())
            .pop()
            .unwrap_or_else(|| panic!("no {method} sent"))
    }

    /// Distinct CSeq numbers sent for `method`; retransmissions count once.
    pub fn distinct_cseqs(&self, method: Method) -> Vec<u32> {
        let mut numbers: Vec<u32> = self
            .requests(method)
            .iter()
            .filter_map(|r| cseq(r.headers()).map(|(n, _)| n))
            .collect();
        numbers.sort_unstable();
        numbers.dedup();
        numbers
    }

    pub fn responses(&self) -> Vec<Response> {
        self.messages()
            .into_iter()
            .filter_map(|(_, message)| match message {
                SipMessage::Response(response) => Some(response),
                _ => None,
            })
            .collect()
    }

    pub fn response_codes(&self) -> Vec<u16> {
        self.responses().iter().map(Response::code).collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

pub struct Harness {
    pub ua: Arc<UserAgent>,
    pub wire: Arc<Wire>,
    pub events: UnboundedReceiver<UaEvent>,
}

pub fn config() -> UaConfig {
    UaConfig {
        user: "alice".to_owned(),
        domain: "example.com".to_owned(),
        password: Some("secret".to_owned()),
        local_ip: "127.0.0.1".to_owned(),
        ..UaConfig::default()
    }
}

pub fn harness() -> Harness {
    harness_with(config())
}

pub fn harness_with(config: UaConfig) -> Harness {
    let wire = Arc::new(Wire::default());
    let (tx, events) = mpsc::unbounded_channel();
    let ua = UserAgent::new(config, wire.clone(), Arc::new(tx)).expect("user agent");
    Harness {
        ua: Arc::new(ua),
        wire,
        events,
    }
}

impl Harness {
    /// Answers `request` as the peer would, with extra headers appended.
    pub async fn reply(
        &self,
        request: &Request,
        code: u16,
        to_tag: Option<&str>,
        extra: &[(&str, &str)],
    ) {
        let mut response =
            build_generic_response(request, code, "Reply", to_tag).expect("response");
        for (name, value) in extra {
            response.headers_mut().push(*name, *value);
        }
        self.ua.handle_response(response).await;
    }

    /// Feeds raw request text from the peer.
    pub async fn deliver(&self, text: String) {
        let peer: SocketAddr = PEER.parse().expect("peer address");
        self.ua
            .handle_packet(InboundPacket {
                transport: TransportKind::Udp,
                peer,
                payload: Bytes::from(text),
            })
            .await;
    }

    pub fn drain(&mut self) -> Vec<UaEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// A request from the peer (bob) to us (alice). `to_tag` makes it in-dialog.
pub fn peer_request(
    method: &str,
    branch: &str,
    call_id: &str,
    cseq: u32,
    to_tag: Option<&str>,
) -> String {
    let to = match to_tag {
        Some(tag) => format!("<sip:alice@example.com>;tag={tag}"),
        None => "<sip:alice@example.com>".to_owned(),
    };
    format!(
        "{method} sip:alice@127.0.0.1:5060 SIP/2.0\r\n\
Via: SIP/2.0/UDP 192.0.2.50:5060;branch={branch}\r\n\
Max-Forwards: 70\r\n\
From: <sip:bob@example.com>;tag=b1\r\n\
To: {to}\r\n\
Call-ID: {call_id}\r\n\
CSeq: {cseq} {method}\r\n\
Contact: <sip:bob@192.0.2.50:5060>\r\n\
Content-Length: 0\r\n\r\n"
    )
}

pub fn count<F: Fn(&UaEvent) -> bool>(events: &[UaEvent], f: F) -> usize {
    events.iter().filter(|e| f(e)).count()
}
