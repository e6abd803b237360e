// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end timer behaviour of the transaction manager under paused time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sip_core::{Headers, Method, Request, RequestLine, SipUri};
use sip_transaction::{
    IdGenerator, TimerDefaults, TransactionEvent, TransactionKey, TransactionManager,
    TransactionUser,
};
use sip_transport::{TransportError, TransportKind, TransportPort, TransportTarget};
use tokio::time::Instant;

struct TimedTransport {
    start: Instant,
    sent: Mutex<Vec<Duration>>,
}

#[async_trait]
impl TransportPort for TimedTransport {
    async fn send(&self, _target: &TransportTarget, _payload: Bytes) -> Result<(), TransportError> {
        self.sent.lock().push(self.start.elapsed());
        Ok(())
    }
}

#[derive(Default)]
struct CountingUser {
    events: Mutex<Vec<TransactionEvent>>,
}

#[async_trait]
impl TransactionUser for CountingUser {
    async fn on_event(&self, _key: &TransactionKey, event: TransactionEvent) {
        self.events.lock().push(event);
    }
}

fn request(method: Method) -> Request {
    let mut headers = Headers::new();
    headers.push("Via", "SIP/2.0/UDP 192.0.2.1:5060;branch=z9hG4bKseed");
    headers.push("From", "<sip:alice@example.com>;tag=1");
    headers.push("To", "<sip:bob@example.com>");
    headers.push("Call-ID", "retransmit@192.0.2.1");
    headers.push("CSeq", format!("1 {method}"));
    Request::new(
        RequestLine::new(method, SipUri::parse("sip:bob@example.com").unwrap()),
        headers,
        Bytes::new(),
    )
    .unwrap()
}

async fn run_unanswered(method: Method, kind: TransportKind) -> (Vec<Duration>, Vec<TransactionEvent>) {
    let transport = Arc::new(TimedTransport {
        start: Instant::now(),
        sent: Mutex::new(Vec::new()),
    });
    let user = Arc::new(CountingUser::default());
    let manager = TransactionManager::with_ids(
        transport.clone(),
        TimerDefaults::default(),
        Arc::new(IdGenerator::seeded(3)),
    );
    manager
        .create_client_transaction(
            request(method),
            TransportTarget::new(kind, "192.0.2.20", 5060),
            None,
            user.clone(),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(manager.client_count(), 0);
    let sent = transport.sent.lock().clone();
    let events = user.events.lock().clone();
    (sent, events)
}

fn millis(sent: &[Duration]) -> Vec<u128> {
    sent.iter().map(|d| d.as_millis()).collect()
}

#[tokio::test(start_paused = true)]
async fn unanswered_non_invite_over_udp_backs_off_to_t2() {
    let (sent, events) = run_unanswered(Method::Options, TransportKind::Udp).await;
    assert_eq!(
        millis(&sent),
        vec![0, 500, 1500, 3500, 7500, 11500, 15500, 19500, 23500, 27500, 31500]
    );
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], TransactionEvent::Timeout));
}

#[tokio::test(start_paused = true)]
async fn unanswered_invite_over_udp_doubles_without_cap() {
    let (sent, events) = run_unanswered(Method::Invite, TransportKind::Udp).await;
    assert_eq!(millis(&sent), vec![0, 500, 1500, 3500, 7500, 15500, 31500]);
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], TransactionEvent::Timeout));
}

#[tokio::test(start_paused = true)]
async fn reliable_transport_sends_once_then_times_out() {
    let (sent, events) = run_unanswered(Method::Register, TransportKind::Tcp).await;
    assert_eq!(millis(&sent), vec![0]);
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], TransactionEvent::Timeout));
}
