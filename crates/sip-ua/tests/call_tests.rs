//! Calls in both directions, hang-up in every dialog state, and CANCEL.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use common::{config, count, harness, peer_request, Harness, Wire};
use sip_core::{tag_of, Method, Request};
use sip_parse::cseq;
use sip_transport::{TransportError, TransportPort, TransportTarget};
use sip_ua::{response::build_generic_response, UaError, UaEvent, UserAgent};
use tokio::sync::{mpsc, Notify, Semaphore};

const BOB: &str = "sip:bob@example.com";
const BOB_CONTACT: (&str, &str) = ("Contact", "<sip:bob@192.0.2.50:5060>");

/// Places a call and returns its Call-ID with the INVITE on the wire.
async fn call(h: &Harness) -> (String, Request) {
    let call_id = h.ua.invite(BOB).await.unwrap();
    let invite = h.wire.last_request(Method::Invite);
    assert_eq!(invite.call_id(), Some(call_id.as_str()));
    (call_id.to_string(), invite)
}

/// Rings an incoming call from bob and returns the tag we answered with.
async fn ring(h: &Harness, branch: &str, call_id: &str, number: u32) -> String {
    h.deliver(peer_request("INVITE", branch, call_id, number, None))
        .await;
    let ringing = h
        .wire
        .responses()
        .into_iter()
        .rfind(|r| r.code() == 180)
        .expect("180 sent");
    tag_of(ringing.header("To").unwrap()).unwrap().to_string()
}

#[tokio::test(start_paused = true)]
async fn outgoing_call_is_answered_and_acknowledged() {
    let mut h = harness();
    let (call_id, invite) = call(&h).await;
    assert_eq!(invite.header("Content-Type").unwrap(), "application/sdp");
    assert!(!invite.body().is_empty());
    assert_eq!(h.ua.peers().len(), 1);

    h.reply(&invite, 180, Some("bob1"), &[BOB_CONTACT]).await;
    h.reply(&invite, 200, Some("bob1"), &[BOB_CONTACT]).await;

    let ack = h.wire.last_request(Method::Ack);
    assert_eq!(ack.call_id(), Some(call_id.as_str()));
    assert_eq!(ack.uri().to_string(), "sip:bob@192.0.2.50:5060");
    assert_eq!(cseq(ack.headers()).unwrap().0, cseq(invite.headers()).unwrap().0);

    let events = h.drain();
    assert_eq!(count(&events, |e| matches!(e, UaEvent::Ringing { .. })), 1);
    assert_eq!(count(&events, |e| matches!(e, UaEvent::CalleePickup { .. })), 1);
    let dialog = h.ua.context().dialogs.get_by_call_id(&call_id).unwrap();
    assert!(dialog.is_confirmed());
}

#[tokio::test(start_paused = true)]
async fn retransmitted_2xx_is_acknowledged_again() {
    let h = harness();
    let (_, invite) = call(&h).await;
    h.reply(&invite, 200, Some("bob1"), &[BOB_CONTACT]).await;
    assert_eq!(h.wire.requests(Method::Ack).len(), 1);

    h.reply(&invite, 200, Some("bob1"), &[BOB_CONTACT]).await;
    assert_eq!(h.wire.requests(Method::Ack).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn hanging_up_early_dialog_sends_cancel() {
    let mut h = harness();
    let (call_id, invite) = call(&h).await;
    h.reply(&invite, 180, Some("bob1"), &[BOB_CONTACT]).await;

    h.ua.terminate(&call_id).await.unwrap();
    let cancel = h.wire.last_request(Method::Cancel);
    assert_eq!(cancel.call_id(), invite.call_id());
    assert_eq!(cancel.uri(), invite.uri());
    assert_eq!(cancel.header("Via"), invite.header("Via"));
    assert!(h.wire.requests(Method::Bye).is_empty());

    // The INVITE then ends with 487; a closed call reports no error.
    h.reply(&cancel, 200, Some("bob1"), &[]).await;
    h.reply(&invite, 487, Some("bob1"), &[]).await;
    let events = h.drain();
    assert_eq!(count(&events, |e| matches!(e, UaEvent::Error { .. })), 0);
    assert!(h.ua.context().dialogs.get_by_call_id(&call_id).is_none());
    assert!(h.ua.peers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn hanging_up_before_any_dialog_sends_cancel() {
    let h = harness();
    let (call_id, invite) = call(&h).await;
    h.reply(&invite, 100, None, &[]).await;

    h.ua.terminate(&call_id).await.unwrap();
    assert_eq!(h.wire.requests(Method::Cancel).len(), 1);
    assert!(h.wire.requests(Method::Bye).is_empty());
}

#[tokio::test(start_paused = true)]
async fn hanging_up_before_anything_is_received_waits_for_a_provisional() {
    let mut h = harness();
    let (call_id, invite) = call(&h).await;

    h.ua.terminate(&call_id).await.unwrap();
    assert!(h.wire.requests(Method::Cancel).is_empty());
    assert!(h.ua.context().state.closed_calls.contains(call_id.as_str()));

    h.reply(&invite, 180, Some("bob1"), &[BOB_CONTACT]).await;
    let cancel = h.wire.last_request(Method::Cancel);
    assert_eq!(cancel.header("Via"), invite.header("Via"));

    // A second provisional does not cancel again.
    h.reply(&invite, 183, Some("bob1"), &[BOB_CONTACT]).await;
    assert_eq!(h.wire.distinct_cseqs(Method::Cancel).len(), 1);
    assert_eq!(h.wire.requests(Method::Cancel).len(), 1);

    h.reply(&cancel, 200, Some("bob1"), &[]).await;
    h.reply(&invite, 487, Some("bob1"), &[]).await;
    assert_eq!(count(&h.drain(), |e| matches!(e, UaEvent::Error { .. })), 0);
    assert!(h.ua.context().state.closed_calls.is_empty());
    assert!(h.ua.context().state.deferred_cancels.is_empty());
}

#[tokio::test(start_paused = true)]
async fn hanging_up_confirmed_call_sends_bye() {
    let mut h = harness();
    let (call_id, invite) = call(&h).await;
    h.reply(&invite, 200, Some("bob1"), &[BOB_CONTACT]).await;
    assert_eq!(h.wire.requests(Method::Ack).len(), 1);

    h.ua.terminate(&call_id).await.unwrap();
    assert!(h.wire.requests(Method::Cancel).is_empty());
    let bye = h.wire.last_request(Method::Bye);
    assert_eq!(bye.uri().to_string(), "sip:bob@192.0.2.50:5060");
    assert_eq!(tag_of(bye.header("To").unwrap()).as_deref(), Some("bob1"));
    let invite_number = cseq(invite.headers()).unwrap().0;
    assert!(cseq(bye.headers()).unwrap().0 > invite_number);
    assert!(h.ua.peers().is_empty());
    assert!(h.ua.context().state.closed_calls.is_empty());

    h.reply(&bye, 200, Some("bob1"), &[]).await;
    assert!(h.ua.context().dialogs.get_by_call_id(&call_id).is_none());
    assert_eq!(count(&h.drain(), |e| matches!(e, UaEvent::Error { .. })), 0);
}

#[tokio::test(start_paused = true)]
async fn answer_after_hangup_is_acknowledged_then_closed() {
    let mut h = harness();
    let (call_id, invite) = call(&h).await;
    h.reply(&invite, 180, Some("bob1"), &[BOB_CONTACT]).await;
    h.ua.terminate(&call_id).await.unwrap();
    assert_eq!(h.wire.requests(Method::Cancel).len(), 1);

    // The 200 to the INVITE won the race against the CANCEL.
    h.reply(&invite, 200, Some("bob1"), &[BOB_CONTACT]).await;
    assert_eq!(h.wire.requests(Method::Ack).len(), 1);
    assert_eq!(h.wire.requests(Method::Bye).len(), 1);

    assert!(h.ua.context().state.closed_calls.is_empty());

    let events = h.drain();
    assert_eq!(count(&events, |e| matches!(e, UaEvent::CalleePickup { .. })), 0);
    assert_eq!(count(&events, |e| matches!(e, UaEvent::Ringing { .. })), 1);
}

/// Holds every ACK until the test opens the gate.
struct AckGate {
    wire: Arc<Wire>,
    parked: Notify,
    open: Semaphore,
}

#[async_trait]
impl TransportPort for AckGate {
    async fn send(&self, target: &TransportTarget, payload: Bytes) -> Result<(), TransportError> {
        if payload.starts_with(b"ACK ") {
            self.parked.notify_one();
            let _permit = self.open.acquire().await;
        }
        self.wire.send(target, payload).await
    }
}

#[tokio::test(start_paused = true)]
async fn hangup_racing_the_answer_sends_one_bye() {
    let gate = Arc::new(AckGate {
        wire: Arc::new(Wire::default()),
        parked: Notify::new(),
        open: Semaphore::new(0),
    });
    let (tx, events) = mpsc::unbounded_channel();
    let ua = UserAgent::new(config(), gate.clone(), Arc::new(tx)).unwrap();
    let mut h = Harness {
        ua: Arc::new(ua),
        wire: gate.wire.clone(),
        events,
    };
    let (call_id, invite) = call(&h).await;
    h.reply(&invite, 180, Some("bob1"), &[BOB_CONTACT]).await;

    let mut ok = build_generic_response(&invite, 200, "OK", Some("bob1")).unwrap();
    ok.headers_mut().push(BOB_CONTACT.0, BOB_CONTACT.1);
    let ua = h.ua.clone();
    let answer = tokio::spawn(async move { ua.handle_response(ok).await });
    // The 2xx is mid-delivery, stuck sending its ACK.
    gate.parked.notified().await;

    let ua = h.ua.clone();
    let id = call_id.clone();
    let hangup = tokio::spawn(async move { ua.terminate(&id).await });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    gate.open.add_permits(1);
    answer.await.unwrap();
    hangup.await.unwrap().unwrap();

    assert_eq!(h.wire.requests(Method::Ack).len(), 1);
    assert_eq!(h.wire.requests(Method::Bye).len(), 1);
    assert!(h.wire.requests(Method::Cancel).is_empty());
    assert!(h.ua.context().state.closed_calls.is_empty());
    let events = h.drain();
    assert_eq!(count(&events, |e| matches!(e, UaEvent::CalleePickup { .. })), 1);
    assert_eq!(count(&events, |e| matches!(e, UaEvent::Error { .. })), 0);
}

#[tokio::test(start_paused = true)]
async fn unknown_call_cannot_be_terminated() {
    let h = harness();
    let err = h.ua.terminate("nobody@nowhere").await.unwrap_err();
    assert!(matches!(err, UaError::NoSuchCall(_)));
    assert!(h.ua.context().state.closed_calls.is_empty());
}

#[tokio::test(start_paused = true)]
async fn repeated_challenge_on_invite_is_an_error() {
    let mut h = harness();
    let (call_id, invite) = call(&h).await;
    let challenge = (
        "Proxy-Authenticate",
        "Digest realm=\"example.com\", nonce=\"abc\", algorithm=MD5",
    );
    h.reply(&invite, 407, Some("px"), &[challenge]).await;
    let retry = h.wire.last_request(Method::Invite);
    assert!(retry.header("Proxy-Authorization").is_some());
    assert_eq!(retry.call_id(), invite.call_id());

    h.reply(&retry, 407, Some("px"), &[challenge]).await;
    assert_eq!(h.wire.distinct_cseqs(Method::Invite).len(), 2);

    let events = h.drain();
    let errors: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            UaEvent::Error { call_id, response } => {
                Some((call_id.to_string(), response.as_ref().map(|r| r.code())))
            }
            _ => None,
        })
        .collect();
    assert_eq!(errors, vec![(call_id, Some(407))]);
    assert!(h.ua.peers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn rejected_call_reports_error() {
    let mut h = harness();
    let (_, invite) = call(&h).await;
    h.reply(&invite, 486, Some("bob1"), &[]).await;

    // Non-2xx final responses are acknowledged by the transaction itself.
    assert_eq!(h.wire.requests(Method::Ack).len(), 1);
    assert_eq!(count(&h.drain(), |e| matches!(e, UaEvent::Error { .. })), 1);
}

#[tokio::test(start_paused = true)]
async fn incoming_call_rings_and_is_accepted() {
    let mut h = harness();
    let tag = ring(&h, "z9hG4bKinv1", "call-1", 5).await;

    let events = h.drain();
    assert!(matches!(&events[..], [UaEvent::IncomingCall { call_id, .. }] if call_id == "call-1"));

    h.ua.accept_call("call-1").await.unwrap();
    let ok = h.wire.responses().pop().unwrap();
    assert_eq!(ok.code(), 200);
    assert_eq!(tag_of(ok.header("To").unwrap()).as_deref(), Some(tag.as_str()));
    assert!(ok.header("Contact").is_some());
    assert!(!ok.body().is_empty());
    assert!(h.ua.context().dialogs.get_by_call_id("call-1").unwrap().is_confirmed());

    h.deliver(peer_request("ACK", "z9hG4bKack1", "call-1", 5, Some(&tag)))
        .await;
    assert!(h.ua.context().state.offers.is_empty());
    assert!(h.ua.accept_call("call-1").await.is_err());
}

#[tokio::test(start_paused = true)]
async fn hanging_up_ringing_incoming_call_rejects_it() {
    let h = harness();
    ring(&h, "z9hG4bKinv1", "call-1", 5).await;

    h.ua.terminate("call-1").await.unwrap();
    assert_eq!(h.wire.response_codes(), vec![180, 486]);
    assert!(h.ua.context().dialogs.get_by_call_id("call-1").is_none());
    assert!(h.ua.peers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stale_bye_is_refused_and_current_one_hangs_up() {
    let mut h = harness();
    let tag = ring(&h, "z9hG4bKinv1", "call-1", 5).await;
    h.ua.accept_call("call-1").await.unwrap();
    h.drain();

    h.deliver(peer_request("BYE", "z9hG4bKbye1", "call-1", 4, Some(&tag)))
        .await;
    assert_eq!(h.wire.response_codes().last(), Some(&500));
    assert!(h.ua.context().dialogs.get_by_call_id("call-1").is_some());
    assert!(h.drain().is_empty());

    h.deliver(peer_request("BYE", "z9hG4bKbye2", "call-1", 6, Some(&tag)))
        .await;
    assert_eq!(h.wire.response_codes().last(), Some(&200));
    assert!(h.ua.context().dialogs.get_by_call_id("call-1").is_none());
    assert!(h.ua.peers().is_empty());

    // A retransmission is answered by the transaction, not the handler.
    h.deliver(peer_request("BYE", "z9hG4bKbye2", "call-1", 6, Some(&tag)))
        .await;
    assert_eq!(h.wire.response_codes().last(), Some(&200));

    h.deliver(peer_request("BYE", "z9hG4bKbye3", "call-1", 7, Some(&tag)))
        .await;
    assert_eq!(h.wire.response_codes().last(), Some(&481));

    let hangups = count(&h.drain(), |e| {
        matches!(e, UaEvent::RemoteHangup { call_id, .. } if call_id == "call-1")
    });
    assert_eq!(hangups, 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_of_ringing_call_ends_it() {
    let mut h = harness();
    ring(&h, "z9hG4bKinv2", "call-2", 1).await;
    h.drain();

    h.deliver(peer_request("CANCEL", "z9hG4bKinv2", "call-2", 1, None))
        .await;
    assert_eq!(h.wire.response_codes(), vec![180, 200, 487]);

    let responses = h.wire.responses();
    let terminated = &responses[2];
    assert_eq!(cseq(terminated.headers()).unwrap().1, Method::Invite);

    let events = h.drain();
    assert!(matches!(&events[..], [UaEvent::RemoteHangup { call_id, request }]
        if call_id == "call-2" && *request.method() == Method::Cancel));
    assert!(h.ua.context().dialogs.get_by_call_id("call-2").is_none());
    assert!(matches!(
        h.ua.accept_call("call-2").await,
        Err(UaError::NoSuchCall(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn cancel_without_matching_invite_gets_481() {
    let mut h = harness();
    ring(&h, "z9hG4bKinv2", "call-2", 1).await;
    h.drain();

    h.deliver(peer_request("CANCEL", "z9hG4bKother", "call-2", 1, None))
        .await;
    assert_eq!(h.wire.response_codes(), vec![180, 481]);
    assert!(h.drain().is_empty());
    assert!(h.ua.context().state.pending_invites.contains_key("call-2"));
}

#[tokio::test(start_paused = true)]
async fn cancel_after_answer_changes_nothing() {
    let mut h = harness();
    ring(&h, "z9hG4bKinv3", "call-3", 1).await;
    h.ua.accept_call("call-3").await.unwrap();
    h.drain();

    h.deliver(peer_request("CANCEL", "z9hG4bKinv3", "call-3", 1, None))
        .await;
    let codes = h.wire.response_codes();
    assert_ne!(codes.last(), Some(&487));
    assert!(h.drain().is_empty());
    assert!(h.ua.context().dialogs.get_by_call_id("call-3").is_some());
}
