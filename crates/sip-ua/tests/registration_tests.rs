//! Registration lifecycle through a whole user agent, on virtual time.

mod common;

use std::time::Duration;

use common::{count, harness, harness_with, config};
use sip_core::{Method, NameAddr};
use sip_parse::top_via;
use sip_ua::{UaConfig, UaEvent};

const WWW_AUTH: (&str, &str) = (
    "WWW-Authenticate",
    "Digest realm=\"example.com\", nonce=\"n0nce\", qop=\"auth\", algorithm=MD5",
);

#[tokio::test(start_paused = true)]
async fn refresh_goes_out_ten_seconds_before_expiry() {
    let mut h = harness();
    h.ua.register().await.unwrap();
    let register = h.wire.last_request(Method::Register);
    assert_eq!(register.header("Expires").unwrap(), "3600");
    assert_eq!(register.uri().to_string(), "sip:example.com");

    h.reply(
        &register,
        200,
        Some("reg"),
        &[("Contact", "<sip:alice@127.0.0.1:5060>;expires=3600")],
    )
    .await;
    assert!(h.ua.is_registered());
    let events = h.drain();
    assert!(matches!(events[0], UaEvent::Registering { .. }));
    assert!(matches!(events[1], UaEvent::RegisterSuccessful { .. }));

    tokio::time::sleep(Duration::from_secs(3589)).await;
    assert_eq!(h.wire.distinct_cseqs(Method::Register).len(), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.wire.distinct_cseqs(Method::Register).len(), 2);
    let refresh = h.wire.last_request(Method::Register);
    assert_eq!(refresh.call_id(), register.call_id());
    assert_eq!(refresh.uri(), register.uri());
}

#[tokio::test(start_paused = true)]
async fn zero_expires_schedules_nothing() {
    let mut h = harness();
    h.ua.register().await.unwrap();
    let register = h.wire.last_request(Method::Register);
    h.reply(
        &register,
        200,
        Some("reg"),
        &[("Contact", "<sip:alice@127.0.0.1:5060>;expires=0")],
    )
    .await;
    assert!(!h.ua.context().state.has_refresh());

    tokio::time::sleep(Duration::from_secs(7200)).await;
    assert_eq!(h.wire.distinct_cseqs(Method::Register).len(), 1);
    assert_eq!(count(&h.drain(), |e| matches!(e, UaEvent::RegisterSuccessful { .. })), 1);
}

#[tokio::test(start_paused = true)]
async fn success_without_contact_still_reports() {
    let mut h = harness();
    h.ua.register().await.unwrap();
    let register = h.wire.last_request(Method::Register);
    h.reply(&register, 200, Some("reg"), &[]).await;

    assert!(h.ua.is_registered());
    assert!(!h.ua.context().state.has_refresh());
    assert_eq!(count(&h.drain(), |e| matches!(e, UaEvent::RegisterSuccessful { .. })), 1);
}

#[tokio::test(start_paused = true)]
async fn unregister_cancels_refresh_and_sends_expires_zero() {
    let mut h = harness();
    assert!(h.ua.unregister().await.is_err());

    h.ua.register().await.unwrap();
    let register = h.wire.last_request(Method::Register);
    h.reply(
        &register,
        200,
        Some("reg"),
        &[("Contact", "<sip:alice@127.0.0.1:5060>;expires=3600")],
    )
    .await;
    assert!(h.ua.context().state.has_refresh());

    h.ua.unregister().await.unwrap();
    assert!(!h.ua.context().state.has_refresh());
    assert!(h.ua.context().state.unregister_invoked());

    let unregister = h.wire.last_request(Method::Register);
    assert_ne!(unregister.call_id(), register.call_id());
    assert_eq!(unregister.header("Expires").unwrap(), "0");
    let contact = NameAddr::parse(unregister.header("Contact").unwrap()).unwrap();
    assert_eq!(contact.param("expires"), Some("0"));

    h.reply(&unregister, 200, Some("reg"), &[]).await;
    assert!(!h.ua.is_registered());
    assert!(!h.ua.context().state.has_refresh());

    tokio::time::sleep(Duration::from_secs(4000)).await;
    assert_eq!(h.wire.distinct_cseqs(Method::Register).len(), 2);
    h.drain();
}

#[tokio::test(start_paused = true)]
async fn second_challenge_fails_without_third_attempt() {
    let mut h = harness();
    h.ua.register().await.unwrap();
    let first = h.wire.last_request(Method::Register);
    assert!(first.header("Authorization").is_none());

    h.reply(&first, 401, Some("reg"), &[WWW_AUTH]).await;
    let retry = h.wire.last_request(Method::Register);
    let authorization = retry.header("Authorization").expect("credentials on retry");
    assert!(authorization.contains("username=\"alice\""));
    assert!(authorization.contains("nonce=\"n0nce\""));

    h.reply(&retry, 401, Some("reg"), &[WWW_AUTH]).await;
    assert_eq!(h.wire.distinct_cseqs(Method::Register).len(), 2);

    let events = h.drain();
    let failures: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            UaEvent::RegisterFailed { response } => Some(response.as_ref().map(|r| r.code())),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![Some(401)]);
    assert!(!h.ua.is_registered());
}

#[tokio::test(start_paused = true)]
async fn challenge_without_password_fails_at_once() {
    let mut h = harness_with(UaConfig {
        password: None,
        ..config()
    });
    h.ua.register().await.unwrap();
    let register = h.wire.last_request(Method::Register);
    h.reply(&register, 401, Some("reg"), &[WWW_AUTH]).await;

    assert_eq!(h.wire.distinct_cseqs(Method::Register).len(), 1);
    assert_eq!(count(&h.drain(), |e| matches!(e, UaEvent::RegisterFailed { .. })), 1);
}

#[tokio::test(start_paused = true)]
async fn learned_received_address_triggers_silent_reregistration() {
    let mut h = harness();
    h.ua.register().await.unwrap();
    let register = h.wire.last_request(Method::Register);

    let mut rejected =
        sip_ua::response::build_generic_response(&register, 403, "Forbidden", Some("reg")).unwrap();
    let via = rejected.headers().get("Via").unwrap().clone();
    rejected
        .headers_mut()
        .set("Via", format!("{via};received=203.0.113.7"));
    h.ua.handle_response(rejected).await;

    let again = h.wire.last_request(Method::Register);
    assert_eq!(h.wire.distinct_cseqs(Method::Register).len(), 2);
    assert_eq!(top_via(again.headers()).unwrap().host, "203.0.113.7");
    assert!(again.header("Contact").unwrap().contains("203.0.113.7"));
    assert_eq!(again.call_id(), register.call_id());
    assert_eq!(count(&h.drain(), |e| matches!(e, UaEvent::RegisterFailed { .. })), 0);

    // Same address again: nothing new to learn, so it fails.
    let mut rejected =
        sip_ua::response::build_generic_response(&again, 403, "Forbidden", Some("reg")).unwrap();
    let via = rejected.headers().get("Via").unwrap().clone();
    rejected
        .headers_mut()
        .set("Via", format!("{via};received=203.0.113.7"));
    h.ua.handle_response(rejected).await;
    assert_eq!(count(&h.drain(), |e| matches!(e, UaEvent::RegisterFailed { .. })), 1);
}

#[tokio::test(start_paused = true)]
async fn received_matching_the_advertised_address_fails() {
    let mut h = harness();
    h.ua.register().await.unwrap();
    let register = h.wire.last_request(Method::Register);
    assert_eq!(top_via(register.headers()).unwrap().host, "127.0.0.1");

    let mut rejected =
        sip_ua::response::build_generic_response(&register, 403, "Forbidden", Some("reg")).unwrap();
    let via = rejected.headers().get("Via").unwrap().clone();
    rejected
        .headers_mut()
        .set("Via", format!("{via};received=127.0.0.1"));
    h.ua.handle_response(rejected).await;

    assert_eq!(h.wire.distinct_cseqs(Method::Register).len(), 1);
    assert_eq!(count(&h.drain(), |e| matches!(e, UaEvent::RegisterFailed { .. })), 1);
    assert!(h.ua.context().state.public_addr().is_none());
}

#[tokio::test(start_paused = true)]
async fn challenged_unregister_keeps_expires_zero() {
    let mut h = harness();
    h.ua.register().await.unwrap();
    let register = h.wire.last_request(Method::Register);
    h.reply(
        &register,
        200,
        Some("reg"),
        &[("Contact", "<sip:alice@127.0.0.1:5060>;expires=3600")],
    )
    .await;

    h.ua.unregister().await.unwrap();
    let unregister = h.wire.last_request(Method::Register);
    h.reply(&unregister, 401, Some("reg"), &[WWW_AUTH]).await;

    let retry = h.wire.last_request(Method::Register);
    assert!(retry.header("Authorization").is_some());
    assert_eq!(retry.call_id(), unregister.call_id());
    assert_eq!(retry.header("Expires").unwrap(), "0");
    let contact = NameAddr::parse(retry.header("Contact").unwrap()).unwrap();
    assert_eq!(contact.param("expires"), Some("0"));

    h.reply(&retry, 200, Some("reg"), &[]).await;
    assert!(!h.ua.is_registered());
    let events = h.drain();
    assert_eq!(count(&events, |e| matches!(e, UaEvent::Registering { .. })), 2);
    assert_eq!(count(&events, |e| matches!(e, UaEvent::RegisterSuccessful { .. })), 2);
}

#[tokio::test(start_paused = true)]
async fn unanswered_register_times_out() {
    let mut h = harness();
    h.ua.register().await.unwrap();
    tokio::time::sleep(Duration::from_secs(33)).await;

    let events = h.drain();
    assert!(events
        .iter()
        .any(|e| matches!(e, UaEvent::RegisterFailed { response: None })));
}
