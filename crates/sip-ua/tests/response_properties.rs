//! Generic responses survive the wire and keep the request's identity.

use bytes::Bytes;
use proptest::prelude::*;
use sip_core::{tag_of, Headers, Method, Request, RequestLine, SipUri};
use sip_parse::{cseq, parse_response, serialize_response};
use sip_ua::response::build_generic_response;

fn request(method: &str, vias: &[String], to_tag: Option<&str>, number: u32) -> Request {
    let mut headers = Headers::new();
    for via in vias {
        headers.push("Via", via.as_str());
    }
    headers.push("From", "<sip:bob@example.com>;tag=b1");
    headers.push(
        "To",
        match to_tag {
            Some(tag) => format!("<sip:alice@example.com>;tag={tag}"),
            None => "<sip:alice@example.com>".to_owned(),
        },
    );
    headers.push("Call-ID", "prop@example.com");
    headers.push("CSeq", format!("{number} {method}"));
    let uri = SipUri::parse("sip:alice@example.com").unwrap();
    Request::new(
        RequestLine::new(Method::from_token(method), uri),
        headers,
        Bytes::new(),
    )
    .unwrap()
}

proptest! {
    #[test]
    fn generic_response_roundtrips(
        method in prop::sample::select(vec!["INVITE", "BYE", "OPTIONS", "CANCEL", "REGISTER"]),
        code in prop::sample::select(vec![100u16, 180, 200, 404, 481, 486, 487, 500]),
        hosts in prop::collection::vec("[a-z]{1,8}", 1..4),
        request_tag in proptest::option::of("[a-z0-9]{4,8}"),
        number in 1u32..100_000,
    ) {
        let vias: Vec<String> = hosts
            .iter()
            .enumerate()
            .map(|(i, host)| format!("SIP/2.0/UDP {host}.example.com;branch=z9hG4bK{i}"))
            .collect();
        let req = request(method, &vias, request_tag.as_deref(), number);

        let response = build_generic_response(&req, code, "Reason", Some("ours")).unwrap();
        let parsed = parse_response(&serialize_response(&response)).expect("parse");

        prop_assert_eq!(parsed.code(), code);
        let parsed_vias: Vec<String> = parsed
            .headers()
            .get_all("Via")
            .map(|v| v.to_string())
            .collect();
        prop_assert_eq!(parsed_vias, vias);
        prop_assert_eq!(parsed.header("From"), req.header("From"));
        prop_assert_eq!(parsed.call_id(), req.call_id());
        prop_assert_eq!(cseq(parsed.headers()), Some((number, Method::from_token(method))));

        // An existing To tag is kept; otherwise ours is added.
        let expected = request_tag.unwrap_or_else(|| "ours".to_owned());
        let tag = tag_of(parsed.header("To").unwrap());
        prop_assert_eq!(tag.as_deref(), Some(expected.as_str()));
    }
}
