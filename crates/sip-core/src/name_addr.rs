// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;

use smol_str::SmolStr;

use crate::{params::Params, uri::SipUri};

/// Generic SIP name-addr structure used by From/To/Contact/Route.
///
/// `params` are the header parameters (`tag`, `expires`, ...), not the URI
/// parameters. Without angle brackets everything after the first `;`
/// belongs to the header (RFC 3261 §20.10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<SmolStr>,
    pub uri: SipUri,
    pub params: Params,
}

impl NameAddr {
    pub fn new(uri: SipUri) -> Self {
        Self {
            display_name: None,
            uri,
            params: Params::new(),
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if let Some(open) = input.find('<') {
            let close = open + input[open..].find('>')?;
            let display = input[..open].trim();
            let uri = SipUri::parse(&input[open + 1..close])?;
            let rest = input[close + 1..].trim_start();
            let params = match rest.strip_prefix(';') {
                Some(params) => Params::parse(params),
                None => Params::new(),
            };
            Some(Self {
                display_name: (!display.is_empty()).then(|| SmolStr::new(display)),
                uri,
                params,
            })
        } else {
            let (uri, params) = match input.split_once(';') {
                Some((uri, params)) => (uri, Params::parse(params)),
                None => (input, Params::new()),
            };
            Some(Self {
                display_name: None,
                uri: SipUri::parse(uri)?,
                params,
            })
        }
    }

    pub fn tag(&self) -> Option<&str> {
        self.params.get("tag").filter(|tag| !tag.is_empty())
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    pub fn with_param(mut self, name: &str, value: Option<&str>) -> Self {
        self.params.set(name, value);
        self
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(display) = &self.display_name {
            write!(f, "{} ", display)?;
        }
        write!(f, "<{}>{}", self.uri, self.params)
    }
}

/// Returns the `tag` parameter of a From/To header value.
pub fn tag_of(value: &str) -> Option<SmolStr> {
    NameAddr::parse(value)?.tag().map(SmolStr::new)
}

/// Appends `;tag=` to a From/To header value, leaving the rest of the text as is.
///
/// Values that already carry a tag are returned unchanged.
pub fn with_tag(value: &str, tag: &str) -> SmolStr {
    match NameAddr::parse(value) {
        Some(addr) if addr.tag().is_some() => SmolStr::new(value),
        _ => SmolStr::new(format!("{};tag={}", value.trim_end(), tag)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bracketed_value_with_display_name() {
        let addr = NameAddr::parse("\"Alice\" <sip:alice@example.com;transport=udp>;tag=1928301774")
            .unwrap();
        assert_eq!(addr.display_name.as_deref(), Some("\"Alice\""));
        assert_eq!(addr.uri.transport_param(), Some("udp"));
        assert_eq!(addr.tag(), Some("1928301774"));
    }

    #[test]
    fn bare_uri_params_belong_to_the_header() {
        let addr = NameAddr::parse("sip:bob@example.com;tag=abc").unwrap();
        assert_eq!(addr.uri.to_string(), "sip:bob@example.com");
        assert_eq!(addr.tag(), Some("abc"));
    }

    #[test]
    fn with_tag_appends_once() {
        let to = "<sip:bob@example.com>";
        let tagged = with_tag(to, "x1");
        assert_eq!(tagged.as_str(), "<sip:bob@example.com>;tag=x1");
        assert_eq!(with_tag(&tagged, "x2"), tagged);
        assert_eq!(tag_of(&tagged).as_deref(), Some("x1"));
    }

    #[test]
    fn renders_contact_with_expires() {
        let contact = NameAddr::parse("<sip:alice@10.0.0.1:5060>")
            .unwrap()
            .with_param("expires", Some("0"));
        assert_eq!(contact.to_string(), "<sip:alice@10.0.0.1:5060>;expires=0");
    }
}
