// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::BTreeMap;
use std::fmt;

use percent_encoding::percent_decode_str;
use smol_str::SmolStr;

use crate::params::Params;

/// Default port for `sip:` URIs (RFC 3261 §19.1.2).
pub const DEFAULT_SIP_PORT: u16 = 5060;

/// Parsed representation of a SIP URI (RFC 3261 §19).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipUri {
    pub sips: bool,
    pub user: Option<SmolStr>,
    pub host: SmolStr,
    pub port: Option<u16>,
    pub params: Params,
    pub headers: BTreeMap<SmolStr, SmolStr>,
}

impl SipUri {
    /// Constructs a `sip:` URI with the given host and default settings.
    pub fn new(host: impl Into<SmolStr>) -> Self {
        Self {
            sips: false,
            user: None,
            host: host.into(),
            port: None,
            params: Params::new(),
            headers: BTreeMap::new(),
        }
    }

    /// Builder-style helper setting the user part.
    pub fn with_user(mut self, user: impl Into<SmolStr>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Attempts to parse a SIP or SIPS URI from the provided string.
    pub fn parse(input: &str) -> Option<Self> {
        let (scheme, rest) = input.trim().split_once(':')?;
        let sips = scheme.eq_ignore_ascii_case("sips");
        if !sips && !scheme.eq_ignore_ascii_case("sip") {
            return None;
        }

        let (addr_part, headers_part) = match rest.split_once('?') {
            Some((addr, headers)) => (addr, Some(headers)),
            None => (rest, None),
        };

        let (base, params) = match addr_part.split_once(';') {
            Some((base, params)) => (base.trim(), Params::parse(params)),
            None => (addr_part.trim(), Params::new()),
        };

        let (user, host_port) = match base.rsplit_once('@') {
            Some((user, host)) => (
                percent_decode_str(user.trim())
                    .decode_utf8()
                    .ok()
                    .map(|s| SmolStr::new(s.as_ref())),
                host.trim(),
            ),
            None => (None, base),
        };

        if host_port.is_empty() {
            return None;
        }

        let (host, port) = split_host_port(host_port)?;
        if host.is_empty() {
            return None;
        }
        let host = percent_decode_str(host)
            .decode_utf8()
            .ok()?
            .to_ascii_lowercase();

        let mut headers = BTreeMap::new();
        if let Some(headers_part) = headers_part {
            for pair in headers_part.split('&') {
                if let Some((k, v)) = pair.split_once('=') {
                    headers.insert(SmolStr::new(k.trim()), SmolStr::new(v.trim()));
                }
            }
        }

        Some(Self {
            sips,
            user,
            host: SmolStr::new(host),
            port,
            params,
            headers,
        })
    }

    /// Returns the explicit port or the scheme default.
    pub fn port_or_default(&self) -> u16 {
        match (self.port, self.sips) {
            (Some(port), _) => port,
            (None, true) => 5061,
            (None, false) => DEFAULT_SIP_PORT,
        }
    }

    /// Value of the `transport=` URI parameter, if present.
    pub fn transport_param(&self) -> Option<&str> {
        self.params.get("transport")
    }

    /// Returns the URI without parameters or headers (`sip:user@host:port`).
    pub fn addr_spec(&self) -> SipUri {
        Self {
            params: Params::new(),
            headers: BTreeMap::new(),
            ..self.clone()
        }
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.sips { "sips:" } else { "sip:" })?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.params)?;
        for (idx, (name, value)) in self.headers.iter().enumerate() {
            let sep = if idx == 0 { '?' } else { '&' };
            write!(f, "{}{}={}", sep, name, value)?;
        }
        Ok(())
    }
}

/// Splits a host[:port] or IPv6 literal "[host]:port" string.
fn split_host_port(input: &str) -> Option<(&str, Option<u16>)> {
    if let Some(stripped) = input.strip_prefix('[') {
        let end = stripped.find(']')?;
        let host = &stripped[..end];
        let remainder = &stripped[end + 1..];
        match remainder.strip_prefix(':') {
            Some(port) => Some((host, Some(port.parse().ok()?))),
            None => Some((host, None)),
        }
    } else if let Some(idx) = input.rfind(':') {
        if input.matches(':').count() > 1 {
            return None;
        }
        let (host, port_str) = input.split_at(idx);
        let port = port_str[1..].parse().ok()?;
        Some((host, Some(port)))
    } else {
        Some((input, None))
    }
}
