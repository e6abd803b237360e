// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;

use smol_str::SmolStr;

use crate::params::Params;

/// Parsed representation of a Via header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaHeader {
    /// Transport token of the sent-protocol (`UDP`, `TCP`, ...).
    pub transport: SmolStr,
    pub host: SmolStr,
    pub port: Option<u16>,
    pub params: Params,
}

impl ViaHeader {
    pub fn new(transport: &str, host: &str, port: Option<u16>) -> Self {
        Self {
            transport: SmolStr::new(transport.to_ascii_uppercase()),
            host: SmolStr::new(host),
            port,
            params: Params::new(),
        }
    }

    /// Parses `SIP/2.0/UDP host:port;params`.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let (protocol, rest) = input.split_once(char::is_whitespace)?;
        let transport = protocol.rsplit('/').next()?.trim();
        if transport.is_empty() {
            return None;
        }
        let rest = rest.trim_start();
        let (sent_by, params) = match rest.split_once(';') {
            Some((sent_by, params)) => (sent_by.trim(), Params::parse(params)),
            None => (rest.trim(), Params::new()),
        };
        let (host, port) = if let Some(v6) = sent_by.strip_prefix('[') {
            let end = v6.find(']')?;
            let port = v6[end + 1..].strip_prefix(':').and_then(|p| p.parse().ok());
            (&v6[..end], port)
        } else {
            match sent_by.split_once(':') {
                Some((host, port)) => (host, Some(port.trim().parse().ok()?)),
                None => (sent_by, None),
            }
        };
        if host.is_empty() {
            return None;
        }
        Some(Self {
            transport: SmolStr::new(transport.to_ascii_uppercase()),
            host: SmolStr::new(host),
            port,
            params,
        })
    }

    pub fn branch(&self) -> Option<&str> {
        self.params.get("branch").filter(|b| !b.is_empty())
    }

    /// The `received` parameter a server adds when the source address differs
    /// from the sent-by host.
    pub fn received(&self) -> Option<&str> {
        self.params
            .get("received")
            .map(str::trim)
            .filter(|r| !r.is_empty())
    }

    pub fn with_branch(mut self, branch: &str) -> Self {
        self.params.set("branch", Some(branch));
        self
    }
}

impl fmt::Display for ViaHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} ", self.transport)?;
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.params)
    }
}
