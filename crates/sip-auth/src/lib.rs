// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Client-side SIP Digest authentication (RFC 3261 §22, RFC 7616).
//!
//! - **Algorithms**: MD5, SHA-256, SHA-512
//! - **Quality of Protection (qop)**: none, auth, auth-int
//! - **Nonce counting**: `nc` restarts at 1 for each new nonce
//!
//! # Examples
//!
//! ```
//! # use sip_auth::*;
//! # use sip_core::Method;
//! let challenge = DigestChallenge::parse(
//!     "Digest realm=\"example.com\", nonce=\"abc\", qop=\"auth\"",
//!     false,
//! )
//! .unwrap();
//! let mut client = DigestClient::new("alice", "secret");
//! let value = client.authorize(&challenge, &Method::Register, "sip:example.com", b"");
//! assert!(value.starts_with("Digest username=\"alice\""));
//! assert_eq!(challenge.authorization_header(), "Authorization");
//! ```

use std::fmt;

use rand::{distributions::Alphanumeric, thread_rng, Rng};
use sha2::{Digest, Sha256, Sha512};
use sip_core::{Method, Response};
use smol_str::SmolStr;

/// Digest algorithm per RFC 7616.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha512 => "SHA-512",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MD5" => Some(DigestAlgorithm::Md5),
            "SHA-256" => Some(DigestAlgorithm::Sha256),
            "SHA-512" | "SHA-512-256" => Some(DigestAlgorithm::Sha512),
            _ => None,
        }
    }

    fn hash(&self, data: &[u8]) -> String {
        match self {
            DigestAlgorithm::Md5 => format!("{:x}", md5::compute(data)),
            DigestAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
            DigestAlgorithm::Sha512 => hex::encode(Sha512::digest(data)),
        }
    }
}

/// Quality of Protection (qop) options per RFC 7616.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qop {
    Auth,
    AuthInt,
}

impl Qop {
    pub fn as_str(&self) -> &'static str {
        match self {
            Qop::Auth => "auth",
            Qop::AuthInt => "auth-int",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auth" => Some(Qop::Auth),
            "auth-int" => Some(Qop::AuthInt),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    NotDigest,
    MissingParam(&'static str),
    /// A 401/407 without its WWW-Authenticate/Proxy-Authenticate header
    MissingChallenge(&'static str),
    NotAChallenge(u16),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::NotDigest => write!(f, "not a Digest challenge"),
            AuthError::MissingParam(name) => write!(f, "challenge has no {}", name),
            AuthError::MissingChallenge(header) => write!(f, "response has no {} header", header),
            AuthError::NotAChallenge(code) => write!(f, "{} is not a 401 or 407", code),
        }
    }
}

impl std::error::Error for AuthError {}

/// A parsed WWW-Authenticate or Proxy-Authenticate Digest challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: SmolStr,
    pub nonce: SmolStr,
    pub algorithm: DigestAlgorithm,
    /// Preferred qop among those offered; `auth` wins over `auth-int`
    pub qop: Option<Qop>,
    pub opaque: Option<SmolStr>,
    pub stale: bool,
    /// Came from a 407 (Proxy-Authenticate)
    pub proxy: bool,
}

impl DigestChallenge {
    pub fn parse(value: &str, proxy: bool) -> Result<Self, AuthError> {
        let value = value.trim();
        let params = match value.split_once(char::is_whitespace) {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("Digest") => rest,
            _ => return Err(AuthError::NotDigest),
        };

        let mut realm = None;
        let mut nonce = None;
        let mut algorithm = DigestAlgorithm::Md5;
        let mut qop = None;
        let mut opaque = None;
        let mut stale = false;

        for (name, value) in split_params(params) {
            match name.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(SmolStr::new(value)),
                "nonce" => nonce = Some(SmolStr::new(value)),
                "algorithm" => {
                    if let Some(parsed) = DigestAlgorithm::parse(&value) {
                        algorithm = parsed;
                    }
                }
                "qop" => {
                    let offered: Vec<Qop> = value.split(',').filter_map(Qop::parse).collect();
                    qop = if offered.contains(&Qop::Auth) {
                        Some(Qop::Auth)
                    } else {
                        offered.first().copied()
                    };
                }
                "opaque" => opaque = Some(SmolStr::new(value)),
                "stale" => stale = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }

        Ok(Self {
            realm: realm.ok_or(AuthError::MissingParam("realm"))?,
            nonce: nonce.ok_or(AuthError::MissingParam("nonce"))?,
            algorithm,
            qop,
            opaque,
            stale,
            proxy,
        })
    }

    /// Reads the challenge carried by a 401 or 407 response.
    pub fn from_response(response: &Response) -> Result<Self, AuthError> {
        let (header, proxy) = match response.code() {
            401 => ("WWW-Authenticate", false),
            407 => ("Proxy-Authenticate", true),
            code => return Err(AuthError::NotAChallenge(code)),
        };
        let value = response
            .header(header)
            .ok_or(AuthError::MissingChallenge(header))?;
        Self::parse(value, proxy)
    }

    /// Header the answer to this challenge goes in.
    pub fn authorization_header(&self) -> &'static str {
        if self.proxy {
            "Proxy-Authorization"
        } else {
            "Authorization"
        }
    }
}

/// Splits `name=value, name="quoted, value"` pairs.
fn split_params(input: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    let bytes = input.as_bytes();
    for idx in 0..=bytes.len() {
        let at_end = idx == bytes.len();
        if !at_end && bytes[idx] == b'"' {
            in_quotes = !in_quotes;
            continue;
        }
        if at_end || (bytes[idx] == b',' && !in_quotes) {
            let part = input[start..idx].trim();
            if let Some((name, value)) = part.split_once('=') {
                let value = value.trim();
                let value = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .unwrap_or(value);
                out.push((name.trim().to_owned(), value.to_owned()));
            }
            start = idx + 1;
        }
    }
    out
}

/// Client-side authentication helper for generating Authorization headers.
#[derive(Debug, Clone)]
pub struct DigestClient {
    pub username: SmolStr,
    password: SmolStr,
    nonce: Option<SmolStr>,
    nc: u32,
}

impl DigestClient {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: SmolStr::new(username),
            password: SmolStr::new(password),
            nonce: None,
            nc: 0,
        }
    }

    /// Nonce count of the last authorization generated.
    pub fn nonce_count(&self) -> u32 {
        self.nc
    }

    /// Answers `challenge` for a request, returning the header value.
    ///
    /// Answering the same nonce again increments `nc`; a new nonce resets it.
    pub fn authorize(
        &mut self,
        challenge: &DigestChallenge,
        method: &Method,
        uri: &str,
        body: &[u8],
    ) -> SmolStr {
        if self.nonce.as_deref() != Some(challenge.nonce.as_str()) {
            self.nonce = Some(challenge.nonce.clone());
            self.nc = 0;
        }
        self.nc += 1;
        let nc = format!("{:08x}", self.nc);
        let cnonce: String = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();

        let response = self.response_for(challenge, method.as_str(), uri, &nc, &cnonce, body);

        let mut auth = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm={}",
            self.username,
            challenge.realm,
            challenge.nonce,
            uri,
            response,
            challenge.algorithm.as_str()
        );
        if let Some(qop) = challenge.qop {
            auth.push_str(&format!(", qop={}, nc={}, cnonce=\"{}\"", qop.as_str(), nc, cnonce));
        }
        if let Some(opaque) = &challenge.opaque {
            auth.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        SmolStr::new(auth)
    }

    /// The `response=` digest. `nc` and `cnonce` only count when the
    /// challenge carries a qop.
    pub fn response_for(
        &self,
        challenge: &DigestChallenge,
        method: &str,
        uri: &str,
        nc: &str,
        cnonce: &str,
        body: &[u8],
    ) -> String {
        let algorithm = challenge.algorithm;
        let ha1 = algorithm.hash(
            format!("{}:{}:{}", self.username, challenge.realm, self.password).as_bytes(),
        );
        let ha2_input = match challenge.qop {
            Some(Qop::AuthInt) => format!("{}:{}:{}", method, uri, algorithm.hash(body)),
            _ => format!("{}:{}", method, uri),
        };
        let ha2 = algorithm.hash(ha2_input.as_bytes());

        let final_input = match challenge.qop {
            Some(qop) => format!(
                "{}:{}:{}:{}:{}:{}",
                ha1,
                challenge.nonce,
                nc,
                cnonce,
                qop.as_str(),
                ha2
            ),
            None => format!("{}:{}:{}", ha1, challenge.nonce, ha2),
        };
        algorithm.hash(final_input.as_bytes())
    }
}
