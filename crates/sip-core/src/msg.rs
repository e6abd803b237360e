// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;

use bytes::Bytes;
use smol_str::SmolStr;

use crate::{headers::Headers, method::Method, uri::SipUri};

const MAX_REASON_LENGTH: usize = 256;
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024; // 10MB

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    InvalidStatusCode { code: u16 },
    ReasonTooLong { max: usize, actual: usize },
    InvalidReason(String),
    BodyTooLarge { max: usize, actual: usize },
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidStatusCode { code } => {
                write!(f, "invalid SIP status code: {} (must be 100-699)", code)
            }
            Self::ReasonTooLong { max, actual } => {
                write!(f, "reason phrase too long (max {}, got {})", max, actual)
            }
            Self::InvalidReason(msg) => write!(f, "invalid reason phrase: {}", msg),
            Self::BodyTooLarge { max, actual } => {
                write!(f, "body too large (max {}, got {})", max, actual)
            }
        }
    }
}

impl std::error::Error for MessageError {}

/// SIP version supported by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SipVersion {
    V2,
}

impl SipVersion {
    pub const fn as_str(self) -> &'static str {
        match self {
            SipVersion::V2 => "SIP/2.0",
        }
    }
}

impl fmt::Display for SipVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First line of a SIP request: `Method SP Request-URI SP SIP-Version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    method: Method,
    uri: SipUri,
    version: SipVersion,
}

impl RequestLine {
    /// Creates a request line for the given method and target URI.
    pub fn new(method: Method, uri: SipUri) -> Self {
        Self {
            method,
            uri,
            version: SipVersion::V2,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &SipUri {
        &self.uri
    }

    pub fn version(&self) -> SipVersion {
        self.version
    }
}

/// First line of a SIP response: `SIP-Version SP Status-Code SP Reason-Phrase`.
///
/// The status code must be in 100-699 and the reason phrase may not carry
/// control characters, so a CRLF can never be smuggled into the wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    version: SipVersion,
    code: u16,
    reason: SmolStr,
}

impl StatusLine {
    /// Creates a status line with the provided code and reason phrase.
    ///
    /// ```
    /// use sip_core::StatusLine;
    ///
    /// let status = StatusLine::new(200, "OK").unwrap();
    /// assert_eq!(status.code(), 200);
    /// assert!(StatusLine::new(99, "Invalid").is_err());
    /// assert!(StatusLine::new(200, "OK\r\nInjected").is_err());
    /// ```
    pub fn new(code: u16, reason: impl AsRef<str>) -> Result<Self, MessageError> {
        if !(100..=699).contains(&code) {
            return Err(MessageError::InvalidStatusCode { code });
        }

        let reason = reason.as_ref();
        validate_reason_phrase(reason)?;

        Ok(Self {
            version: SipVersion::V2,
            code,
            reason: SmolStr::new(reason),
        })
    }

    pub fn version(&self) -> SipVersion {
        self.version
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// In-memory representation of a SIP request message.
///
/// Headers may be edited while the request is being built; once it has been
/// handed to a transaction it is only ever cloned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    start: RequestLine,
    headers: Headers,
    body: Bytes,
}

impl Request {
    /// Builds a request from its components, rejecting oversized bodies.
    pub fn new(start: RequestLine, headers: Headers, body: Bytes) -> Result<Self, MessageError> {
        validate_body_size(&body)?;

        Ok(Self {
            start,
            headers,
            body,
        })
    }

    pub fn start_line(&self) -> &RequestLine {
        &self.start
    }

    pub fn method(&self) -> &Method {
        self.start.method()
    }

    pub fn uri(&self) -> &SipUri {
        self.start.uri()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Shorthand for the first value of a header.
    pub fn header(&self, name: &str) -> Option<&SmolStr> {
        self.headers.get(name)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID").map(|v| v.as_str().trim())
    }

    pub fn set_uri(&mut self, uri: SipUri) {
        self.start.uri = uri;
    }

    /// Sets the message body.
    pub fn set_body(&mut self, body: Bytes) -> Result<(), MessageError> {
        validate_body_size(&body)?;
        self.body = body;
        Ok(())
    }

    /// Consumes self and returns the components.
    pub fn into_parts(self) -> (RequestLine, Headers, Bytes) {
        (self.start, self.headers, self.body)
    }
}

/// In-memory representation of a SIP response message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    start: StatusLine,
    headers: Headers,
    body: Bytes,
}

impl Response {
    /// Builds a response from its components, rejecting oversized bodies.
    pub fn new(start: StatusLine, headers: Headers, body: Bytes) -> Result<Self, MessageError> {
        validate_body_size(&body)?;

        Ok(Self {
            start,
            headers,
            body,
        })
    }

    pub fn start_line(&self) -> &StatusLine {
        &self.start
    }

    pub fn code(&self) -> u16 {
        self.start.code()
    }

    pub fn reason(&self) -> &str {
        self.start.reason()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn header(&self, name: &str) -> Option<&SmolStr> {
        self.headers.get(name)
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID").map(|v| v.as_str().trim())
    }

    /// Returns true if this is an informational response (1xx).
    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.code())
    }

    /// Returns true if this is a success response (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code())
    }

    /// Returns true for any final response (>= 200).
    pub fn is_final(&self) -> bool {
        self.code() >= 200
    }

    pub fn set_body(&mut self, body: Bytes) -> Result<(), MessageError> {
        validate_body_size(&body)?;
        self.body = body;
        Ok(())
    }

    pub fn into_parts(self) -> (StatusLine, Headers, Bytes) {
        (self.start, self.headers, self.body)
    }
}

/// Either a SIP request or response message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(Request),
    Response(Response),
}

impl SipMessage {
    pub fn is_request(&self) -> bool {
        matches!(self, Self::Request(_))
    }

    pub fn headers(&self) -> &Headers {
        match self {
            Self::Request(req) => req.headers(),
            Self::Response(res) => res.headers(),
        }
    }

    pub fn body(&self) -> &Bytes {
        match self {
            Self::Request(req) => req.body(),
            Self::Response(res) => res.body(),
        }
    }
}

impl From<Request> for SipMessage {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

impl From<Response> for SipMessage {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

fn validate_reason_phrase(reason: &str) -> Result<(), MessageError> {
    if reason.len() > MAX_REASON_LENGTH {
        return Err(MessageError::ReasonTooLong {
            max: MAX_REASON_LENGTH,
            actual: reason.len(),
        });
    }

    // Reason phrase is UTF8-TEXT which excludes control characters
    if reason.chars().any(|c| c.is_ascii_control()) {
        return Err(MessageError::InvalidReason(
            "contains control characters".to_string(),
        ));
    }

    Ok(())
}

fn validate_body_size(body: &Bytes) -> Result<(), MessageError> {
    if body.len() > MAX_BODY_SIZE {
        return Err(MessageError::BodyTooLarge {
            max: MAX_BODY_SIZE,
            actual: body.len(),
        });
    }
    Ok(())
}
