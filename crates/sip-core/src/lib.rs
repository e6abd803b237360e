// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Core SIP types for the user agent: messages, headers, URIs and the
//! parameterised header values the signaling core reads and writes
//! (`branch`, `tag`, `expires`, `received`).
//!
//! # Examples
//!
//! ```
//! # use sip_core::*;
//! let uri = SipUri::parse("sip:alice@example.com;transport=udp").unwrap();
//! assert_eq!(uri.transport_param(), Some("udp"));
//!
//! let via = ViaHeader::parse("SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK42").unwrap();
//! assert_eq!(via.branch(), Some("z9hG4bK42"));
//! ```

pub mod headers;
pub mod method;
pub mod msg;
pub mod name_addr;
pub mod params;
pub mod uri;
pub mod via;

pub use headers::{Header, Headers};
pub use method::Method;
pub use msg::{MessageError, Request, RequestLine, Response, SipMessage, SipVersion, StatusLine};
pub use name_addr::{tag_of, with_tag, NameAddr};
pub use params::Params;
pub use uri::{SipUri, DEFAULT_SIP_PORT};
pub use via::ViaHeader;
