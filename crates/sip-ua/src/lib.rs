// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIP user agent core: request managers, method handlers and call control.
//!
//! A [`UserAgent`] owns one [`context::MethodContext`] (transaction manager,
//! dialog manager, challenge manager, per-agent counters) shared by the
//! method handlers. User actions go through an initial or mid-dialog request
//! manager into client transactions; inbound packets are matched by the
//! transaction manager and the unmatched requests routed to the handlers.
//! Every outcome reaches the application as a [`UaEvent`].
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use sip_transport::UdpTransport;
//! use sip_ua::{UaConfig, UaEvent, UserAgent};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let (transport, inbound) = UdpTransport::bind("0.0.0.0:5060").await?;
//! let (events, mut rx) = tokio::sync::mpsc::unbounded_channel::<UaEvent>();
//! let ua = Arc::new(UserAgent::new(UaConfig::default(), transport, Arc::new(events))?);
//! ua.clone().spawn_reader(inbound);
//! ua.register().await?;
//! while let Some(event) = rx.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;

use sip_auth::AuthError;
use sip_core::MessageError;
use sip_dialog::DialogError;
use sip_transaction::TransactionError;
use sip_transport::TransportError;
use smol_str::SmolStr;

pub mod challenge;
pub mod config;
pub mod context;
pub mod handlers;
pub mod initial;
pub mod listener;
pub mod media;
pub mod mid_dialog;
pub mod response;
pub mod user_agent;

pub use config::UaConfig;
pub use listener::{SipListener, UaEvent};
pub use media::{MediaSession, NullMedia, SdpProvider};
pub use user_agent::UserAgent;

/// Methods this user agent implements, for `Allow` headers.
pub const ALLOWED_METHODS: &str = "INVITE, ACK, CANCEL, BYE, OPTIONS";

#[derive(Debug)]
pub enum UaError {
    InvalidUri(String),
    MissingHeader(&'static str),
    /// A challenge arrived but no password is configured
    NoCredentials,
    NotRegistered,
    NoSuchCall(SmolStr),
    Message(MessageError),
    Transaction(TransactionError),
    Dialog(DialogError),
    Auth(AuthError),
    Transport(TransportError),
}

impl fmt::Display for UaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UaError::InvalidUri(uri) => write!(f, "invalid SIP URI: {}", uri),
            UaError::MissingHeader(name) => write!(f, "missing {} header", name),
            UaError::NoCredentials => write!(f, "no credentials configured"),
            UaError::NotRegistered => write!(f, "not registered"),
            UaError::NoSuchCall(call_id) => write!(f, "no call {}", call_id),
            UaError::Message(e) => write!(f, "message error: {}", e),
            UaError::Transaction(e) => write!(f, "transaction error: {}", e),
            UaError::Dialog(e) => write!(f, "dialog error: {}", e),
            UaError::Auth(e) => write!(f, "authentication error: {}", e),
            UaError::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

impl std::error::Error for UaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            UaError::Message(e) => Some(e),
            UaError::Transaction(e) => Some(e),
            UaError::Dialog(e) => Some(e),
            UaError::Auth(e) => Some(e),
            UaError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MessageError> for UaError {
    fn from(e: MessageError) -> Self {
        UaError::Message(e)
    }
}

impl From<TransactionError> for UaError {
    fn from(e: TransactionError) -> Self {
        UaError::Transaction(e)
    }
}

impl From<DialogError> for UaError {
    fn from(e: DialogError) -> Self {
        UaError::Dialog(e)
    }
}

impl From<AuthError> for UaError {
    fn from(e: AuthError) -> Self {
        UaError::Auth(e)
    }
}

impl From<TransportError> for UaError {
    fn from(e: TransportError) -> Self {
        UaError::Transport(e)
    }
}
