// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Notifications from the user agent to the application.

use sip_core::{Request, Response};
use smol_str::SmolStr;
use tokio::sync::mpsc::UnboundedSender;

/// One-way notification. `None` responses mean the attempt ended without
/// one (timeout or transport failure).
#[derive(Debug, Clone)]
pub enum UaEvent {
    Registering { request: Request },
    RegisterSuccessful { response: Response },
    RegisterFailed { response: Option<Response> },
    IncomingCall { call_id: SmolStr, request: Request },
    Ringing { call_id: SmolStr, response: Response },
    CalleePickup { call_id: SmolStr, response: Response },
    RemoteHangup { call_id: SmolStr, request: Request },
    Error { call_id: SmolStr, response: Option<Response> },
}

impl UaEvent {
    pub fn call_id(&self) -> Option<&str> {
        match self {
            UaEvent::IncomingCall { call_id, .. }
            | UaEvent::Ringing { call_id, .. }
            | UaEvent::CalleePickup { call_id, .. }
            | UaEvent::RemoteHangup { call_id, .. }
            | UaEvent::Error { call_id, .. } => Some(call_id),
            UaEvent::Registering { .. }
            | UaEvent::RegisterSuccessful { .. }
            | UaEvent::RegisterFailed { .. } => None,
        }
    }
}

/// Receiver of [`UaEvent`]s. Called inline from protocol handling, so
/// implementations must not block.
pub trait SipListener: Send + Sync {
    fn on_event(&self, event: UaEvent);
}

impl SipListener for UnboundedSender<UaEvent> {
    fn on_event(&self, event: UaEvent) {
        // A closed channel means nobody listens any more.
        let _ = self.send(event);
    }
}
