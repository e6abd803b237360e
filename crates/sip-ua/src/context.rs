// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Capabilities shared by the request managers and method handlers.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use sip_core::{Request, SipUri, ViaHeader};
use sip_dialog::DialogManager;
use sip_transaction::{IdGenerator, ServerTransactionHandle, TimerHandle, TransactionManager};
use sip_transport::{TransportKind, TransportPort};
use smol_str::SmolStr;

use crate::{
    challenge::ChallengeManager,
    listener::{SipListener, UaEvent},
    media::{MediaSession, SdpProvider},
    UaConfig,
};

/// Everything a handler may touch, injected once per user agent.
pub struct MethodContext {
    pub config: UaConfig,
    pub outbound_proxy: Option<SipUri>,
    pub transport: Arc<dyn TransportPort>,
    pub transactions: TransactionManager,
    pub dialogs: DialogManager,
    pub challenges: ChallengeManager,
    pub ids: Arc<IdGenerator>,
    pub state: UaState,
    pub listener: Arc<dyn SipListener>,
    pub media: Arc<dyn MediaSession>,
    pub sdp: Arc<dyn SdpProvider>,
}

impl MethodContext {
    /// Host advertised in Via and Contact.
    pub fn local_host(&self) -> SmolStr {
        if let Some(addr) = self.state.public_addr() {
            return addr;
        }
        SmolStr::new(
            self.config
                .public_ip
                .as_deref()
                .unwrap_or(self.config.local_ip.as_str()),
        )
    }

    /// A Via value with a fresh branch.
    pub fn via(&self, transport: TransportKind) -> SmolStr {
        let via = ViaHeader::new(
            transport.via_transport(),
            &self.local_host(),
            Some(self.config.sip_port),
        )
        .with_branch(&self.ids.branch());
        SmolStr::new(via.to_string())
    }

    pub fn contact(&self) -> SmolStr {
        let uri = SipUri::new(self.local_host())
            .with_user(self.config.user.as_str())
            .with_port(self.config.sip_port);
        SmolStr::new(format!("<{}>", uri))
    }

    pub fn emit(&self, event: UaEvent) {
        self.listener.on_event(event);
    }
}

/// An incoming INVITE waiting for `accept_call` or `reject_call`.
#[derive(Clone)]
pub struct PendingInvite {
    pub handle: ServerTransactionHandle,
    pub request: Request,
    pub local_tag: SmolStr,
}

/// Mutable runtime state of one user agent.
pub struct UaState {
    cseq: AtomicU32,
    public_addr: RwLock<Option<SmolStr>>,
    registered: AtomicBool,
    unregister_invoked: AtomicBool,
    refresh: Mutex<Option<TimerHandle>>,
    registration_call_id: Mutex<Option<SmolStr>>,
    /// Remote party of each active call, by Call-ID
    pub peers: DashMap<SmolStr, SmolStr>,
    /// Calls the user hung up; late answers get ACK plus BYE
    pub closed_calls: DashSet<SmolStr>,
    /// Closed calls whose INVITE had no provisional yet; CANCEL waits for one
    pub deferred_cancels: DashSet<SmolStr>,
    pub pending_invites: DashMap<SmolStr, PendingInvite>,
    /// Offers of answered incoming calls, held until their ACK starts media
    pub offers: DashMap<SmolStr, Bytes>,
}

impl UaState {
    pub fn new() -> Self {
        Self {
            cseq: AtomicU32::new(1),
            public_addr: RwLock::new(None),
            registered: AtomicBool::new(false),
            unregister_invoked: AtomicBool::new(false),
            refresh: Mutex::new(None),
            registration_call_id: Mutex::new(None),
            peers: DashMap::new(),
            closed_calls: DashSet::new(),
            deferred_cancels: DashSet::new(),
            pending_invites: DashMap::new(),
            offers: DashMap::new(),
        }
    }

    /// CSeq number for the next initial request.
    pub fn next_cseq(&self) -> u32 {
        self.cseq.fetch_add(1, Ordering::Relaxed)
    }

    pub fn public_addr(&self) -> Option<SmolStr> {
        self.public_addr.read().clone()
    }

    /// Stores an address learned from a `received` Via parameter. Returns
    /// false when it was already known.
    pub fn learn_public_addr(&self, addr: &str) -> bool {
        let mut current = self.public_addr.write();
        if current.as_deref() == Some(addr) {
            return false;
        }
        *current = Some(SmolStr::new(addr));
        true
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::SeqCst);
    }

    pub fn unregister_invoked(&self) -> bool {
        self.unregister_invoked.load(Ordering::SeqCst)
    }

    pub fn set_unregister_invoked(&self, invoked: bool) {
        self.unregister_invoked.store(invoked, Ordering::SeqCst);
    }

    /// Replaces the pending refresh timer; the old one is cancelled.
    pub fn set_refresh(&self, handle: Option<TimerHandle>) {
        *self.refresh.lock() = handle;
    }

    pub fn has_refresh(&self) -> bool {
        self.refresh
            .lock()
            .as_ref()
            .is_some_and(TimerHandle::is_pending)
    }

    /// Call-ID reused by every REGISTER of one registration.
    pub fn registration_call_id(&self, fresh: impl FnOnce() -> SmolStr) -> SmolStr {
        self.registration_call_id
            .lock()
            .get_or_insert_with(fresh)
            .clone()
    }

    pub fn clear(&self) {
        self.set_refresh(None);
        self.peers.clear();
        self.closed_calls.clear();
        self.deferred_cancels.clear();
        self.pending_invites.clear();
        self.offers.clear();
    }
}

impl Default for UaState {
    fn default() -> Self {
        Self::new()
    }
}
