// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Registration (RFC 3261 §10), client side only.
//!
//! A successful REGISTER with a non-zero lifetime arms a refresh 10 s before
//! expiry. Unregistering sends `expires=0` from a fresh Call-ID and cancels
//! the refresh. A 4xx-6xx whose Via carries a new `received` address makes
//! the agent adopt it and register again instead of failing, unless it is
//! the address the REGISTER already advertised.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use sip_core::{Method, NameAddr, Request, Response};
use sip_parse::top_via;
use sip_transaction::{schedule, TransactionEvent, TransactionKey, TransactionUser};
use tracing::{debug, info, warn};

use super::is_challenge;
use crate::{
    context::MethodContext,
    initial::{InitialRequestManager, MessageInterceptor},
    listener::UaEvent,
    UaError,
};

/// Lifetime assumed when a 2xx names none.
const DEFAULT_EXPIRES: u64 = 3600;

/// How long before expiry the refresh goes out.
const REFRESH_MARGIN: u64 = 10;

pub struct RegisterHandler {
    ctx: Arc<MethodContext>,
    initial: InitialRequestManager,
    /// Last REGISTER of the current registration, reused by the refresh
    last: Mutex<Option<Request>>,
}

impl RegisterHandler {
    pub fn new(ctx: Arc<MethodContext>) -> Arc<Self> {
        Arc::new(Self {
            initial: InitialRequestManager::new(ctx.clone()),
            ctx,
            last: Mutex::new(None),
        })
    }

    pub async fn register(self: &Arc<Self>) -> Result<(), UaError> {
        let request = self.build(self.registration_call_id())?;
        self.submit(request, None, true).await
    }

    /// Removes the binding. Only valid while registered.
    pub async fn unregister(self: &Arc<Self>) -> Result<(), UaError> {
        if !self.ctx.state.is_registered() {
            return Err(UaError::NotRegistered);
        }
        let call_id = self.ctx.ids.call_id(&self.ctx.local_host());
        let request = self.build(call_id)?;

        let ctx = self.ctx.clone();
        let interceptor = move |request: &mut Request| {
            ctx.state.set_refresh(None);
            ctx.state.set_unregister_invoked(true);
            ctx.challenges.forget();
            let headers = request.headers_mut();
            if let Some(contact) = headers.get_mut("Contact") {
                if let Some(addr) = NameAddr::parse(contact) {
                    *contact = addr.with_param("expires", Some("0")).to_string().into();
                }
            }
            headers.set("Expires", "0");
        };
        self.submit(request, Some(&interceptor), true).await
    }

    fn registration_call_id(&self) -> smol_str::SmolStr {
        let host = self.ctx.local_host();
        self.ctx
            .state
            .registration_call_id(|| self.ctx.ids.call_id(&host))
    }

    fn build(&self, call_id: smol_str::SmolStr) -> Result<Request, UaError> {
        let config = &self.ctx.config;
        self.initial
            .build(Method::Register, config.registrar_uri(), &config.profile_uri(), call_id)
    }

    /// Resets the registration flags and sends through the interceptor.
    async fn submit(
        self: &Arc<Self>,
        request: Request,
        interceptor: Option<&dyn MessageInterceptor>,
        announce: bool,
    ) -> Result<(), UaError> {
        let state = &self.ctx.state;
        state.set_registered(false);
        state.set_unregister_invoked(false);
        self.send_attempt(request, interceptor, false, announce).await
    }

    /// The request as intercepted becomes the one refreshes and challenge
    /// retries start from.
    async fn send_attempt(
        self: &Arc<Self>,
        request: Request,
        interceptor: Option<&dyn MessageInterceptor>,
        challenged: bool,
        announce: bool,
    ) -> Result<(), UaError> {
        self.initial
            .send(request, interceptor, |request| {
                *self.last.lock() = Some(request.clone());
                if announce {
                    self.ctx.emit(UaEvent::Registering {
                        request: request.clone(),
                    });
                }
                let attempt: Arc<dyn TransactionUser> = Arc::new(RegisterAttempt {
                    handler: Arc::downgrade(self),
                    request: request.clone(),
                    challenged,
                });
                attempt
            })
            .await?;
        Ok(())
    }

    /// Re-sends the last REGISTER with a new CSeq. Runs from the refresh timer.
    async fn refresh(self: Arc<Self>) -> Result<(), UaError> {
        let Some(mut request) = self.last.lock().clone() else {
            return Ok(());
        };
        let headers = request.headers_mut();
        headers.set("CSeq", format!("{} REGISTER", self.ctx.state.next_cseq()));
        headers.remove("Authorization");
        headers.remove("Proxy-Authorization");
        debug!(call_id = request.call_id().unwrap_or_default(), "refreshing registration");
        self.submit(request, None, true).await
    }

    async fn on_attempt(self: Arc<Self>, attempt: &RegisterAttempt, event: TransactionEvent) {
        match event {
            TransactionEvent::ProvisionalReceived(_) => {}
            TransactionEvent::SuccessReceived(response) => self.on_success(response),
            TransactionEvent::ErrorReceived(response) if is_challenge(response.code()) => {
                if attempt.challenged || !self.ctx.challenges.has_credentials() {
                    self.failed(Some(response));
                    return;
                }
                let retry = match self
                    .ctx
                    .challenges
                    .retry_with_credentials(&attempt.request, &response)
                {
                    Ok(retry) => retry,
                    Err(e) => {
                        warn!(error = %e, "cannot answer registrar challenge");
                        self.failed(Some(response));
                        return;
                    }
                };
                if let Err(e) = self.send_attempt(retry, None, true, false).await {
                    warn!(error = %e, "REGISTER retry failed");
                    self.failed(None);
                }
            }
            TransactionEvent::ErrorReceived(response) => {
                let received = top_via(response.headers())
                    .and_then(|via| via.received().map(str::to_owned));
                let advertised = top_via(attempt.request.headers()).map(|via| via.host);
                match received {
                    Some(addr)
                        if advertised.as_deref() != Some(addr.as_str())
                            && self.ctx.state.learn_public_addr(&addr) =>
                    {
                        info!(public_addr = %addr, code = response.code(), "registering again from learned address");
                        let request = match self.build(self.registration_call_id()) {
                            Ok(request) => request,
                            Err(e) => {
                                warn!(error = %e, "cannot rebuild REGISTER");
                                self.failed(Some(response));
                                return;
                            }
                        };
                        if let Err(e) = self.submit(request, None, false).await {
                            warn!(error = %e, "REGISTER from learned address failed");
                            self.failed(Some(response));
                        }
                    }
                    _ => self.failed(Some(response)),
                }
            }
            TransactionEvent::Timeout | TransactionEvent::TransportError => self.failed(None),
        }
    }

    fn on_success(self: &Arc<Self>, response: Response) {
        let state = &self.ctx.state;
        if state.unregister_invoked() {
            info!("unregistered");
            state.set_registered(false);
            state.set_refresh(None);
            self.ctx.emit(UaEvent::RegisterSuccessful { response });
            return;
        }

        state.set_registered(true);
        match granted_expires(&response) {
            Some(expires) if expires > 0 => {
                let delay = Duration::from_secs(expires.saturating_sub(REFRESH_MARGIN).max(1));
                let weak = Arc::downgrade(self);
                let handle = schedule(delay, async move {
                    if let Some(handler) = weak.upgrade() {
                        if let Err(e) = handler.refresh().await {
                            warn!(error = %e, "registration refresh failed");
                        }
                    }
                });
                state.set_refresh(Some(handle));
                info!(expires, refresh_in = ?delay, "registered");
            }
            _ => {
                state.set_refresh(None);
                info!("registered without refresh");
            }
        }
        self.ctx.emit(UaEvent::RegisterSuccessful { response });
    }

    fn failed(&self, response: Option<Response>) {
        warn!(code = response.as_ref().map(Response::code), "registration failed");
        self.ctx.state.set_registered(false);
        self.ctx.emit(UaEvent::RegisterFailed { response });
    }
}

/// Lifetime granted by a 2xx: the Contact `expires` parameter, else the
/// Expires header, else the default. `None` when the 2xx lists no Contact.
fn granted_expires(response: &Response) -> Option<u64> {
    let contact = NameAddr::parse(response.header("Contact")?)?;
    let expires = contact
        .param("expires")
        .or_else(|| response.header("Expires").map(|v| v.as_str()))
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(DEFAULT_EXPIRES);
    Some(expires)
}

struct RegisterAttempt {
    handler: Weak<RegisterHandler>,
    request: Request,
    challenged: bool,
}

#[async_trait]
impl TransactionUser for RegisterAttempt {
    async fn on_event(&self, _key: &TransactionKey, event: TransactionEvent) {
        if let Some(handler) = self.handler.upgrade() {
            handler.on_attempt(self, event).await;
        }
    }
}
