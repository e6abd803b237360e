// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! INVITE handling for both roles.
//!
//! UAC: places calls, tracks early and confirmed dialogs from the answers,
//! ACKs 2xx and decides between CANCEL and BYE when the user hangs up.
//! UAS: rings on an incoming INVITE and waits for accept or reject; answers
//! re-INVITEs inside a confirmed dialog.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use sip_core::{tag_of, Method, Request, Response, SipUri};
use sip_dialog::{Dialog, DialogId};
use sip_parse::cseq;
use sip_transaction::{ServerTransactionHandle, TransactionEvent, TransactionKey, TransactionUser};
use smol_str::SmolStr;
use tracing::{debug, info, warn};

use super::{bye::ByeHandler, cancel::CancelAttempt, is_challenge, respond, RequestHandler};
use crate::{
    challenge::is_authorized,
    context::{MethodContext, PendingInvite},
    initial::InitialRequestManager,
    listener::UaEvent,
    mid_dialog::MidDialogRequestManager,
    response::generate_response,
    UaError,
};

pub struct InviteHandler {
    ctx: Arc<MethodContext>,
    initial: InitialRequestManager,
    mid: MidDialogRequestManager,
    bye: Arc<ByeHandler>,
}

impl InviteHandler {
    pub fn new(ctx: Arc<MethodContext>, bye: Arc<ByeHandler>) -> Arc<Self> {
        Arc::new(Self {
            initial: InitialRequestManager::new(ctx.clone()),
            mid: MidDialogRequestManager::new(ctx.clone()),
            ctx,
            bye,
        })
    }

    /// Places a call to `target` with an SDP offer. Returns its Call-ID.
    pub async fn invite(self: &Arc<Self>, target: SipUri) -> Result<SmolStr, UaError> {
        let ctx = &self.ctx;
        let call_id = ctx.ids.call_id(&ctx.local_host());
        let mut request = self
            .initial
            .build(Method::Invite, target.clone(), &target, call_id.clone())?;
        request.headers_mut().push("Content-Type", "application/sdp");
        request.set_body(ctx.sdp.offer(&call_id))?;

        ctx.state
            .peers
            .insert(call_id.clone(), SmolStr::new(target.to_string()));
        info!(call_id = %call_id, %target, "placing call");
        if let Err(e) = self.send_attempt(request, false).await {
            ctx.state.peers.remove(&call_id);
            return Err(e);
        }
        Ok(call_id)
    }

    async fn send_attempt(
        self: &Arc<Self>,
        request: Request,
        challenged: bool,
    ) -> Result<TransactionKey, UaError> {
        self.initial
            .send(request, None, |request| {
                let attempt: Arc<dyn TransactionUser> = Arc::new(InviteAttempt {
                    handler: Arc::downgrade(self),
                    request: request.clone(),
                    challenged,
                });
                attempt
            })
            .await
    }

    /// Hangs up `call_id` in whatever state it is in.
    ///
    /// An unanswered incoming call is rejected. For an outgoing call the
    /// INVITE transaction's delivery lock is taken before the call is marked
    /// closed, so a final response delivered meanwhile is handled as if the
    /// hangup came after it. Under the lock a confirmed dialog gets BYE and
    /// a provisionally answered INVITE gets CANCEL. An INVITE with nothing
    /// received yet gets its CANCEL once the first provisional arrives.
    pub async fn terminate(self: &Arc<Self>, call_id: &str) -> Result<(), UaError> {
        let ctx = &self.ctx;
        if ctx.state.pending_invites.contains_key(call_id) {
            return self.reject_call(call_id).await;
        }

        let invite = self.invite_for_termination(call_id);
        let lock = invite
            .as_ref()
            .and_then(|key| ctx.transactions.client_lock(key));
        let _guard = match &lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        ctx.state.closed_calls.insert(SmolStr::new(call_id));

        let dialog = ctx.dialogs.get_by_call_id(call_id);
        if let Some(dialog) = dialog.as_ref().filter(|dialog| dialog.is_confirmed()) {
            debug!(call_id, "confirmed dialog, sending BYE");
            return self.hang_up_dialog(call_id, dialog).await;
        }
        if let Some(key) = &invite {
            let transactions = &ctx.transactions;
            if transactions.client_request(key).is_some()
                && transactions.last_response(key).is_none()
            {
                debug!(call_id, "no provisional response yet, CANCEL deferred");
                ctx.state.deferred_cancels.insert(SmolStr::new(call_id));
                return Ok(());
            }
            if self.cancel(key, call_id).await? {
                return Ok(());
            }
            if ctx.state.peers.contains_key(call_id)
                && transactions.last_response(key).is_some_and(|r| r.is_final())
            {
                debug!(call_id, "final response awaiting delivery closes the call");
                return Ok(());
            }
        }
        match dialog {
            Some(dialog) if dialog.is_early() => {
                debug!(call_id, "early dialog without pending INVITE, sending BYE");
                self.hang_up_dialog(call_id, &dialog).await
            }
            _ => {
                ctx.state.closed_calls.remove(call_id);
                Err(UaError::NoSuchCall(SmolStr::new(call_id)))
            }
        }
    }

    /// Sends BYE and drops the call from the closed set.
    async fn hang_up_dialog(&self, call_id: &str, dialog: &Dialog) -> Result<(), UaError> {
        let sent = self.bye.send_bye(&dialog.id).await;
        self.ctx.state.closed_calls.remove(call_id);
        sent
    }

    /// The INVITE to cancel: the one that carries credentials if any, else
    /// the most recent.
    fn invite_for_termination(&self, call_id: &str) -> Option<TransactionKey> {
        let transactions = &self.ctx.transactions;
        let keys = transactions.client_keys_for_call(call_id, &Method::Invite);
        keys.iter()
            .find(|key| {
                transactions
                    .client_request(key)
                    .is_some_and(|request| is_authorized(&request))
            })
            .or_else(|| keys.last())
            .cloned()
    }

    async fn cancel(&self, invite: &TransactionKey, call_id: &str) -> Result<bool, UaError> {
        let owner = Arc::new(CancelAttempt {
            call_id: SmolStr::new(call_id),
        });
        let sent = self.initial.cancel(invite, owner).await?;
        if sent {
            info!(call_id, "CANCEL sent");
        }
        Ok(sent)
    }

    async fn on_attempt(
        self: Arc<Self>,
        attempt: &InviteAttempt,
        key: &TransactionKey,
        event: TransactionEvent,
    ) {
        let call_id = SmolStr::new(attempt.request.call_id().unwrap_or_default());
        match event {
            TransactionEvent::ProvisionalReceived(response) => {
                self.on_provisional(attempt, &call_id, response);
                if self.ctx.state.deferred_cancels.remove(call_id.as_str()).is_some() {
                    if let Err(e) = self.cancel(key, &call_id).await {
                        warn!(call_id = %call_id, error = %e, "deferred CANCEL failed");
                    }
                }
            }
            TransactionEvent::SuccessReceived(response) => {
                if let Err(e) = self.on_success(attempt, &call_id, response).await {
                    warn!(call_id = %call_id, error = %e, "cannot complete call setup");
                }
            }
            TransactionEvent::ErrorReceived(response)
                if is_challenge(response.code())
                    && !attempt.challenged
                    && self.ctx.challenges.has_credentials() =>
            {
                let retry = self
                    .ctx
                    .challenges
                    .retry_with_credentials(&attempt.request, &response);
                let sent = match retry {
                    Ok(retry) => self.send_attempt(retry, true).await.map(|_| ()),
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    warn!(call_id = %call_id, error = %e, "INVITE retry failed");
                    self.failed(&call_id, Some(response));
                }
            }
            TransactionEvent::ErrorReceived(response) => self.failed(&call_id, Some(response)),
            TransactionEvent::Timeout | TransactionEvent::TransportError => {
                self.failed(&call_id, None)
            }
        }
    }

    fn on_provisional(&self, attempt: &InviteAttempt, call_id: &SmolStr, response: Response) {
        let dialogs = &self.ctx.dialogs;
        if response.code() > 100 && response.header("To").and_then(|to| tag_of(to)).is_some() {
            let updated = DialogId::from_response(&response)
                .ok()
                .and_then(|id| dialogs.update(&id, |dialog| dialog.update_from_response(&response)));
            if updated.is_none() {
                match Dialog::new_uac(&attempt.request, &response) {
                    Ok(dialog) => {
                        dialogs.insert(dialog);
                    }
                    Err(e) => debug!(call_id = %call_id, error = %e, "no early dialog"),
                }
            }
        }
        if matches!(response.code(), 180 | 183) {
            self.ctx.emit(UaEvent::Ringing {
                call_id: call_id.clone(),
                response,
            });
        }
    }

    async fn on_success(
        &self,
        attempt: &InviteAttempt,
        call_id: &SmolStr,
        response: Response,
    ) -> Result<(), UaError> {
        let ctx = &self.ctx;
        let id = DialogId::from_response(&response)?;
        let existing = ctx.dialogs.update(&id, |dialog| {
            dialog.update_from_response(&response);
            dialog.clone()
        });
        let dialog = match existing {
            Some(dialog) => dialog,
            None => {
                let dialog = Dialog::new_uac(&attempt.request, &response)?;
                ctx.dialogs.insert(dialog.clone());
                dialog
            }
        };
        let (invite_cseq, _) =
            cseq(attempt.request.headers()).ok_or(UaError::MissingHeader("CSeq"))?;
        self.mid.send_ack(&dialog, invite_cseq).await?;
        ctx.state.deferred_cancels.remove(call_id.as_str());

        if ctx.state.closed_calls.remove(call_id.as_str()).is_some() {
            info!(call_id = %call_id, "answered after hangup, sending BYE");
            return self.bye.send_bye(&dialog.id).await;
        }
        info!(call_id = %call_id, "call answered");
        ctx.media.start(call_id, response.body());
        ctx.emit(UaEvent::CalleePickup {
            call_id: call_id.clone(),
            response,
        });
        Ok(())
    }

    fn failed(&self, call_id: &SmolStr, response: Option<Response>) {
        let ctx = &self.ctx;
        if let Some(dialog) = ctx.dialogs.get_by_call_id(call_id) {
            ctx.dialogs.remove(&dialog.id);
        }
        ctx.state.peers.remove(call_id.as_str());
        ctx.state.deferred_cancels.remove(call_id.as_str());
        if ctx.state.closed_calls.remove(call_id.as_str()).is_some() {
            debug!(
                call_id = %call_id,
                code = response.as_ref().map(Response::code),
                "closed call ended"
            );
            return;
        }
        warn!(
            call_id = %call_id,
            code = response.as_ref().map(Response::code),
            "call failed"
        );
        ctx.emit(UaEvent::Error {
            call_id: call_id.clone(),
            response,
        });
    }

    /// ACKs a 2xx retransmission that outlived its INVITE transaction.
    pub async fn reack(&self, response: &Response) -> Result<bool, UaError> {
        let Some(dialog) = self.ctx.dialogs.find_by_response(response) else {
            return Ok(false);
        };
        if !dialog.is_confirmed() {
            return Ok(false);
        }
        let (number, _) = cseq(response.headers()).ok_or(UaError::MissingHeader("CSeq"))?;
        debug!(call_id = %dialog.id.call_id, "re-ACKing 2xx retransmission");
        self.mid.send_ack(&dialog, number).await?;
        Ok(true)
    }

    /// Answers a ringing incoming call with 200 and an SDP answer.
    pub async fn accept_call(&self, call_id: &str) -> Result<(), UaError> {
        let ctx = &self.ctx;
        let (_, pending) = ctx
            .state
            .pending_invites
            .remove(call_id)
            .ok_or_else(|| UaError::NoSuchCall(SmolStr::new(call_id)))?;

        let offer = pending.request.body().clone();
        let mut ok = generate_response(&pending.request, 200, Some(pending.local_tag.as_str()))?;
        ok.headers_mut().push("Contact", ctx.contact());
        ok.headers_mut().push("Content-Type", "application/sdp");
        ok.set_body(ctx.sdp.answer(call_id, &offer))?;
        pending.handle.send_response(ok).await?;

        if let Some(dialog) = ctx.dialogs.get_by_call_id(call_id) {
            ctx.dialogs.update(&dialog.id, Dialog::confirm);
        }
        ctx.state.offers.insert(SmolStr::new(call_id), offer);
        info!(call_id, "call accepted");
        Ok(())
    }

    /// Declines a ringing incoming call with 486 Busy Here.
    pub async fn reject_call(&self, call_id: &str) -> Result<(), UaError> {
        let ctx = &self.ctx;
        let (_, pending) = ctx
            .state
            .pending_invites
            .remove(call_id)
            .ok_or_else(|| UaError::NoSuchCall(SmolStr::new(call_id)))?;
        respond(&pending.handle, &pending.request, 486, Some(pending.local_tag.as_str())).await?;

        if let Some(dialog) = ctx.dialogs.get_by_call_id(call_id) {
            ctx.dialogs.update(&dialog.id, Dialog::terminate);
            ctx.dialogs.remove(&dialog.id);
        }
        ctx.state.peers.remove(call_id);
        info!(call_id, "call rejected");
        Ok(())
    }

    /// ACK for our 2xx: the call is up, start media.
    pub fn handle_ack(&self, request: &Request) {
        let ctx = &self.ctx;
        let Some(dialog) = ctx.dialogs.find_by_request(request) else {
            debug!(call_id = request.call_id().unwrap_or_default(), "ACK outside any dialog dropped");
            return;
        };
        let call_id = &dialog.id.call_id;
        let offer = ctx
            .state
            .offers
            .remove(call_id)
            .map(|(_, offer)| offer)
            .unwrap_or_else(|| request.body().clone());
        debug!(call_id = %call_id, "ACK received, starting media");
        ctx.media.start(call_id, &offer);
    }

    async fn incoming(
        &self,
        request: &Request,
        handle: ServerTransactionHandle,
    ) -> Result<(), UaError> {
        let ctx = &self.ctx;
        let call_id = SmolStr::new(request.call_id().ok_or(UaError::MissingHeader("Call-ID"))?);
        let local_tag = ctx.ids.tag();
        let dialog = match Dialog::new_uas(request, &local_tag) {
            Ok(dialog) => dialog,
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "unusable INVITE");
                return respond(&handle, request, 400, Some(local_tag.as_str())).await;
            }
        };
        ctx.dialogs.insert(dialog);
        if let Some(from) = request.header("From") {
            ctx.state.peers.insert(call_id.clone(), from.clone());
        }

        let mut ringing = generate_response(request, 180, Some(local_tag.as_str()))?;
        ringing.headers_mut().push("Contact", ctx.contact());
        handle.send_response(ringing).await?;

        ctx.state.pending_invites.insert(
            call_id.clone(),
            PendingInvite {
                handle,
                request: request.clone(),
                local_tag,
            },
        );
        info!(call_id = %call_id, "incoming call");
        ctx.emit(UaEvent::IncomingCall {
            call_id,
            request: request.clone(),
        });
        Ok(())
    }

    /// re-INVITE: refresh the target and answer the new offer.
    async fn reinvite(
        &self,
        request: &Request,
        handle: ServerTransactionHandle,
        dialog: Dialog,
    ) -> Result<(), UaError> {
        let ctx = &self.ctx;
        ctx.dialogs
            .update(&dialog.id, |dialog| dialog.update_from_request(request));
        let mut ok = generate_response(request, 200, None)?;
        ok.headers_mut().push("Contact", ctx.contact());
        ok.headers_mut().push("Content-Type", "application/sdp");
        ok.set_body(ctx.sdp.answer(&dialog.id.call_id, request.body()))?;
        debug!(call_id = %dialog.id.call_id, "answering re-INVITE");
        handle.send_response(ok).await?;
        ctx.state
            .offers
            .insert(dialog.id.call_id.clone(), request.body().clone());
        Ok(())
    }
}

#[async_trait]
impl RequestHandler for InviteHandler {
    async fn handle(
        &self,
        request: &Request,
        handle: ServerTransactionHandle,
        dialog: Option<Dialog>,
    ) -> Result<(), UaError> {
        match dialog {
            Some(dialog) => self.reinvite(request, handle, dialog).await,
            None => self.incoming(request, handle).await,
        }
    }

    fn method(&self) -> Method {
        Method::Invite
    }
}

struct InviteAttempt {
    handler: Weak<InviteHandler>,
    request: Request,
    challenged: bool,
}

#[async_trait]
impl TransactionUser for InviteAttempt {
    async fn on_event(&self, key: &TransactionKey, event: TransactionEvent) {
        if let Some(handler) = self.handler.upgrade() {
            handler.on_attempt(self, key, event).await;
        }
    }
}
