// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! CANCEL request handler.
//!
//! Implements RFC 3261 §9.2 CANCEL method:
//! 1. 481 when no INVITE server transaction has the CANCEL's branch
//! 2. Otherwise 200 OK to the CANCEL
//! 3. 487 Request Terminated on the INVITE if it had no final response yet

use std::sync::Arc;

use async_trait::async_trait;
use sip_core::{Method, Request};
use sip_dialog::Dialog;
use sip_transaction::{
    request_branch_id, ServerTransactionHandle, TransactionEvent, TransactionKey, TransactionUser,
};
use smol_str::SmolStr;
use tracing::{debug, info};

use super::{respond, RequestHandler};
use crate::{context::MethodContext, listener::UaEvent, UaError};

pub struct CancelHandler {
    ctx: Arc<MethodContext>,
}

impl CancelHandler {
    pub fn new(ctx: Arc<MethodContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl RequestHandler for CancelHandler {
    async fn handle(
        &self,
        request: &Request,
        handle: ServerTransactionHandle,
        _dialog: Option<Dialog>,
    ) -> Result<(), UaError> {
        let ctx = &self.ctx;
        let invite = request_branch_id(request)
            .and_then(|branch| ctx.transactions.find_server_invite(&branch));
        let Some(invite) = invite else {
            debug!(
                call_id = request.call_id().unwrap_or_default(),
                "CANCEL matches no INVITE"
            );
            return respond(&handle, request, 481, None).await;
        };

        let call_id = SmolStr::new(request.call_id().unwrap_or_default());
        let local_tag = ctx
            .state
            .pending_invites
            .get(&call_id)
            .map(|pending| pending.local_tag.clone());
        respond(&handle, request, 200, local_tag.as_deref()).await?;

        if invite.last_response().is_some_and(|r| r.is_final()) {
            debug!(call_id = %call_id, "INVITE already answered, CANCEL has no effect");
            return Ok(());
        }
        let Some(invite_request) = invite.request() else {
            return Ok(());
        };
        let tag = local_tag.unwrap_or_else(|| ctx.ids.tag());
        respond(&invite, &invite_request, 487, Some(tag.as_str())).await?;

        ctx.state.pending_invites.remove(&call_id);
        ctx.state.peers.remove(&call_id);
        if let Some(dialog) = ctx.dialogs.get_by_call_id(&call_id) {
            ctx.dialogs.remove(&dialog.id);
        }
        info!(call_id = %call_id, "incoming call cancelled");
        ctx.emit(UaEvent::RemoteHangup {
            call_id,
            request: request.clone(),
        });
        Ok(())
    }

    fn method(&self) -> Method {
        Method::Cancel
    }
}

/// Owner of a CANCEL we sent. The INVITE's own transaction reports the
/// outcome (487 or 2xx), so this only logs.
pub struct CancelAttempt {
    pub call_id: SmolStr,
}

#[async_trait]
impl TransactionUser for CancelAttempt {
    async fn on_event(&self, key: &TransactionKey, event: TransactionEvent) {
        match event {
            TransactionEvent::ProvisionalReceived(_) => {}
            TransactionEvent::SuccessReceived(response) | TransactionEvent::ErrorReceived(response) => {
                debug!(key = %key, call_id = %self.call_id, code = response.code(), "CANCEL answered");
            }
            TransactionEvent::Timeout | TransactionEvent::TransportError => {
                debug!(key = %key, call_id = %self.call_id, "CANCEL got no answer");
            }
        }
    }
}
