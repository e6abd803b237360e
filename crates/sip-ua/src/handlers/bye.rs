//! BYE handling for both roles.
//!
//! Inbound: tear the call down and answer 200, or 481 when the dialog is
//! already gone. Outbound: BYE from the dialog, with one digest retry.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use sip_core::{Method, Request, Response};
use sip_dialog::{Dialog, DialogId};
use sip_parse::cseq;
use sip_transaction::{ServerTransactionHandle, TransactionEvent, TransactionKey, TransactionUser};
use smol_str::SmolStr;
use tracing::{info, warn};

use super::{is_challenge, respond, RequestHandler};
use crate::{
    context::MethodContext, listener::UaEvent, mid_dialog::MidDialogRequestManager, UaError,
};

pub struct ByeHandler {
    ctx: Arc<MethodContext>,
    mid: MidDialogRequestManager,
}

impl ByeHandler {
    pub fn new(ctx: Arc<MethodContext>) -> Arc<Self> {
        Arc::new(Self {
            mid: MidDialogRequestManager::new(ctx.clone()),
            ctx,
        })
    }

    /// Hangs up dialog `id`: sends BYE, drops the peer and stops media.
    /// The dialog itself goes when the BYE is answered.
    pub async fn send_bye(self: &Arc<Self>, id: &DialogId) -> Result<(), UaError> {
        let mut bye = self.mid.build(id, Method::Bye, Bytes::new())?;
        self.ctx.challenges.preauthorize(&mut bye);
        self.send_attempt(bye, id.clone(), false).await?;

        self.ctx.state.peers.remove(&id.call_id);
        self.ctx.media.stop(&id.call_id);
        info!(call_id = %id.call_id, "BYE sent");
        Ok(())
    }

    async fn send_attempt(
        self: &Arc<Self>,
        request: Request,
        dialog: DialogId,
        challenged: bool,
    ) -> Result<TransactionKey, UaError> {
        let attempt = Arc::new(ByeAttempt {
            handler: Arc::downgrade(self),
            request: request.clone(),
            dialog,
            challenged,
        });
        self.mid.send(request, attempt).await
    }

    async fn on_attempt(self: Arc<Self>, attempt: &ByeAttempt, event: TransactionEvent) {
        let ctx = &self.ctx;
        let call_id = attempt.dialog.call_id.clone();
        match event {
            TransactionEvent::ProvisionalReceived(_) => {}
            TransactionEvent::SuccessReceived(_) => {
                ctx.dialogs.remove(&attempt.dialog);
            }
            TransactionEvent::ErrorReceived(response)
                if is_challenge(response.code())
                    && !attempt.challenged
                    && ctx.challenges.has_credentials() =>
            {
                if let Err(e) = self.retry(attempt, &response).await {
                    warn!(call_id = %call_id, error = %e, "BYE retry failed");
                    self.fail(call_id, &attempt.dialog, Some(response));
                }
            }
            TransactionEvent::ErrorReceived(response) => {
                self.fail(call_id, &attempt.dialog, Some(response));
            }
            TransactionEvent::Timeout | TransactionEvent::TransportError => {
                self.fail(call_id, &attempt.dialog, None);
            }
        }
    }

    async fn retry(self: &Arc<Self>, attempt: &ByeAttempt, challenge: &Response) -> Result<(), UaError> {
        let retry = self
            .ctx
            .challenges
            .retry_with_credentials(&attempt.request, challenge)?;
        if let Some((number, _)) = cseq(retry.headers()) {
            self.ctx.dialogs.update(&attempt.dialog, |dialog| {
                dialog.local_cseq = dialog.local_cseq.max(Some(number));
            });
        }
        self.send_attempt(retry, attempt.dialog.clone(), true).await?;
        Ok(())
    }

    /// The call is over either way; the dialog goes and the user hears why.
    fn fail(&self, call_id: SmolStr, dialog: &DialogId, response: Option<Response>) {
        warn!(
            call_id = %call_id,
            code = response.as_ref().map(Response::code),
            "BYE failed"
        );
        self.ctx.dialogs.remove(dialog);
        self.ctx.emit(UaEvent::Error { call_id, response });
    }
}

#[async_trait]
impl RequestHandler for ByeHandler {
    async fn handle(
        &self,
        request: &Request,
        handle: ServerTransactionHandle,
        dialog: Option<Dialog>,
    ) -> Result<(), UaError> {
        let ctx = &self.ctx;
        // Only the first of two racing BYEs gets the dialog back.
        let removed = dialog.and_then(|dialog| ctx.dialogs.remove(&dialog.id));
        let Some(dialog) = removed else {
            return respond(&handle, request, 481, None).await;
        };

        let call_id = dialog.id.call_id.clone();
        ctx.state.peers.remove(&call_id);
        ctx.state.offers.remove(&call_id);
        ctx.media.stop(&call_id);
        respond(&handle, request, 200, None).await?;

        info!(call_id = %call_id, "remote hangup");
        ctx.emit(UaEvent::RemoteHangup {
            call_id,
            request: request.clone(),
        });
        Ok(())
    }

    fn method(&self) -> Method {
        Method::Bye
    }
}

struct ByeAttempt {
    handler: Weak<ByeHandler>,
    request: Request,
    dialog: DialogId,
    challenged: bool,
}

#[async_trait]
impl TransactionUser for ByeAttempt {
    async fn on_event(&self, _key: &TransactionKey, event: TransactionEvent) {
        if let Some(handler) = self.handler.upgrade() {
            handler.on_attempt(self, event).await;
        }
    }
}
