// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! In-dialog requests: building BYE, ACK and re-INVITE from a stored
//! dialog, and CSeq validation of inbound in-dialog requests.

use std::sync::Arc;

use bytes::Bytes;
use sip_core::{Headers, Method, Request, RequestLine};
use sip_dialog::{Dialog, DialogError, DialogId};
use sip_parse::{cseq, serialize_request};
use sip_transaction::{ServerTransactionHandle, TransactionKey, TransactionUser};
use tracing::{debug, warn};

use crate::{
    context::MethodContext,
    initial::{resolve_destination, uri_transport},
    response::generate_response,
    UaError,
};

/// Outcome of checking an inbound request against the dialog table.
#[derive(Debug)]
pub enum DialogCheck {
    /// In order; the dialog as it is after recording the CSeq.
    Accepted(Dialog),
    /// Lower CSeq than already seen. A 500 has been sent.
    Stale,
    NoDialog,
}

pub struct MidDialogRequestManager {
    ctx: Arc<MethodContext>,
}

impl MidDialogRequestManager {
    pub fn new(ctx: Arc<MethodContext>) -> Self {
        Self { ctx }
    }

    /// Builds `method` inside dialog `id`, consuming the next local CSeq.
    pub fn build(&self, id: &DialogId, method: Method, body: Bytes) -> Result<Request, UaError> {
        let (dialog, number) = self
            .ctx
            .dialogs
            .update(id, |dialog| {
                let number = dialog.next_local_cseq();
                (dialog.clone(), number)
            })
            .ok_or_else(|| UaError::Dialog(DialogError::NotFound(id.clone())))?;
        let mut request = self.request_for(&dialog, method.clone(), number)?;
        if !body.is_empty() {
            request.headers_mut().push("Content-Type", "application/sdp");
            request.set_body(body)?;
        }
        Ok(request)
    }

    pub async fn send(
        &self,
        request: Request,
        tu: Arc<dyn TransactionUser>,
    ) -> Result<TransactionKey, UaError> {
        let target = resolve_destination(&request, self.ctx.outbound_proxy.as_ref());
        debug!(
            method = %request.method(),
            call_id = request.call_id().unwrap_or_default(),
            %target,
            "sending in-dialog request"
        );
        let key = self
            .ctx
            .transactions
            .create_client_transaction(request, target, None, tu)
            .await?;
        Ok(key)
    }

    /// ACK for a 2xx to the INVITE numbered `invite_cseq`.
    ///
    /// It is its own transaction on the wire (fresh branch) and is not
    /// retransmitted, so it goes straight to the transport.
    pub async fn send_ack(&self, dialog: &Dialog, invite_cseq: u32) -> Result<(), UaError> {
        let ack = self.request_for(dialog, Method::Ack, invite_cseq)?;
        let target = resolve_destination(&ack, self.ctx.outbound_proxy.as_ref());
        debug!(dialog = %dialog.id, %target, "sending ACK for 2xx");
        self.ctx
            .transport
            .send(&target, serialize_request(&ack))
            .await?;
        Ok(())
    }

    /// Matches an inbound request to its dialog and enforces CSeq order.
    pub async fn validate(
        &self,
        request: &Request,
        handle: &ServerTransactionHandle,
    ) -> Result<DialogCheck, UaError> {
        let Ok(id) = DialogId::from_request(request) else {
            return Ok(DialogCheck::NoDialog);
        };
        let (number, method) = cseq(request.headers()).ok_or(UaError::MissingHeader("CSeq"))?;
        let checked = self.ctx.dialogs.update(&id, |dialog| {
            dialog
                .check_remote_cseq(number, &method)
                .map(|()| dialog.clone())
        });
        match checked {
            None => Ok(DialogCheck::NoDialog),
            Some(Ok(dialog)) => Ok(DialogCheck::Accepted(dialog)),
            Some(Err(e)) => {
                warn!(dialog = %id, method = %method, error = %e, "out of order request");
                handle
                    .send_response(generate_response(request, 500, None)?)
                    .await?;
                Ok(DialogCheck::Stale)
            }
        }
    }

    fn request_for(&self, dialog: &Dialog, method: Method, number: u32) -> Result<Request, UaError> {
        let ctx = &self.ctx;
        let uri = dialog.remote_target.clone();

        let mut headers = Headers::new();
        headers.push("Via", ctx.via(uri_transport(&uri)));
        headers.push("Max-Forwards", "70");
        headers.push("From", dialog.local_party.clone());
        headers.push("To", dialog.remote_party.clone());
        headers.push("Call-ID", dialog.id.call_id.clone());
        headers.push("CSeq", format!("{} {}", number, method));
        for route in &dialog.route_set {
            headers.push("Route", route.clone());
        }
        if matches!(method, Method::Invite) {
            headers.push("Contact", ctx.contact());
        }
        headers.push("User-Agent", ctx.config.user_agent.as_str());

        Ok(Request::new(RequestLine::new(method, uri), headers, Bytes::new())?)
    }
}
