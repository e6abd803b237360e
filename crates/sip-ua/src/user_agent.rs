// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The user agent facade: user actions in, inbound packets dispatched.

use std::{collections::HashMap, sync::Arc};

use sip_core::{tag_of, Method, Request, Response, SipMessage, SipUri};
use sip_dialog::DialogManager;
use sip_parse::{cseq, parse_message};
use sip_transaction::{IdGenerator, InboundRequest, ServerTransactionHandle, TransactionManager};
use sip_transport::{InboundPacket, TransportPort, TransportTarget};
use smol_str::SmolStr;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, instrument, warn};

use crate::{
    challenge::ChallengeManager,
    config::UaConfig,
    context::{MethodContext, UaState},
    handlers::{
        respond, ByeHandler, CancelHandler, InviteHandler, OptionsHandler, RegisterHandler,
        RequestHandler,
    },
    listener::SipListener,
    media::{MediaSession, NullMedia, SdpProvider},
    mid_dialog::{DialogCheck, MidDialogRequestManager},
    response::generate_response,
    UaError, ALLOWED_METHODS,
};

/// One SIP user agent: a registration plus any number of calls.
pub struct UserAgent {
    ctx: Arc<MethodContext>,
    mid: MidDialogRequestManager,
    register: Arc<RegisterHandler>,
    invite: Arc<InviteHandler>,
    handlers: HashMap<Method, Arc<dyn RequestHandler>>,
}

impl UserAgent {
    /// A user agent without media: SDP bodies are a fixed PCMU stub.
    pub fn new(
        config: UaConfig,
        transport: Arc<dyn TransportPort>,
        listener: Arc<dyn SipListener>,
    ) -> Result<Self, UaError> {
        let address = config
            .public_ip
            .clone()
            .unwrap_or_else(|| config.local_ip.clone());
        let media = Arc::new(NullMedia::new(&address));
        Self::with_media(config, transport, listener, media.clone(), media)
    }

    pub fn with_media(
        config: UaConfig,
        transport: Arc<dyn TransportPort>,
        listener: Arc<dyn SipListener>,
        media: Arc<dyn MediaSession>,
        sdp: Arc<dyn SdpProvider>,
    ) -> Result<Self, UaError> {
        let outbound_proxy = config.outbound_proxy_uri()?;
        let ids = Arc::new(IdGenerator::new());
        let transactions =
            TransactionManager::with_ids(transport.clone(), config.timer_defaults(), ids.clone());
        let challenges = ChallengeManager::new(&config.user, config.password.as_deref());

        let ctx = Arc::new(MethodContext {
            config,
            outbound_proxy,
            transport,
            transactions,
            dialogs: DialogManager::new(),
            challenges,
            ids,
            state: UaState::new(),
            listener,
            media,
            sdp,
        });

        let bye = ByeHandler::new(ctx.clone());
        let invite = InviteHandler::new(ctx.clone(), bye.clone());
        let handlers: HashMap<Method, Arc<dyn RequestHandler>> = [
            invite.clone() as Arc<dyn RequestHandler>,
            bye,
            Arc::new(CancelHandler::new(ctx.clone())),
            Arc::new(OptionsHandler::new(ctx.clone())),
        ]
        .into_iter()
        .map(|handler| (handler.method(), handler))
        .collect();

        Ok(Self {
            mid: MidDialogRequestManager::new(ctx.clone()),
            register: RegisterHandler::new(ctx.clone()),
            invite,
            handlers,
            ctx,
        })
    }

    pub fn context(&self) -> &Arc<MethodContext> {
        &self.ctx
    }

    pub async fn register(&self) -> Result<(), UaError> {
        self.register.register().await
    }

    pub async fn unregister(&self) -> Result<(), UaError> {
        self.register.unregister().await
    }

    pub fn is_registered(&self) -> bool {
        self.ctx.state.is_registered()
    }

    /// Calls `target` (a SIP URI). Returns the Call-ID of the new call.
    pub async fn invite(&self, target: &str) -> Result<SmolStr, UaError> {
        let uri = SipUri::parse(target).ok_or_else(|| UaError::InvalidUri(target.to_owned()))?;
        self.invite.invite(uri).await
    }

    /// Hangs up a call: CANCEL, BYE or reject depending on its state.
    pub async fn terminate(&self, call_id: &str) -> Result<(), UaError> {
        self.invite.terminate(call_id).await
    }

    pub async fn accept_call(&self, call_id: &str) -> Result<(), UaError> {
        self.invite.accept_call(call_id).await
    }

    pub async fn reject_call(&self, call_id: &str) -> Result<(), UaError> {
        self.invite.reject_call(call_id).await
    }

    /// Active calls as (Call-ID, remote party).
    pub fn peers(&self) -> Vec<(SmolStr, SmolStr)> {
        self.ctx
            .state
            .peers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Reads inbound packets until the transport closes.
    pub fn spawn_reader(self: Arc<Self>, mut inbound: mpsc::Receiver<InboundPacket>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(packet) = inbound.recv().await {
                self.handle_packet(packet).await;
            }
            debug!("inbound channel closed");
        })
    }

    pub async fn handle_packet(&self, packet: InboundPacket) {
        let source = TransportTarget::from_peer(packet.transport, packet.peer);
        match parse_message(&packet.payload) {
            Some(SipMessage::Request(request)) => self.handle_request(request, source).await,
            Some(SipMessage::Response(response)) => self.handle_response(response).await,
            None => debug!(peer = %packet.peer, len = packet.payload.len(), "unparseable packet dropped"),
        }
    }

    #[instrument(name = "handle_message", skip_all, fields(method = %request.method(), peer = %source))]
    pub async fn handle_request(&self, request: Request, source: TransportTarget) {
        match self.ctx.transactions.receive_request(request, source).await {
            Ok(InboundRequest::New(handle, request)) => {
                if let Err(e) = self.dispatch(&request, handle).await {
                    warn!(error = %e, "request handling failed");
                }
            }
            Ok(InboundRequest::Absorbed) => {}
            Ok(InboundRequest::Ack(ack)) => self.invite.handle_ack(&ack),
            Err(e) => warn!(error = %e, "request rejected by transaction layer"),
        }
    }

    #[instrument(name = "handle_message", skip_all, fields(code = response.code()))]
    pub async fn handle_response(&self, response: Response) {
        if self
            .ctx
            .transactions
            .receive_response(response.clone())
            .await
        {
            return;
        }
        let is_invite = cseq(response.headers()).is_some_and(|(_, method)| method == Method::Invite);
        if response.is_success() && is_invite {
            if let Err(e) = self.invite.reack(&response).await {
                warn!(error = %e, "cannot re-ACK 2xx");
            }
        }
    }

    /// Routes a request that opened a new server transaction.
    async fn dispatch(
        &self,
        request: &Request,
        handle: ServerTransactionHandle,
    ) -> Result<(), UaError> {
        let method = request.method().clone();
        let in_dialog =
            method != Method::Cancel && request.header("To").and_then(|to| tag_of(to)).is_some();

        let dialog = if in_dialog {
            match self.mid.validate(request, &handle).await? {
                DialogCheck::Accepted(dialog) => Some(dialog),
                DialogCheck::Stale => return Ok(()),
                DialogCheck::NoDialog if method == Method::Options => None,
                DialogCheck::NoDialog => {
                    debug!(call_id = request.call_id().unwrap_or_default(), "no dialog for request");
                    return respond(&handle, request, 481, None).await;
                }
            }
        } else {
            None
        };

        if method == Method::Register {
            return respond(&handle, request, 501, Some(self.ctx.ids.tag().as_str())).await;
        }
        match self.handlers.get(&method) {
            Some(handler) => handler.handle(request, handle, dialog).await,
            None => {
                let mut response = generate_response(request, 405, Some(self.ctx.ids.tag().as_str()))?;
                response.headers_mut().push("Allow", ALLOWED_METHODS);
                handle.send_response(response).await?;
                Ok(())
            }
        }
    }

    /// Stops the refresh timer, drops every transaction and forgets all
    /// dialogs and calls.
    pub fn close(&self) {
        let ctx = &self.ctx;
        ctx.state.clear();
        ctx.state.set_registered(false);
        ctx.transactions.shutdown();
        ctx.dialogs.clear();
        info!("user agent closed");
    }
}
