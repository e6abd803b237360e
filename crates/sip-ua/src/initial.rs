//! Requests that open a registration or a dialog (REGISTER, INVITE), plus
//! the CANCEL of a pending INVITE.

use std::sync::Arc;

use bytes::Bytes;
use sip_core::{Headers, Method, NameAddr, Request, RequestLine, SipUri};
use sip_parse::cseq;
use sip_transaction::{TransactionKey, TransactionUser};
use sip_transport::{TransportKind, TransportTarget};
use smol_str::SmolStr;
use tracing::debug;

use crate::{context::MethodContext, UaError};

/// Hook run on a request just before it enters its client transaction.
pub trait MessageInterceptor: Send + Sync {
    fn intercept(&self, request: &mut Request);
}

impl<F> MessageInterceptor for F
where
    F: Fn(&mut Request) + Send + Sync,
{
    fn intercept(&self, request: &mut Request) {
        self(request)
    }
}

/// Builds and sends the first request of a dialog or registration.
pub struct InitialRequestManager {
    ctx: Arc<MethodContext>,
}

impl InitialRequestManager {
    pub fn new(ctx: Arc<MethodContext>) -> Self {
        Self { ctx }
    }

    /// Builds `method` toward `request_uri` with To set to `to`.
    ///
    /// From carries the profile URI and a fresh tag, CSeq comes from the
    /// per-agent counter. REGISTER gets an Expires header with the
    /// configured lifetime.
    pub fn build(
        &self,
        method: Method,
        request_uri: SipUri,
        to: &SipUri,
        call_id: SmolStr,
    ) -> Result<Request, UaError> {
        let ctx = &self.ctx;
        let transport = uri_transport(&request_uri);

        let tag = ctx.ids.tag();
        let from = NameAddr::new(ctx.config.profile_uri()).with_param("tag", Some(tag.as_str()));
        let mut headers = Headers::new();
        headers.push("Via", ctx.via(transport));
        headers.push("Max-Forwards", "70");
        headers.push("From", from.to_string());
        headers.push("To", format!("<{}>", to));
        headers.push("Call-ID", call_id);
        headers.push("CSeq", format!("{} {}", ctx.state.next_cseq(), method));
        headers.push("Contact", ctx.contact());
        headers.push("User-Agent", ctx.config.user_agent.as_str());
        if method == Method::Register {
            headers.push("Expires", ctx.config.register_expires.to_string());
        }

        Ok(Request::new(
            RequestLine::new(method, request_uri),
            headers,
            Bytes::new(),
        )?)
    }

    /// Runs the interceptor, then hands the request to a new client
    /// transaction toward its resolved destination.
    ///
    /// `owner` is built from the request as it will go out, after the
    /// interceptor had its say.
    pub async fn send<F>(
        &self,
        mut request: Request,
        interceptor: Option<&dyn MessageInterceptor>,
        owner: F,
    ) -> Result<TransactionKey, UaError>
    where
        F: FnOnce(&Request) -> Arc<dyn TransactionUser>,
    {
        if let Some(interceptor) = interceptor {
            interceptor.intercept(&mut request);
        }
        let tu = owner(&request);
        let target = resolve_destination(&request, self.ctx.outbound_proxy.as_ref());
        debug!(
            method = %request.method(),
            call_id = request.call_id().unwrap_or_default(),
            %target,
            "sending initial request"
        );
        let key = self
            .ctx
            .transactions
            .create_client_transaction(request, target, None, tu)
            .await?;
        Ok(key)
    }

    /// Sends a CANCEL for the INVITE client transaction `invite_key`.
    ///
    /// Returns `Ok(false)` without sending when the INVITE is gone, has
    /// not seen a provisional response yet (RFC 3261 §9.1) or has already
    /// seen a final one.
    pub async fn cancel(
        &self,
        invite_key: &TransactionKey,
        tu: Arc<dyn TransactionUser>,
    ) -> Result<bool, UaError> {
        let transactions = &self.ctx.transactions;
        let Some(invite) = transactions.client_request(invite_key) else {
            return Ok(false);
        };
        match transactions.last_response(invite_key) {
            None => {
                debug!(key = %invite_key, "nothing received for INVITE yet, no CANCEL");
                return Ok(false);
            }
            Some(response) if response.is_final() => {
                debug!(key = %invite_key, "INVITE already answered, no CANCEL");
                return Ok(false);
            }
            Some(_) => {}
        }

        let cancel = create_cancel(&invite)?;
        let target = resolve_destination(&cancel, self.ctx.outbound_proxy.as_ref());
        transactions
            .create_client_transaction(cancel, target, Some(invite_key.branch.clone()), tu)
            .await?;
        Ok(true)
    }
}

/// Where a request goes: the top Route URI, else the request URI, with the
/// outbound proxy (when set) overriding the host and, if it has one, the port.
pub fn resolve_destination(request: &Request, outbound_proxy: Option<&SipUri>) -> TransportTarget {
    let route = request
        .header("Route")
        .and_then(|value| NameAddr::parse(value))
        .map(|addr| addr.uri);
    let uri = route.as_ref().unwrap_or(request.uri());

    let transport = uri_transport(uri);
    let mut host = uri.host.clone();
    let mut port = uri.port_or_default();
    if let Some(proxy) = outbound_proxy {
        host = proxy.host.clone();
        if let Some(proxy_port) = proxy.port {
            port = proxy_port;
        }
    }
    TransportTarget::new(transport, host, port)
}

pub(crate) fn uri_transport(uri: &SipUri) -> TransportKind {
    uri.transport_param()
        .and_then(TransportKind::parse)
        .unwrap_or(TransportKind::Udp)
}

/// Builds the CANCEL for `invite` (RFC 3261 §9.1).
///
/// Request URI, Call-ID, From, To, Route and the top Via are copied; CSeq
/// keeps the INVITE's number.
pub fn create_cancel(invite: &Request) -> Result<Request, UaError> {
    let (number, _) = cseq(invite.headers()).ok_or(UaError::MissingHeader("CSeq"))?;
    let via = invite.header("Via").ok_or(UaError::MissingHeader("Via"))?;

    let mut headers = Headers::new();
    headers.push("Via", via.clone());
    headers.push("Max-Forwards", "70");
    for name in ["From", "To", "Call-ID"] {
        let value = invite.header(name).ok_or(UaError::MissingHeader(name))?;
        headers.push(name, value.clone());
    }
    headers.push("CSeq", format!("{} CANCEL", number));
    for route in invite.headers().get_all("Route") {
        headers.push("Route", route.clone());
    }
    if let Some(agent) = invite.header("User-Agent") {
        headers.push("User-Agent", agent.clone());
    }

    Ok(Request::new(
        RequestLine::new(Method::Cancel, invite.uri().clone()),
        headers,
        Bytes::new(),
    )?)
}
