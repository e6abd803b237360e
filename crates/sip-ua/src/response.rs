//! Response construction for the UAS side (RFC 3261 §8.2.6).

use bytes::Bytes;
use sip_core::{with_tag, Headers, MessageError, Request, Response, StatusLine};

/// Reason phrase for the status codes this user agent sends.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        _ => "Unknown",
    }
}

/// Builds a response echoing the request's Via (all of them, in order),
/// From, To, Call-ID and CSeq.
///
/// `to_tag` is appended to To when the request's To carries no tag; pass
/// `None` for 100 Trying. Headers are copied by value.
pub fn build_generic_response(
    request: &Request,
    code: u16,
    reason: &str,
    to_tag: Option<&str>,
) -> Result<Response, MessageError> {
    let mut headers = Headers::new();
    for via in request.headers().get_all("Via") {
        headers.push("Via", via.clone());
    }
    if let Some(from) = request.header("From") {
        headers.push("From", from.clone());
    }
    if let Some(to) = request.header("To") {
        let to = match to_tag {
            Some(tag) => with_tag(to, tag),
            None => to.clone(),
        };
        headers.push("To", to);
    }
    if let Some(call_id) = request.header("Call-ID") {
        headers.push("Call-ID", call_id.clone());
    }
    if let Some(cseq) = request.header("CSeq") {
        headers.push("CSeq", cseq.clone());
    }
    Response::new(StatusLine::new(code, reason)?, headers, Bytes::new())
}

/// [`build_generic_response`] with the standard reason phrase.
pub fn generate_response(
    request: &Request,
    code: u16,
    to_tag: Option<&str>,
) -> Result<Response, MessageError> {
    build_generic_response(request, code, reason_phrase(code), to_tag)
}
