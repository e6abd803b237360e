// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3261 §12 dialog state for the user agent.
//!
//! A [`Dialog`] is created from the response that establishes it (UAC side)
//! or from the INVITE that opens it (UAS side), and lives in a
//! [`DialogManager`] until BYE or call failure removes it.
//!
//! # Example
//! ```no_run
//! use sip_dialog::{Dialog, DialogManager};
//! # use sip_core::{Request, Response};
//! let manager = DialogManager::new();
//! # let invite: Request = todo!();
//! # let ringing: Response = todo!();
//! if let Ok(dialog) = Dialog::new_uac(&invite, &ringing) {
//!     manager.insert(dialog);
//! }
//! ```

use std::fmt;

use dashmap::DashMap;
use sip_core::{tag_of, with_tag, Headers, Method, NameAddr, Request, Response, SipUri};
use sip_parse::{cseq, header};
use smol_str::SmolStr;
use tracing::debug;

/// Dialog state per RFC 3261 §12.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    /// Established by a provisional response carrying a To tag
    Early,
    /// Established by a 2xx
    Confirmed,
    /// Ended by BYE, CANCEL or a failure response
    Terminated,
}

/// Unique dialog identifier composed of Call-ID and local/remote tags (RFC 3261 §12).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: SmolStr,
    pub local_tag: SmolStr,
    pub remote_tag: SmolStr,
}

impl DialogId {
    pub fn new(
        call_id: impl Into<SmolStr>,
        local_tag: impl Into<SmolStr>,
        remote_tag: impl Into<SmolStr>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        }
    }

    /// Identifier of the dialog a response belongs to, seen from the UAC:
    /// From tag is local, To tag is remote.
    pub fn from_response(resp: &Response) -> Result<Self, DialogError> {
        let headers = resp.headers();
        Ok(Self::new(
            required(headers, "Call-ID")?.clone(),
            required_tag(headers, "From")?,
            required_tag(headers, "To")?,
        ))
    }

    /// Identifier of the dialog an inbound request belongs to: To tag is
    /// local, From tag is remote.
    pub fn from_request(req: &Request) -> Result<Self, DialogError> {
        let headers = req.headers();
        Ok(Self::new(
            required(headers, "Call-ID")?.clone(),
            required_tag(headers, "To")?,
            required_tag(headers, "From")?,
        ))
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};local={};remote={}", self.call_id, self.local_tag, self.remote_tag)
    }
}

/// One call leg.
#[derive(Debug, Clone)]
pub struct Dialog {
    pub id: DialogId,
    pub state: DialogState,

    /// Where in-dialog requests go (the peer's Contact)
    pub remote_target: SipUri,

    /// Route set, in the order Route headers are written
    pub route_set: Vec<SmolStr>,

    /// CSeq of the last request we sent; `None` until the first
    pub local_cseq: Option<u32>,

    /// CSeq of the last request the peer sent; `None` until the first
    pub remote_cseq: Option<u32>,

    /// Our From/To value, tag included
    pub local_party: SmolStr,

    /// The peer's From/To value, tag included
    pub remote_party: SmolStr,

    /// Whether we sent the dialog-creating request
    pub is_uac: bool,
}

impl Dialog {
    /// Creates the UAC side of a dialog from the INVITE we sent and a 1xx
    /// (Early) or 2xx (Confirmed) response carrying a To tag.
    pub fn new_uac(req: &Request, resp: &Response) -> Result<Self, DialogError> {
        let state = match resp.code() {
            101..=199 => DialogState::Early,
            200..=299 => DialogState::Confirmed,
            code => return Err(DialogError::NoDialog(code)),
        };
        let id = DialogId::from_response(resp)?;
        let headers = resp.headers();

        let remote_target = contact_uri(headers).unwrap_or_else(|| req.uri().clone());
        // UAC reverses Record-Route (RFC 3261 §12.1.2).
        let mut route_set = record_route(headers);
        route_set.reverse();

        let local_cseq = cseq(req.headers())
            .map(|(n, _)| n)
            .ok_or(DialogError::MissingHeader("CSeq"))?;

        Ok(Self {
            id,
            state,
            remote_target,
            route_set,
            local_cseq: Some(local_cseq),
            remote_cseq: None,
            local_party: required(req.headers(), "From")?.clone(),
            remote_party: required(headers, "To")?.clone(),
            is_uac: true,
        })
    }

    /// Creates the UAS side of a dialog from an inbound INVITE. The dialog
    /// starts Early with `local_tag` as our To tag.
    pub fn new_uas(req: &Request, local_tag: &str) -> Result<Self, DialogError> {
        let headers = req.headers();
        let call_id = required(headers, "Call-ID")?.clone();
        let remote_tag = required_tag(headers, "From")?;
        let remote_cseq = cseq(headers)
            .map(|(n, _)| n)
            .ok_or(DialogError::MissingHeader("CSeq"))?;
        let remote_target = contact_uri(headers).ok_or(DialogError::MissingHeader("Contact"))?;

        Ok(Self {
            id: DialogId::new(call_id, local_tag, remote_tag),
            state: DialogState::Early,
            remote_target,
            route_set: record_route(headers),
            local_cseq: None,
            remote_cseq: Some(remote_cseq),
            local_party: with_tag(required(headers, "To")?, local_tag),
            remote_party: required(headers, "From")?.clone(),
            is_uac: false,
        })
    }

    pub fn confirm(&mut self) {
        if self.state == DialogState::Early {
            self.state = DialogState::Confirmed;
        }
    }

    pub fn terminate(&mut self) {
        self.state = DialogState::Terminated;
    }

    pub fn is_early(&self) -> bool {
        self.state == DialogState::Early
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == DialogState::Confirmed
    }

    /// Returns the CSeq number for the next request we send.
    ///
    /// A UAS dialog that has not sent anything yet starts at 1.
    pub fn next_local_cseq(&mut self) -> u32 {
        let next = self.local_cseq.map_or(1, |n| n.saturating_add(1));
        self.local_cseq = Some(next);
        next
    }

    /// Accepts or rejects the CSeq of an inbound in-dialog request.
    ///
    /// Only a number strictly lower than the last one seen is rejected; an
    /// equal number (a retransmission that escaped its transaction) passes.
    /// ACK carries its INVITE's number and never moves the counter.
    pub fn check_remote_cseq(&mut self, number: u32, method: &Method) -> Result<(), DialogError> {
        if let Some(current) = self.remote_cseq {
            if number < current {
                return Err(DialogError::StaleCSeq {
                    received: number,
                    current,
                });
            }
        }
        if *method != Method::Ack {
            self.remote_cseq = Some(number);
        }
        Ok(())
    }

    /// Target refresh from a response (2xx to INVITE or re-INVITE).
    pub fn update_from_response(&mut self, resp: &Response) {
        if let Some(contact) = contact_uri(resp.headers()) {
            self.remote_target = contact;
        }
        if self.is_uac && self.state == DialogState::Early {
            // Route set is fixed by the first response; refreshed only while early.
            let mut routes = record_route(resp.headers());
            if !routes.is_empty() {
                routes.reverse();
                self.route_set = routes;
            }
            if let Some(to) = header(resp.headers(), "To") {
                self.remote_party = to.clone();
            }
        }
        if resp.is_success() {
            self.confirm();
        }
    }

    /// Target refresh from an inbound request (re-INVITE).
    pub fn update_from_request(&mut self, req: &Request) {
        if let Some(contact) = contact_uri(req.headers()) {
            self.remote_target = contact;
        }
    }
}

/// Concurrent index of live dialogs.
///
/// Removal is idempotent: when BYE handling races on both sides only the
/// first `remove` returns the dialog.
pub struct DialogManager {
    dialogs: DashMap<DialogId, Dialog>,
}

impl DialogManager {
    pub fn new() -> Self {
        Self {
            dialogs: DashMap::new(),
        }
    }

    /// Inserts or replaces a dialog. Returns true if it was new.
    pub fn insert(&self, dialog: Dialog) -> bool {
        debug!(dialog = %dialog.id, state = ?dialog.state, "dialog stored");
        self.dialogs.insert(dialog.id.clone(), dialog).is_none()
    }

    pub fn get(&self, id: &DialogId) -> Option<Dialog> {
        self.dialogs.get(id).map(|entry| entry.clone())
    }

    /// Any dialog of a call. A UA places one call per Call-ID, so this is
    /// the dialog for that call.
    pub fn get_by_call_id(&self, call_id: &str) -> Option<Dialog> {
        self.dialogs
            .iter()
            .find(|entry| entry.key().call_id == call_id)
            .map(|entry| entry.value().clone())
    }

    /// Dialog a response to one of our requests belongs to.
    pub fn find_by_response(&self, resp: &Response) -> Option<Dialog> {
        DialogId::from_response(resp)
            .ok()
            .and_then(|id| self.get(&id))
    }

    /// Dialog an inbound request belongs to.
    pub fn find_by_request(&self, req: &Request) -> Option<Dialog> {
        DialogId::from_request(req).ok().and_then(|id| self.get(&id))
    }

    /// Applies `f` to a stored dialog under its entry lock.
    pub fn update<R>(&self, id: &DialogId, f: impl FnOnce(&mut Dialog) -> R) -> Option<R> {
        self.dialogs.get_mut(id).map(|mut entry| f(entry.value_mut()))
    }

    pub fn remove(&self, id: &DialogId) -> Option<Dialog> {
        let removed = self.dialogs.remove(id).map(|(_, dialog)| dialog);
        if removed.is_some() {
            debug!(dialog = %id, "dialog removed");
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.dialogs.len()
    }

    pub fn clear(&self) {
        self.dialogs.clear();
    }
}

impl Default for DialogManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Dialog-related errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogError {
    MissingHeader(&'static str),
    MissingTag(&'static str),
    /// Responses with this status never create a dialog
    NoDialog(u16),
    /// CSeq lower than the last one seen from the peer
    StaleCSeq { received: u32, current: u32 },
    NotFound(DialogId),
}

impl fmt::Display for DialogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialogError::MissingHeader(name) => write!(f, "missing {} header", name),
            DialogError::MissingTag(name) => write!(f, "{} header has no tag", name),
            DialogError::NoDialog(code) => write!(f, "a {} response creates no dialog", code),
            DialogError::StaleCSeq { received, current } => {
                write!(f, "CSeq {} is lower than {}", received, current)
            }
            DialogError::NotFound(id) => write!(f, "dialog {} not found", id),
        }
    }
}

impl std::error::Error for DialogError {}

fn required<'a>(headers: &'a Headers, name: &'static str) -> Result<&'a SmolStr, DialogError> {
    header(headers, name).ok_or(DialogError::MissingHeader(name))
}

fn required_tag(headers: &Headers, name: &'static str) -> Result<SmolStr, DialogError> {
    tag_of(required(headers, name)?).ok_or(DialogError::MissingTag(name))
}

fn contact_uri(headers: &Headers) -> Option<SipUri> {
    header(headers, "Contact")
        .and_then(|raw| split_header_values(raw).into_iter().next())
        .and_then(|first| NameAddr::parse(&first))
        .map(|addr| addr.uri)
}

/// Record-Route entries in header order, one per element.
fn record_route(headers: &Headers) -> Vec<SmolStr> {
    headers
        .get_all("Record-Route")
        .flat_map(|v| split_header_values(v.as_str()))
        .map(SmolStr::new)
        .collect()
}

/// Splits a header value into comma-separated elements, respecting quotes and <>.
fn split_header_values(raw: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut angle_depth = 0usize;
    let mut start = 0usize;

    for (idx, ch) in raw.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '<' => angle_depth = angle_depth.saturating_add(1),
            '>' => angle_depth = angle_depth.saturating_sub(1),
            ',' if !in_quotes && angle_depth == 0 => {
                let part = raw[start..idx].trim();
                if !part.is_empty() {
                    parts.push(part.to_owned());
                }
                start = idx + 1;
            }
            _ => {}
        }
    }

    let part = raw[start..].trim();
    if !part.is_empty() {
        parts.push(part.to_owned());
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use sip_core::{RequestLine, StatusLine};
    use std::sync::Arc;

    fn invite(cseq: u32) -> Request {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKd1");
        headers.push("Record-Route", "<sip:p1.example.com;lr>, <sip:p2.example.com;lr>");
        headers.push("From", "\"Alice\" <sip:alice@example.com>;tag=alice-tag");
        headers.push("To", "<sip:bob@example.com>");
        headers.push("Call-ID", "call-42");
        headers.push("CSeq", format!("{cseq} INVITE"));
        headers.push("Contact", "<sip:alice@10.0.0.1:5060>");
        Request::new(
            RequestLine::new(Method::Invite, SipUri::parse("sip:bob@example.com").unwrap()),
            headers,
            Bytes::new(),
        )
        .unwrap()
    }

    fn response(code: u16, req: &Request, to_tag: Option<&str>) -> Response {
        let mut headers = Headers::new();
        for h in req.headers().iter() {
            if h.name != "To" && h.name != "Contact" {
                headers.push(h.name.clone(), h.value.clone());
            }
        }
        let to = match to_tag {
            Some(tag) => format!("<sip:bob@example.com>;tag={tag}"),
            None => "<sip:bob@example.com>".to_owned(),
        };
        headers.push("To", to);
        headers.push("Contact", "<sip:bob@192.0.2.7:5070>");
        Response::new(StatusLine::new(code, "OK").unwrap(), headers, Bytes::new()).unwrap()
    }

    #[test]
    fn uac_dialog_from_provisional_is_early() {
        let req = invite(1);
        let dialog = Dialog::new_uac(&req, &response(180, &req, Some("bob-tag"))).unwrap();

        assert_eq!(dialog.id, DialogId::new("call-42", "alice-tag", "bob-tag"));
        assert_eq!(dialog.state, DialogState::Early);
        assert_eq!(dialog.remote_target.to_string(), "sip:bob@192.0.2.7:5070");
        assert_eq!(
            dialog.route_set,
            vec!["<sip:p2.example.com;lr>", "<sip:p1.example.com;lr>"]
        );
        assert_eq!(dialog.local_cseq, Some(1));
        assert_eq!(dialog.remote_cseq, None);
        assert!(dialog.is_uac);
    }

    #[test]
    fn uac_dialog_needs_to_tag_and_dialog_creating_code() {
        let req = invite(1);
        assert_eq!(
            Dialog::new_uac(&req, &response(180, &req, None)).unwrap_err(),
            DialogError::MissingTag("To")
        );
        assert_eq!(
            Dialog::new_uac(&req, &response(486, &req, Some("t"))).unwrap_err(),
            DialogError::NoDialog(486)
        );
        assert_eq!(
            Dialog::new_uac(&req, &response(100, &req, Some("t"))).unwrap_err(),
            DialogError::NoDialog(100)
        );
    }

    #[test]
    fn uas_dialog_takes_peer_values_from_request() {
        let req = invite(7);
        let dialog = Dialog::new_uas(&req, "bob-local").unwrap();

        assert_eq!(dialog.id, DialogId::new("call-42", "bob-local", "alice-tag"));
        assert_eq!(dialog.state, DialogState::Early);
        assert_eq!(dialog.remote_cseq, Some(7));
        assert_eq!(dialog.local_cseq, None);
        assert_eq!(dialog.local_party, "<sip:bob@example.com>;tag=bob-local");
        assert_eq!(dialog.remote_party, "\"Alice\" <sip:alice@example.com>;tag=alice-tag");
        assert_eq!(dialog.route_set.len(), 2);
        assert_eq!(dialog.route_set[0], "<sip:p1.example.com;lr>");
    }

    #[test]
    fn early_dialog_confirmed_by_2xx() {
        let req = invite(1);
        let mut dialog = Dialog::new_uac(&req, &response(183, &req, Some("b"))).unwrap();
        dialog.update_from_response(&response(200, &req, Some("b")));
        assert!(dialog.is_confirmed());

        dialog.terminate();
        dialog.confirm();
        assert_eq!(dialog.state, DialogState::Terminated);
    }

    #[test]
    fn local_cseq_sentinel_then_increment() {
        let req = invite(3);
        let mut uas = Dialog::new_uas(&req, "l").unwrap();
        assert_eq!(uas.next_local_cseq(), 1);
        assert_eq!(uas.next_local_cseq(), 2);

        let mut uac = Dialog::new_uac(&req, &response(200, &req, Some("b"))).unwrap();
        assert_eq!(uac.next_local_cseq(), 4);
    }

    #[test]
    fn remote_cseq_rejects_only_lower_numbers() {
        let mut dialog = Dialog::new_uas(&invite(10), "l").unwrap();

        assert_eq!(
            dialog.check_remote_cseq(9, &Method::Bye),
            Err(DialogError::StaleCSeq {
                received: 9,
                current: 10
            })
        );
        assert_eq!(dialog.remote_cseq, Some(10));

        assert!(dialog.check_remote_cseq(10, &Method::Bye).is_ok());
        assert!(dialog.check_remote_cseq(11, &Method::Bye).is_ok());
        assert_eq!(dialog.remote_cseq, Some(11));
    }

    #[test]
    fn first_remote_cseq_is_always_accepted() {
        let req = invite(1);
        let mut dialog = Dialog::new_uac(&req, &response(200, &req, Some("b"))).unwrap();
        assert!(dialog.check_remote_cseq(1, &Method::Bye).is_ok());
        assert_eq!(dialog.remote_cseq, Some(1));
    }

    #[test]
    fn ack_does_not_move_remote_cseq() {
        let mut dialog = Dialog::new_uas(&invite(5), "l").unwrap();
        assert!(dialog.check_remote_cseq(5, &Method::Ack).is_ok());
        assert!(dialog.check_remote_cseq(6, &Method::Ack).is_ok());
        assert_eq!(dialog.remote_cseq, Some(5));
    }

    #[test]
    fn manager_lookups_match_role() {
        let manager = DialogManager::new();
        let req = invite(1);
        let resp = response(200, &req, Some("bob-tag"));
        assert!(manager.insert(Dialog::new_uac(&req, &resp).unwrap()));

        assert!(manager.find_by_response(&resp).is_some());
        assert!(manager.get_by_call_id("call-42").is_some());
        assert!(manager.get_by_call_id("other").is_none());

        // A BYE from bob: From carries bob's tag, To carries ours.
        let mut headers = Headers::new();
        headers.push("From", "<sip:bob@example.com>;tag=bob-tag");
        headers.push("To", "<sip:alice@example.com>;tag=alice-tag");
        headers.push("Call-ID", "call-42");
        headers.push("CSeq", "1 BYE");
        let bye = Request::new(
            RequestLine::new(Method::Bye, SipUri::parse("sip:alice@10.0.0.1").unwrap()),
            headers,
            Bytes::new(),
        )
        .unwrap();
        assert!(manager.find_by_request(&bye).is_some());
    }

    #[test]
    fn update_runs_under_entry_lock() {
        let manager = DialogManager::new();
        let req = invite(1);
        let dialog = Dialog::new_uac(&req, &response(180, &req, Some("b"))).unwrap();
        let id = dialog.id.clone();
        manager.insert(dialog);

        let state = manager.update(&id, |d| {
            d.confirm();
            d.state
        });
        assert_eq!(state, Some(DialogState::Confirmed));
        assert!(manager.update(&DialogId::new("x", "y", "z"), |_| ()).is_none());
    }

    #[test]
    fn concurrent_removal_yields_dialog_once() {
        let manager = Arc::new(DialogManager::new());
        let req = invite(1);
        let dialog = Dialog::new_uac(&req, &response(200, &req, Some("b"))).unwrap();
        let id = dialog.id.clone();
        manager.insert(dialog);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                let id = id.clone();
                std::thread::spawn(move || manager.remove(&id).is_some())
            })
            .collect();
        let removed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|removed| *removed)
            .count();
        assert_eq!(removed, 1);
        assert_eq!(manager.count(), 0);
    }

    #[test]
    fn splits_on_commas_outside_brackets() {
        let parts = split_header_values("<sip:a;x=1,2>, \"B, C\" <sip:b>");
        assert_eq!(parts, vec!["<sip:a;x=1,2>", "\"B, C\" <sip:b>"]);
    }
}
