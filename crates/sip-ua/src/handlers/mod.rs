// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Method handlers.
//!
//! Each module holds both sides of one method: the [`RequestHandler`] that
//! answers inbound requests and, where the user agent sends the method, the
//! client-side logic with its transaction owner.

use async_trait::async_trait;
use sip_core::{Method, Request};
use sip_dialog::Dialog;
use sip_transaction::ServerTransactionHandle;

use crate::{response::generate_response, UaError};

pub mod bye;
pub mod cancel;
pub mod invite;
pub mod options;
pub mod register;

pub use bye::ByeHandler;
pub use cancel::CancelHandler;
pub use invite::InviteHandler;
pub use options::OptionsHandler;
pub use register::RegisterHandler;

/// Handler for one inbound request method.
///
/// `dialog` is the dialog the request belongs to, already checked for CSeq
/// order; `None` for requests outside a dialog.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(
        &self,
        request: &Request,
        handle: ServerTransactionHandle,
        dialog: Option<Dialog>,
    ) -> Result<(), UaError>;

    fn method(&self) -> Method;
}

/// Sends a bodiless response with the standard reason phrase.
pub(crate) async fn respond(
    handle: &ServerTransactionHandle,
    request: &Request,
    code: u16,
    to_tag: Option<&str>,
) -> Result<(), UaError> {
    let response = generate_response(request, code, to_tag)?;
    handle.send_response(response).await?;
    Ok(())
}

/// True for the two challenge codes.
pub(crate) fn is_challenge(code: u16) -> bool {
    code == 401 || code == 407
}
