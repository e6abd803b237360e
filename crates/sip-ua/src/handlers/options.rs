//! OPTIONS request handler.
//!
//! Answers 200 with the methods we allow and our media capabilities, in or
//! out of a dialog.

use std::sync::Arc;

use async_trait::async_trait;
use sip_core::{Method, Request};
use sip_dialog::Dialog;
use sip_transaction::ServerTransactionHandle;
use tracing::debug;

use super::RequestHandler;
use crate::{context::MethodContext, response::generate_response, UaError, ALLOWED_METHODS};

pub struct OptionsHandler {
    ctx: Arc<MethodContext>,
}

impl OptionsHandler {
    pub fn new(ctx: Arc<MethodContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl RequestHandler for OptionsHandler {
    async fn handle(
        &self,
        request: &Request,
        handle: ServerTransactionHandle,
        dialog: Option<Dialog>,
    ) -> Result<(), UaError> {
        let tag = dialog.is_none().then(|| self.ctx.ids.tag());
        let mut response = generate_response(request, 200, tag.as_deref())?;
        let headers = response.headers_mut();
        headers.push("Allow", ALLOWED_METHODS);
        headers.push("Accept", "application/sdp");
        headers.push("Contact", self.ctx.contact());
        headers.push("Content-Type", "application/sdp");
        response.set_body(self.ctx.sdp.capabilities())?;

        debug!(call_id = request.call_id().unwrap_or_default(), "answering OPTIONS");
        handle.send_response(response).await?;
        Ok(())
    }

    fn method(&self) -> Method {
        Method::Options
    }
}
