//! UI backend for environments without an interaction surface.
//!
//! Progress goes to the log; anything requiring a user decision is
//! cancelled immediately, so commands fail with `ERR_WEBEID_USER_CANCELLED`
//! instead of hanging a headless session.

use tracing::info;

use crate::error::RetryReason;

use super::{ConfirmationRequest, IntentSink, UiBackend, UserIntent};

#[derive(Default)]
pub struct HeadlessBackend {
    intents: Option<IntentSink>,
}

impl UiBackend for HeadlessBackend {
    fn attach(&mut self, intents: IntentSink) {
        self.intents = Some(intents);
    }

    fn show_waiting(&mut self, message: &str) {
        info!(target: "webeid::ui", "{message}");
    }

    fn show_progress(&mut self, message: &str) {
        info!(target: "webeid::ui", "{message}");
    }

    fn request_confirmation(&mut self, request: ConfirmationRequest) {
        info!(
            target: "webeid::ui",
            origin = %request.origin,
            "no interaction surface, cancelling confirmation"
        );
        if let Some(intents) = &self.intents {
            intents(UserIntent::Cancelled);
        }
    }

    fn request_retry(&mut self, _reason: RetryReason, message: &str) {
        info!(target: "webeid::ui", "no interaction surface, cancelling retry: {message}");
        if let Some(intents) = &self.intents {
            intents(UserIntent::Cancelled);
        }
    }

    fn close(&mut self) {}
}
