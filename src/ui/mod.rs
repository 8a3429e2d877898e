//! Dialog surface facade.
//!
//! The platform toolkit stays behind [`UiBackend`]: the controller makes
//! non-blocking presentation calls on the main thread, and user intents
//! come back asynchronously through the sink installed with
//! [`UiBackend::attach`]. At most one [`Ui`] instance is alive per process.

pub mod headless;
pub mod lang;
#[cfg(unix)]
pub mod tty;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::card::{CertificatePurpose, PinInfo};
use crate::error::{CommandError, RetryReason};
use crate::pin::PinBuffer;

pub use lang::Lang;

/// A decision made by the user in a dialog.
#[derive(Debug)]
pub enum UserIntent {
    /// The user approved the operation, picking one of the candidate cards
    /// and, for software PIN entry, providing the digits.
    Confirmed {
        card_index: usize,
        pin: Option<PinBuffer>,
    },
    /// The user asked to try again after a recoverable failure.
    Retry,
    Cancelled,
}

/// One selectable card in the confirmation dialog.
#[derive(Debug, Clone)]
pub struct CandidateCard {
    pub reader: String,
    pub holder: String,
    pub pin: PinInfo,
}

/// Everything a confirmation dialog presents.
#[derive(Debug, Clone)]
pub struct ConfirmationRequest {
    pub origin: String,
    pub purpose: CertificatePurpose,
    pub candidates: Vec<CandidateCard>,
    /// Collect a PIN in the dialog. False for pad readers and for
    /// certificate disclosure.
    pub collect_pin: bool,
    /// Recoverable failure of the previous attempt, when retrying.
    pub retry: Option<RetryReason>,
}

/// Channel for intents flowing back to the controller mailbox.
pub type IntentSink = Arc<dyn Fn(UserIntent) + Send + Sync>;

/// The external-toolkit seam. Presentation calls must not block; intents
/// are delivered through the attached sink, possibly from another thread.
pub trait UiBackend: Send {
    fn attach(&mut self, intents: IntentSink);

    /// Progress note while waiting for hardware (no user decision).
    fn show_waiting(&mut self, message: &str);

    /// Progress note while a card operation runs.
    fn show_progress(&mut self, message: &str);

    /// Ask the user to approve the operation.
    fn request_confirmation(&mut self, request: ConfirmationRequest);

    /// Offer retry/cancel after a recoverable failure with no dialog
    /// context (for example an unsupported card during the wait).
    fn request_retry(&mut self, reason: RetryReason, message: &str);

    fn close(&mut self);
}

static UI_ALIVE: AtomicBool = AtomicBool::new(false);

/// The single dialog surface, owned by the main-level application object.
pub struct Ui {
    backend: Box<dyn UiBackend>,
    lang: Lang,
}

impl Ui {
    /// Wrap a backend. Fails if another [`Ui`] is alive in this process.
    pub fn new(backend: Box<dyn UiBackend>) -> Result<Self, CommandError> {
        if UI_ALIVE.swap(true, Ordering::SeqCst) {
            return Err(CommandError::programming(
                "a UI instance already exists in this process",
            ));
        }
        Ok(Self {
            backend,
            lang: Lang::default(),
        })
    }

    pub fn attach(&mut self, intents: IntentSink) {
        self.backend.attach(intents);
    }

    /// Select dialog language from the request envelope.
    pub fn set_lang(&mut self, tag: Option<&str>) {
        self.lang = Lang::from_tag(tag);
    }

    pub fn lang(&self) -> Lang {
        self.lang
    }

    pub fn show_waiting_for_reader(&mut self) {
        self.backend.show_waiting(self.lang.connect_reader());
    }

    pub fn show_waiting_for_card(&mut self) {
        self.backend.show_waiting(self.lang.insert_card());
    }

    pub fn show_reading_certificate(&mut self) {
        self.backend.show_progress(self.lang.reading_certificate());
    }

    pub fn show_operation_in_progress(&mut self) {
        self.backend.show_progress(self.lang.operation_in_progress());
    }

    pub fn request_confirmation(&mut self, request: ConfirmationRequest) {
        self.backend.request_confirmation(request);
    }

    pub fn request_retry(&mut self, reason: RetryReason) {
        let message = self.lang.retry_message(reason);
        self.backend.request_retry(reason, &message);
    }

    pub fn close(&mut self) {
        self.backend.close();
    }
}

impl Drop for Ui {
    fn drop(&mut self) {
        self.backend.close();
        UI_ALIVE.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use headless::HeadlessBackend;

    #[test]
    fn second_ui_instance_is_refused_while_first_is_alive() {
        // Other tests create UIs too; wait for our turn at the guard.
        let first = loop {
            match Ui::new(Box::new(HeadlessBackend::default())) {
                Ok(ui) => break ui,
                Err(_) => std::thread::sleep(std::time::Duration::from_millis(5)),
            }
        };
        let second = Ui::new(Box::new(HeadlessBackend::default()));
        assert!(second.is_err());
        drop(first);
    }
}
