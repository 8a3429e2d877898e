//! Card subsystem facade.
//!
//! The controller sees smart cards only through [`CardService`]; the
//! PC/SC-backed implementation lives in [`pcsc`](self::pcsc) and vendor
//! APDU logic enters through [`EidCardDriver`]. All operations block and
//! are expected to run on worker threads; cancellation is cooperative via
//! [`CancelFlag`], checked between APDU exchanges.

pub mod algorithm;
pub mod certificate;
pub mod error;
pub mod pcsc;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::pin::PinBuffer;

use self::algorithm::{JwsAlgorithm, SignatureAlgorithm};
use self::certificate::CertificateSubject;
use self::error::CardError;

/// Which key and certificate a command operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificatePurpose {
    Authentication,
    Signing,
}

/// Cooperative cancellation flag shared between the controller and one
/// blocking facade call.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Bail out of a blocking operation if cancellation was requested.
    pub fn check(&self) -> Result<(), CardError> {
        if self.is_cancelled() {
            Err(CardError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A connected reader and whether a card is present in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderInfo {
    pub name: String,
    pub has_card: bool,
}

/// Algorithm capabilities a driver declares for a recognised card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardAlgorithms {
    pub authentication: JwsAlgorithm,
    pub signing: Vec<SignatureAlgorithm>,
}

/// A recognised eID card in a specific reader. Invalidated by removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardInfo {
    pub reader_name: String,
    pub atr: Vec<u8>,
    pub algorithms: CardAlgorithms,
}

/// PIN characteristics for one key of one card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinInfo {
    pub retries_left: u8,
    pub min_length: u8,
    pub max_length: u8,
    /// PIN entry happens on the reader's own pad; the process never sees
    /// the digits.
    pub pad_reader: bool,
}

/// Certificate and PIN metadata read from a card for one purpose.
#[derive(Debug, Clone)]
pub struct CardCertificate {
    pub card: CardInfo,
    pub purpose: CertificatePurpose,
    pub der: Vec<u8>,
    pub subject: CertificateSubject,
    pub pin: PinInfo,
}

/// Hardware change observed by the monitor or during a card wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardEvent {
    ReaderAppeared { reader: String },
    CardInserted { reader: String },
    CardRemoved { reader: String },
    ReaderSetChanged,
}

/// Sink for [`CardEvent`]s emitted from a blocking facade call.
pub type EventSink<'a> = &'a mut dyn FnMut(CardEvent);

/// Blocking card operations, one exclusive lease per command.
pub trait CardService: Send + Sync {
    fn list_readers(&self) -> Result<Vec<ReaderInfo>, CardError>;

    /// Wait until at least one recognised eID card is available, returning
    /// every candidate present at that moment so the UI can offer a
    /// chooser.
    ///
    /// `reader_timeout` bounds the wait for the first reader to appear and
    /// `card_timeout` the wait for a card after that; the distinction is
    /// reported as [`CardError::NoReader`] versus [`CardError::NoCard`].
    /// Reader and card appearances are reported through `events` as they
    /// happen.
    fn wait_for_card(
        &self,
        reader_timeout: Duration,
        card_timeout: Duration,
        cancel: &CancelFlag,
        events: EventSink<'_>,
    ) -> Result<Vec<CardInfo>, CardError>;

    fn read_certificate(
        &self,
        card: &CardInfo,
        purpose: CertificatePurpose,
    ) -> Result<CardCertificate, CardError>;

    /// Sign `digest` with the key selected by `purpose`.
    ///
    /// `pin` must be `Some` unless the card sits in a pad reader; the
    /// buffer is consumed and wiped regardless of outcome.
    fn sign(
        &self,
        card: &CardInfo,
        purpose: CertificatePurpose,
        pin: Option<PinBuffer>,
        digest: &[u8],
        cancel: &CancelFlag,
    ) -> Result<Vec<u8>, CardError>;

    /// Watch for insertions, removals and reader-set changes until
    /// cancelled. Runs on the persistent monitor thread.
    fn monitor(&self, cancel: &CancelFlag, events: EventSink<'_>) -> Result<(), CardError>;
}

/// Raw APDU exchange with a connected card.
pub trait ApduTransceiver {
    fn transmit(&mut self, apdu: &[u8]) -> Result<Vec<u8>, CardError>;
}

/// Vendor seam: everything the facade cannot know about a concrete eID
/// card family. Implementations are registered with the PC/SC service and
/// selected by ATR.
pub trait EidCardDriver: Send + Sync {
    /// Whether this driver handles cards with the given ATR.
    fn recognises(&self, atr: &[u8]) -> bool;

    /// Key algorithm capabilities for a recognised ATR.
    fn algorithms(&self, atr: &[u8]) -> CardAlgorithms;

    /// Read the DER certificate for the given purpose.
    fn read_certificate(
        &self,
        card: &mut dyn ApduTransceiver,
        purpose: CertificatePurpose,
    ) -> Result<Vec<u8>, CardError>;

    /// PIN retry counter and length constraints for the given purpose.
    /// `pad_reader` reflects the reader the card currently sits in.
    fn pin_info(
        &self,
        card: &mut dyn ApduTransceiver,
        purpose: CertificatePurpose,
        pad_reader: bool,
    ) -> Result<PinInfo, CardError>;

    /// Verify the PIN (software entry passes the collected buffer; pad
    /// readers pass `None` and use secure entry) and sign the digest.
    fn sign(
        &self,
        card: &mut dyn ApduTransceiver,
        purpose: CertificatePurpose,
        pin: Option<PinBuffer>,
        digest: &[u8],
        cancel: &CancelFlag,
    ) -> Result<Vec<u8>, CardError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flag_trips_once_set() {
        let flag = CancelFlag::new();
        assert!(flag.check().is_ok());
        let clone = flag.clone();
        clone.cancel();
        assert!(flag.is_cancelled());
        assert!(matches!(flag.check(), Err(CardError::Cancelled)));
    }
}
