//! PC/SC-backed [`CardService`] implementation.
//!
//! Reader enumeration, card presence tracking and APDU transport go through
//! the `pcsc` crate; everything card-family-specific is delegated to the
//! registered [`EidCardDriver`]s, selected by ATR.

use std::collections::HashMap;
use std::ffi::CString;
use std::time::{Duration, Instant, SystemTime};

use pcsc::{Context, Protocols, ReaderState, Scope, ShareMode, State, MAX_BUFFER_SIZE};
use tracing::{debug, warn};

use super::certificate::ParsedCertificate;
use super::error::CardError;
use super::{
    ApduTransceiver, CancelFlag, CardCertificate, CardEvent, CardInfo, CardService,
    CertificatePurpose, EidCardDriver, EventSink, ReaderInfo,
};
use crate::pin::PinBuffer;

/// Poll interval for status-change loops. Cancellation is observed at this
/// granularity.
const POLL_TICK: Duration = Duration::from_millis(300);

/// `CM_IOCTL_GET_FEATURE_REQUEST` per PC/SC part 10.
const IOCTL_GET_FEATURE_REQUEST: u32 = ctl_code(3400);
const FEATURE_VERIFY_PIN_START: u8 = 0x01;
const FEATURE_VERIFY_PIN_DIRECT: u8 = 0x06;

const fn ctl_code(function: u32) -> u32 {
    if cfg!(windows) {
        (0x0031 << 16) | (function << 2)
    } else {
        0x4200_0000 + function
    }
}

pub struct PcscCardService {
    context: Context,
    drivers: Vec<Box<dyn EidCardDriver>>,
}

impl PcscCardService {
    pub fn new(drivers: Vec<Box<dyn EidCardDriver>>) -> Result<Self, CardError> {
        let context = Context::establish(Scope::User)?;
        Ok(Self { context, drivers })
    }

    fn driver_for(&self, atr: &[u8]) -> Option<&dyn EidCardDriver> {
        self.drivers
            .iter()
            .map(|d| d.as_ref())
            .find(|d| d.recognises(atr))
    }

    /// Reader names with card presence, normalising "no readers" to an
    /// empty list.
    fn snapshot(&self) -> Result<Vec<ReaderInfo>, CardError> {
        let mut buf = match self.context.list_readers_len() {
            Ok(len) => vec![0u8; len],
            Err(pcsc::Error::NoReadersAvailable) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let names: Vec<CString> = match self.context.list_readers(&mut buf) {
            Ok(names) => names.map(|n| n.to_owned()).collect(),
            Err(pcsc::Error::NoReadersAvailable) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let mut states: Vec<ReaderState> = names
            .iter()
            .map(|name| ReaderState::new(name.clone(), State::UNAWARE))
            .collect();
        match self.context.get_status_change(Duration::ZERO, &mut states) {
            Ok(()) | Err(pcsc::Error::Timeout) => {}
            Err(e) => return Err(e.into()),
        }

        Ok(states
            .iter()
            .map(|state| ReaderInfo {
                name: state.name().to_string_lossy().into_owned(),
                has_card: state.event_state().contains(State::PRESENT)
                    && !state.event_state().contains(State::MUTE),
            })
            .collect())
    }

    /// Connect to the card in `reader` and identify it by ATR.
    /// `Ok(None)` means no driver recognises the card.
    fn probe(&self, reader: &str) -> Result<Option<CardInfo>, CardError> {
        let name = CString::new(reader)
            .map_err(|_| CardError::Communication("reader name contains NUL".into()))?;
        let card = match self.context.connect(&name, ShareMode::Shared, Protocols::ANY) {
            Ok(card) => card,
            // The card vanished between the status poll and the connect.
            Err(pcsc::Error::NoSmartcard | pcsc::Error::RemovedCard) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let status = card.status2_owned()?;
        let atr = status.atr().to_vec();
        debug!(reader, atr = %hex::encode(&atr), "card present");
        match self.driver_for(&atr) {
            Some(driver) => Ok(Some(CardInfo {
                reader_name: reader.to_owned(),
                atr: atr.clone(),
                algorithms: driver.algorithms(&atr),
            })),
            None => Ok(None),
        }
    }

    fn connect(&self, card: &CardInfo) -> Result<pcsc::Card, CardError> {
        let name = CString::new(card.reader_name.as_str())
            .map_err(|_| CardError::Communication("reader name contains NUL".into()))?;
        match self.context.connect(&name, ShareMode::Shared, Protocols::ANY) {
            Ok(connection) => {
                // The card may have been swapped while nobody was looking.
                let status = connection.status2_owned()?;
                if status.atr() != card.atr.as_slice() {
                    return Err(CardError::CardRemoved);
                }
                Ok(connection)
            }
            Err(pcsc::Error::NoSmartcard | pcsc::Error::RemovedCard) => Err(CardError::CardRemoved),
            Err(e) => Err(e.into()),
        }
    }

    /// PC/SC part 10 feature probe for a hardware PIN pad.
    fn is_pad_reader(&self, card: &pcsc::Card) -> bool {
        let mut buf = [0u8; 256];
        // DWORD is u64 on pcsclite and u32 on Windows.
        let features = match card.control(IOCTL_GET_FEATURE_REQUEST.into(), &[], &mut buf) {
            Ok(data) => data,
            Err(e) => {
                debug!(error = %e, "feature request not supported");
                return false;
            }
        };
        // TLV list of (tag, len=4, control code).
        features
            .chunks(6)
            .filter(|chunk| chunk.len() == 6)
            .any(|chunk| {
                chunk[0] == FEATURE_VERIFY_PIN_DIRECT || chunk[0] == FEATURE_VERIFY_PIN_START
            })
    }

    /// Block on reader-state change for up to `tick`, including plug-in
    /// notifications where the platform supports them.
    fn wait_tick(&self, readers: &[ReaderInfo], tick: Duration) {
        let mut states: Vec<ReaderState> = readers
            .iter()
            .filter_map(|r| CString::new(r.name.as_str()).ok())
            .map(|name| ReaderState::new(name, State::UNAWARE))
            .collect();
        states.push(ReaderState::new(pcsc::PNP_NOTIFICATION(), State::UNAWARE));
        match self.context.get_status_change(tick, &mut states) {
            Ok(()) | Err(pcsc::Error::Timeout) => {}
            Err(e) => {
                debug!(error = %e, "status change wait failed");
                std::thread::sleep(tick);
            }
        }
    }
}

/// Diff two presence snapshots into [`CardEvent`]s.
fn diff_snapshots(
    previous: &HashMap<String, bool>,
    current: &[ReaderInfo],
    events: EventSink<'_>,
) {
    for reader in current {
        match previous.get(&reader.name) {
            None => {
                events(CardEvent::ReaderAppeared {
                    reader: reader.name.clone(),
                });
                if reader.has_card {
                    events(CardEvent::CardInserted {
                        reader: reader.name.clone(),
                    });
                }
            }
            Some(false) if reader.has_card => events(CardEvent::CardInserted {
                reader: reader.name.clone(),
            }),
            Some(true) if !reader.has_card => events(CardEvent::CardRemoved {
                reader: reader.name.clone(),
            }),
            _ => {}
        }
    }
    if previous
        .keys()
        .any(|name| !current.iter().any(|r| &r.name == name))
    {
        events(CardEvent::ReaderSetChanged);
    }
}

fn presence_map(readers: &[ReaderInfo]) -> HashMap<String, bool> {
    readers
        .iter()
        .map(|r| (r.name.clone(), r.has_card))
        .collect()
}

impl CardService for PcscCardService {
    fn list_readers(&self) -> Result<Vec<ReaderInfo>, CardError> {
        self.snapshot()
    }

    fn wait_for_card(
        &self,
        reader_timeout: Duration,
        card_timeout: Duration,
        cancel: &CancelFlag,
        events: EventSink<'_>,
    ) -> Result<Vec<CardInfo>, CardError> {
        let start = Instant::now();
        let mut card_deadline: Option<Instant> = None;
        let mut seen = HashMap::new();

        loop {
            cancel.check()?;
            let readers = self.snapshot()?;
            diff_snapshots(&seen, &readers, events);
            seen = presence_map(&readers);

            if !readers.is_empty() && card_deadline.is_none() {
                card_deadline = Some(Instant::now() + card_timeout);
            }

            let mut candidates = Vec::new();
            let mut unknown_card = false;
            for reader in readers.iter().filter(|r| r.has_card) {
                match self.probe(&reader.name)? {
                    Some(card) => candidates.push(card),
                    None => unknown_card = true,
                }
            }
            if !candidates.is_empty() {
                return Ok(candidates);
            }
            if unknown_card {
                return Err(CardError::UnknownCard);
            }

            match card_deadline {
                None if start.elapsed() >= reader_timeout => return Err(CardError::NoReader),
                Some(deadline) if Instant::now() >= deadline => return Err(CardError::NoCard),
                _ => {}
            }

            self.wait_tick(&readers, POLL_TICK);
        }
    }

    fn read_certificate(
        &self,
        card: &CardInfo,
        purpose: CertificatePurpose,
    ) -> Result<CardCertificate, CardError> {
        let driver = self.driver_for(&card.atr).ok_or(CardError::UnknownCard)?;
        let connection = self.connect(card)?;
        let pad_reader = self.is_pad_reader(&connection);
        let mut transport = PcscTransceiver { card: &connection };

        let der = driver.read_certificate(&mut transport, purpose)?;
        let parsed = ParsedCertificate::from_der(&der)?;
        if parsed.expired_at(SystemTime::now()) {
            warn!(reader = %card.reader_name, "certificate has expired");
            return Err(CardError::UnknownCard);
        }
        let pin = driver.pin_info(&mut transport, purpose, pad_reader)?;

        Ok(CardCertificate {
            card: card.clone(),
            purpose,
            der,
            subject: parsed.subject,
            pin,
        })
    }

    fn sign(
        &self,
        card: &CardInfo,
        purpose: CertificatePurpose,
        pin: Option<PinBuffer>,
        digest: &[u8],
        cancel: &CancelFlag,
    ) -> Result<Vec<u8>, CardError> {
        let driver = self.driver_for(&card.atr).ok_or(CardError::UnknownCard)?;
        let connection = self.connect(card)?;
        let mut transport = PcscTransceiver { card: &connection };
        cancel.check()?;
        driver.sign(&mut transport, purpose, pin, digest, cancel)
    }

    fn monitor(&self, cancel: &CancelFlag, events: EventSink<'_>) -> Result<(), CardError> {
        let mut seen = presence_map(&self.snapshot().unwrap_or_default());
        while !cancel.is_cancelled() {
            let readers = match self.snapshot() {
                Ok(readers) => readers,
                Err(CardError::ServiceUnavailable(message)) => {
                    return Err(CardError::ServiceUnavailable(message));
                }
                Err(e) => {
                    debug!(error = %e, "monitor snapshot failed");
                    std::thread::sleep(POLL_TICK);
                    continue;
                }
            };
            diff_snapshots(&seen, &readers, events);
            seen = presence_map(&readers);
            self.wait_tick(&readers, POLL_TICK);
        }
        Ok(())
    }
}

struct PcscTransceiver<'a> {
    card: &'a pcsc::Card,
}

impl ApduTransceiver for PcscTransceiver<'_> {
    fn transmit(&mut self, apdu: &[u8]) -> Result<Vec<u8>, CardError> {
        let mut buf = [0u8; MAX_BUFFER_SIZE];
        let response = self.card.transmit(apdu, &mut buf)?;
        Ok(response.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_diff_reports_transitions() {
        let mut events = Vec::new();
        let previous = HashMap::from([("A".to_string(), false), ("B".to_string(), true)]);
        let current = vec![
            ReaderInfo {
                name: "A".into(),
                has_card: true,
            },
            ReaderInfo {
                name: "C".into(),
                has_card: false,
            },
        ];
        diff_snapshots(&previous, &current, &mut |e| events.push(e));
        assert!(events.contains(&CardEvent::CardInserted { reader: "A".into() }));
        assert!(events.contains(&CardEvent::ReaderAppeared { reader: "C".into() }));
        assert!(events.contains(&CardEvent::ReaderSetChanged));
    }

    #[test]
    fn ctl_code_matches_platform_encoding() {
        if cfg!(windows) {
            assert_eq!(ctl_code(3400), (0x0031 << 16) | (3400 << 2));
        } else {
            assert_eq!(ctl_code(3400), 0x4200_0000 + 3400);
        }
    }
}
