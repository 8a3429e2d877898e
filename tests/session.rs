//! End-to-end session tests driving the real controller, parser and
//! framing over a mock card service (with a software P-256 eID card) and a
//! scripted UI.

use std::collections::VecDeque;
use std::io::{self, Read};
use std::str::FromStr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use signature::hazmat::{PrehashSigner, PrehashVerifier};

use web_eid_helper::app::{App, EXIT_OK};
use web_eid_helper::card::algorithm::{
    CryptoAlgorithm, HashFunction, JwsAlgorithm, PaddingScheme, SignatureAlgorithm,
};
use web_eid_helper::card::certificate::ParsedCertificate;
use web_eid_helper::card::error::CardError;
use web_eid_helper::card::{
    CancelFlag, CardAlgorithms, CardCertificate, CardInfo, CardService, CertificatePurpose,
    EventSink, PinInfo, ReaderInfo,
};
use web_eid_helper::command::authenticate::authentication_digest;
use web_eid_helper::config::{Config, UiKind};
use web_eid_helper::error::RetryReason;
use web_eid_helper::framing::{FrameReader, FrameWriter};
use web_eid_helper::pin::PinBuffer;
use web_eid_helper::ui::{ConfirmationRequest, IntentSink, Ui, UiBackend, UserIntent};

const READER_NAME: &str = "Mock Reader 0";
const TEST_NONCE: &str = "dGhpcy1pcy1hLXRlc3Qtbm9uY2Utd2l0aC1lbm91Z2gtbGVuZ3Ro";

// ---------------------------------------------------------------------------
// Software eID card

struct TestCard {
    key: p256::ecdsa::SigningKey,
    der: Vec<u8>,
}

impl TestCard {
    fn generate() -> Self {
        use x509_cert::builder::{Builder, CertificateBuilder, Profile};
        use x509_cert::der::{Decode, Encode};
        use x509_cert::name::Name;
        use x509_cert::serial_number::SerialNumber;
        use x509_cert::spki::SubjectPublicKeyInfoOwned;
        use x509_cert::time::Validity;

        // A fixed, valid P-256 scalar keeps the suite deterministic.
        let key = p256::ecdsa::SigningKey::from_slice(&[0x17; 32]).unwrap();
        let verifying_key = p256::ecdsa::VerifyingKey::from(&key);
        let spki_der = {
            use p256::pkcs8::EncodePublicKey;
            verifying_key.to_public_key_der().unwrap()
        };
        let spki = SubjectPublicKeyInfoOwned::from_der(spki_der.as_bytes()).unwrap();

        let builder = CertificateBuilder::new(
            Profile::Root,
            SerialNumber::from(42u32),
            Validity::from_now(Duration::from_secs(3600)).unwrap(),
            Name::from_str("CN=JAAK-KRISTJAN JÕEORG,O=ESTEID,C=EE").unwrap(),
            spki,
            &key,
        )
        .unwrap();
        let certificate = builder.build::<p256::ecdsa::DerSignature>().unwrap();
        Self {
            key,
            der: certificate.to_der().unwrap(),
        }
    }

    fn verifying_key(&self) -> p256::ecdsa::VerifyingKey {
        p256::ecdsa::VerifyingKey::from(&self.key)
    }
}

// ---------------------------------------------------------------------------
// Mock card service

#[derive(Default)]
struct MockState {
    reader_attached: bool,
    card_present: bool,
    /// Scripted sign failures, consumed before signing succeeds.
    sign_failures: VecDeque<CardError>,
    /// Number of card I/O operations performed.
    io_count: usize,
    /// The last software PIN received by a sign call, wiped on exit.
    last_pin: Option<PinBuffer>,
    /// Signalled when a sign call begins, for quit-mid-operation tests.
    sign_started: Option<Sender<()>>,
    /// Make sign calls block until cancelled.
    block_sign: bool,
    /// Report the present card as unrecognised.
    unknown_card: bool,
}

struct MockCardService {
    card: TestCard,
    state: Mutex<MockState>,
}

impl MockCardService {
    fn new(reader_attached: bool, card_present: bool) -> Arc<Self> {
        Arc::new(Self {
            card: TestCard::generate(),
            state: Mutex::new(MockState {
                reader_attached,
                card_present,
                ..MockState::default()
            }),
        })
    }

    fn card_info(&self) -> CardInfo {
        CardInfo {
            reader_name: READER_NAME.into(),
            atr: vec![0x3B, 0xDB, 0x96, 0x00, 0x80, 0xB1, 0xFE, 0x45, 0x1F, 0x83],
            algorithms: CardAlgorithms {
                authentication: JwsAlgorithm::Es384,
                signing: vec![
                    SignatureAlgorithm::new(
                        CryptoAlgorithm::Ecc,
                        PaddingScheme::None,
                        HashFunction::Sha256,
                    ),
                    SignatureAlgorithm::new(
                        CryptoAlgorithm::Ecc,
                        PaddingScheme::None,
                        HashFunction::Sha384,
                    ),
                ],
            },
        }
    }

    fn io_count(&self) -> usize {
        self.state.lock().unwrap().io_count
    }

    fn inspect_last_pin<T>(&self, f: impl FnOnce(Option<&PinBuffer>) -> T) -> T {
        f(self.state.lock().unwrap().last_pin.as_ref())
    }
}

impl CardService for MockCardService {
    fn list_readers(&self) -> Result<Vec<ReaderInfo>, CardError> {
        let state = self.state.lock().unwrap();
        Ok(if state.reader_attached {
            vec![ReaderInfo {
                name: READER_NAME.into(),
                has_card: state.card_present,
            }]
        } else {
            Vec::new()
        })
    }

    fn wait_for_card(
        &self,
        reader_timeout: Duration,
        card_timeout: Duration,
        cancel: &CancelFlag,
        events: EventSink<'_>,
    ) -> Result<Vec<CardInfo>, CardError> {
        let start = Instant::now();
        let mut reader_reported = false;
        loop {
            cancel.check()?;
            let (reader_attached, card_present) = {
                let state = self.state.lock().unwrap();
                (state.reader_attached, state.card_present)
            };
            if reader_attached && !reader_reported {
                reader_reported = true;
                events(web_eid_helper::card::CardEvent::ReaderAppeared {
                    reader: READER_NAME.into(),
                });
            }
            if reader_attached && card_present {
                if self.state.lock().unwrap().unknown_card {
                    return Err(CardError::UnknownCard);
                }
                return Ok(vec![self.card_info()]);
            }
            if !reader_attached && start.elapsed() >= reader_timeout {
                return Err(CardError::NoReader);
            }
            if reader_attached && start.elapsed() >= card_timeout {
                return Err(CardError::NoCard);
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn read_certificate(
        &self,
        card: &CardInfo,
        purpose: CertificatePurpose,
    ) -> Result<CardCertificate, CardError> {
        self.state.lock().unwrap().io_count += 1;
        let parsed = ParsedCertificate::from_der(&self.card.der)?;
        Ok(CardCertificate {
            card: card.clone(),
            purpose,
            der: self.card.der.clone(),
            subject: parsed.subject,
            pin: PinInfo {
                retries_left: 3,
                min_length: 4,
                max_length: 12,
                pad_reader: false,
            },
        })
    }

    fn sign(
        &self,
        _card: &CardInfo,
        _purpose: CertificatePurpose,
        pin: Option<PinBuffer>,
        digest: &[u8],
        cancel: &CancelFlag,
    ) -> Result<Vec<u8>, CardError> {
        let (scripted_failure, block) = {
            let mut state = self.state.lock().unwrap();
            state.io_count += 1;
            if let Some(mut pin) = pin {
                // The facade contract: the buffer is consumed and wiped on
                // exit no matter how the call ends. Keep the wiped storage
                // around so tests can inspect it.
                pin.wipe();
                state.last_pin = Some(pin);
            }
            if let Some(started) = &state.sign_started {
                let _ = started.send(());
            }
            (state.sign_failures.pop_front(), state.block_sign)
        };

        if block {
            loop {
                cancel.check()?;
                thread::sleep(Duration::from_millis(5));
            }
        }
        if let Some(failure) = scripted_failure {
            return Err(failure);
        }

        let signature: p256::ecdsa::Signature = self
            .card
            .key
            .sign_prehash(digest)
            .map_err(|e| CardError::Communication(e.to_string()))?;
        Ok(signature.to_vec())
    }

    fn monitor(&self, cancel: &CancelFlag, _events: EventSink<'_>) -> Result<(), CardError> {
        while !cancel.is_cancelled() {
            thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Scripted UI

#[derive(Clone, Debug)]
enum ScriptedAction {
    Confirm { card_index: usize, pin: Option<&'static str> },
    Cancel,
    Retry,
}

#[derive(Clone, Default)]
struct UiScript {
    actions: Arc<Mutex<VecDeque<ScriptedAction>>>,
    confirmations: Arc<Mutex<Vec<ConfirmationRequest>>>,
    retries: Arc<Mutex<Vec<RetryReason>>>,
}

impl UiScript {
    fn with_actions(actions: impl IntoIterator<Item = ScriptedAction>) -> Self {
        let script = Self::default();
        script.actions.lock().unwrap().extend(actions);
        script
    }

    fn confirmations(&self) -> Vec<ConfirmationRequest> {
        self.confirmations.lock().unwrap().clone()
    }

    fn retries(&self) -> Vec<RetryReason> {
        self.retries.lock().unwrap().clone()
    }

    fn backend(&self) -> ScriptedBackend {
        ScriptedBackend {
            script: self.clone(),
            intents: None,
        }
    }
}

struct ScriptedBackend {
    script: UiScript,
    intents: Option<IntentSink>,
}

impl ScriptedBackend {
    fn play_next(&self) {
        let action = self
            .script
            .actions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ScriptedAction::Cancel);
        let Some(intents) = &self.intents else { return };
        match action {
            ScriptedAction::Confirm { card_index, pin } => {
                let pin = pin.map(|digits| {
                    let mut buffer = PinBuffer::new();
                    for byte in digits.bytes() {
                        buffer.push(byte).unwrap();
                    }
                    buffer
                });
                intents(UserIntent::Confirmed { card_index, pin });
            }
            ScriptedAction::Cancel => intents(UserIntent::Cancelled),
            ScriptedAction::Retry => intents(UserIntent::Retry),
        }
    }
}

impl UiBackend for ScriptedBackend {
    fn attach(&mut self, intents: IntentSink) {
        self.intents = Some(intents);
    }

    fn show_waiting(&mut self, _message: &str) {}

    fn show_progress(&mut self, _message: &str) {}

    fn request_confirmation(&mut self, request: ConfirmationRequest) {
        self.script.confirmations.lock().unwrap().push(request);
        self.play_next();
    }

    fn request_retry(&mut self, reason: RetryReason, _message: &str) {
        self.script.retries.lock().unwrap().push(reason);
        self.play_next();
    }

    fn close(&mut self) {}
}

// ---------------------------------------------------------------------------
// Session harness

/// Byte stream fed from a channel; EOF when the sender is dropped.
struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    position: usize,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.position >= self.pending.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.pending = chunk;
                    self.position = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let available = &self.pending[self.position..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.position += n;
        Ok(n)
    }
}

struct Session {
    input: Option<Sender<Vec<u8>>>,
    handle: thread::JoinHandle<(i32, Vec<u8>)>,
}

impl Session {
    fn start(service: Arc<dyn CardService>, script: &UiScript, config: Config) -> Self {
        let script = script.clone();
        let (input, rx) = mpsc::channel::<Vec<u8>>();
        let handle = thread::spawn(move || {
            let ui = acquire_ui(|| Box::new(script.backend()));
            let app = App::new(config, service, ui);
            let reader = FrameReader::new(ChannelReader {
                rx,
                pending: Vec::new(),
                position: 0,
            });
            let mut output = Vec::new();
            let exit = app.run(reader, FrameWriter::new(&mut output));
            (exit, output)
        });
        Self {
            input: Some(input),
            handle,
        }
    }

    fn send(&self, request: &Value) {
        let body = serde_json::to_vec(request).unwrap();
        let mut framed = (body.len() as u32).to_le_bytes().to_vec();
        framed.extend_from_slice(&body);
        self.input.as_ref().unwrap().send(framed).unwrap();
    }

    fn send_raw(&self, bytes: Vec<u8>) {
        self.input.as_ref().unwrap().send(bytes).unwrap();
    }

    fn close_input(&mut self) {
        self.input.take();
    }

    fn finish(self) -> (i32, Vec<Value>) {
        let (exit, output) = self.handle.join().unwrap();
        (exit, parse_frames(&output))
    }
}

/// The process-wide single-UI guard means parallel tests take turns.
/// `Ui::new` consumes its backend, so retries mint a fresh one.
fn acquire_ui(make_backend: impl Fn() -> Box<dyn UiBackend>) -> Ui {
    loop {
        match Ui::new(make_backend()) {
            Ok(ui) => return ui,
            Err(_) => thread::sleep(Duration::from_millis(5)),
        }
    }
}

fn parse_frames(mut bytes: &[u8]) -> Vec<Value> {
    let mut frames = Vec::new();
    while bytes.len() >= 4 {
        let len = u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize;
        frames.push(serde_json::from_slice(&bytes[4..4 + len]).unwrap());
        bytes = &bytes[4 + len..];
    }
    frames
}

fn test_config() -> Config {
    Config {
        reader_timeout: Duration::from_millis(500),
        card_timeout: Duration::from_millis(500),
        allowed_insecure_origins: Vec::new(),
        ui: UiKind::Headless,
    }
}

fn authenticate_request(id: &str, nonce: &str, origin: &str) -> Value {
    json!({
        "id": id,
        "command": "authenticate",
        "arguments": { "challengeNonce": nonce, "origin": origin }
    })
}

// ---------------------------------------------------------------------------
// Scenarios

#[test]
fn status_reports_version_and_echoes_id() {
    let service = MockCardService::new(true, true);
    let script = UiScript::default();
    let mut session = Session::start(service, &script, test_config());

    session.send(&json!({"id": "1", "command": "status"}));
    session.close_input();
    let (exit, responses) = session.finish();

    assert_eq!(exit, EXIT_OK);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0]["id"], json!("1"));
    assert_eq!(
        responses[0]["version"],
        json!(env!("CARGO_PKG_VERSION"))
    );
}

#[test]
fn short_nonce_is_rejected_before_any_card_io() {
    let service = MockCardService::new(true, true);
    let script = UiScript::default();
    let session = Session::start(service.clone(), &script, test_config());

    session.send(&authenticate_request("2", "short", "https://example.org"));
    let (_, responses) = session.finish();

    assert_eq!(responses.len(), 1);
    assert_eq!(
        responses[0]["error"]["code"],
        json!("ERR_WEBEID_NATIVE_INVALID_ARGUMENT")
    );
    assert!(responses[0]["error"]["message"]
        .as_str()
        .unwrap()
        .contains("at least 44 characters"));
    assert_eq!(service.io_count(), 0);
}

#[test]
fn non_https_origin_is_rejected() {
    let service = MockCardService::new(true, true);
    let script = UiScript::default();
    let session = Session::start(service, &script, test_config());

    session.send(&authenticate_request("3", TEST_NONCE, "http://example.org"));
    let (_, responses) = session.finish();

    assert_eq!(
        responses[0]["error"]["code"],
        json!("ERR_WEBEID_NATIVE_INVALID_ARGUMENT")
    );
}

#[test]
fn no_reader_times_out_with_the_dedicated_code() {
    let service = MockCardService::new(false, false);
    let script = UiScript::default();
    let session = Session::start(service, &script, test_config());

    session.send(&authenticate_request("4", TEST_NONCE, "https://example.org"));
    let (exit, responses) = session.finish();

    assert_eq!(exit, EXIT_OK);
    assert_eq!(responses.len(), 1);
    assert_eq!(
        responses[0]["error"]["code"],
        json!("ERR_WEBEID_NO_SMART_CARD_READERS")
    );
}

#[test]
fn reader_without_card_times_out_with_no_card_code() {
    let service = MockCardService::new(true, false);
    let script = UiScript::default();
    let session = Session::start(service, &script, test_config());

    session.send(&authenticate_request("4b", TEST_NONCE, "https://example.org"));
    let (_, responses) = session.finish();

    assert_eq!(responses[0]["error"]["code"], json!("ERR_WEBEID_NO_SMART_CARD"));
}

#[test]
fn sign_hash_length_mismatch_is_rejected_without_card_io() {
    let service = MockCardService::new(true, true);
    let script = UiScript::default();
    let session = Session::start(service.clone(), &script, test_config());

    session.send(&json!({
        "id": "5",
        "command": "sign",
        "arguments": {
            "origin": "https://sign.example.org",
            "hash": BASE64.encode([7u8; 32]),
            "hashFunction": "SHA-384"
        }
    }));
    let (_, responses) = session.finish();

    assert_eq!(
        responses[0]["error"]["code"],
        json!("ERR_WEBEID_NATIVE_INVALID_ARGUMENT")
    );
    assert_eq!(service.io_count(), 0);
}

#[test]
fn successful_authenticate_produces_a_verifiable_token() {
    let service = MockCardService::new(true, true);
    let script = UiScript::with_actions([ScriptedAction::Confirm {
        card_index: 0,
        pin: Some("1234"),
    }]);
    let session = Session::start(service.clone(), &script, test_config());

    let origin = "https://example.org";
    session.send(&authenticate_request("6", TEST_NONCE, origin));
    let (exit, responses) = session.finish();

    assert_eq!(exit, EXIT_OK);
    assert_eq!(responses.len(), 1);
    let token = &responses[0];
    assert_eq!(token["id"], json!("6"));
    assert_eq!(token["format"], json!("web-eid:1.0"));
    assert_eq!(token["algorithm"], json!("ES384"));
    assert_eq!(token["appVersion"], json!(env!("CARGO_PKG_VERSION")));

    // The certificate decodes to valid DER.
    let der = BASE64
        .decode(token["unverifiedCertificate"].as_str().unwrap())
        .unwrap();
    use x509_cert::der::Decode;
    x509_cert::Certificate::from_der(&der).unwrap();

    // The signature verifies over hash(hash(origin) || hash(nonce)) under
    // the declared algorithm's digest.
    let digest = authentication_digest(HashFunction::Sha384, origin, TEST_NONCE);
    let raw = BASE64.decode(token["signature"].as_str().unwrap()).unwrap();
    let signature = p256::ecdsa::Signature::from_slice(&raw).unwrap();
    service
        .card
        .verifying_key()
        .verify_prehash(&digest, &signature)
        .unwrap();

    // The confirmation dialog showed the serialized origin and the holder.
    let confirmations = script.confirmations();
    assert_eq!(confirmations.len(), 1);
    assert_eq!(confirmations[0].origin, origin);
    assert_eq!(confirmations[0].candidates.len(), 1);
    assert_eq!(confirmations[0].candidates[0].holder, "JAAK-KRISTJAN JÕEORG");
}

#[test]
fn get_signing_certificate_returns_cert_and_algorithms_without_pin() {
    let service = MockCardService::new(true, true);
    let script = UiScript::with_actions([ScriptedAction::Confirm {
        card_index: 0,
        pin: None,
    }]);
    let session = Session::start(service.clone(), &script, test_config());

    session.send(&json!({
        "id": "7",
        "command": "get-signing-certificate",
        "arguments": { "origin": "https://sign.example.org" }
    }));
    let (_, responses) = session.finish();

    let payload = &responses[0];
    let der = BASE64
        .decode(payload["certificate"].as_str().unwrap())
        .unwrap();
    use x509_cert::der::Decode;
    x509_cert::Certificate::from_der(&der).unwrap();

    let algorithms = payload["supportedSignatureAlgorithms"].as_array().unwrap();
    assert_eq!(algorithms.len(), 2);
    assert_eq!(algorithms[0]["cryptoAlgorithm"], json!("ECC"));
    assert_eq!(algorithms[0]["paddingScheme"], json!("NONE"));

    // No PIN dialog content was required.
    assert!(!script.confirmations()[0].collect_pin);
    // Only the certificate read touched the card.
    assert_eq!(service.io_count(), 1);
}

#[test]
fn sign_returns_signature_over_the_submitted_digest() {
    let service = MockCardService::new(true, true);
    let script = UiScript::with_actions([ScriptedAction::Confirm {
        card_index: 0,
        pin: Some("54321"),
    }]);
    let session = Session::start(service.clone(), &script, test_config());

    let digest = [0xAB_u8; 48];
    session.send(&json!({
        "id": "8",
        "command": "sign",
        "arguments": {
            "origin": "https://sign.example.org",
            "hash": BASE64.encode(digest),
            "hashFunction": "SHA-384"
        }
    }));
    let (_, responses) = session.finish();

    let payload = &responses[0];
    assert_eq!(
        payload["signatureAlgorithm"],
        json!({
            "cryptoAlgorithm": "ECC",
            "paddingScheme": "NONE",
            "hashFunction": "SHA-384"
        })
    );
    let raw = BASE64.decode(payload["signature"].as_str().unwrap()).unwrap();
    let signature = p256::ecdsa::Signature::from_slice(&raw).unwrap();
    service
        .card
        .verifying_key()
        .verify_prehash(&digest, &signature)
        .unwrap();
}

// ---------------------------------------------------------------------------
// Retry, cancellation and PIN properties

#[test]
fn wrong_pin_offers_retry_with_decremented_counter() {
    let service = MockCardService::new(true, true);
    service
        .state
        .lock()
        .unwrap()
        .sign_failures
        .push_back(CardError::WrongPin { retries_left: 2 });
    let script = UiScript::with_actions([
        ScriptedAction::Confirm {
            card_index: 0,
            pin: Some("9999"),
        },
        ScriptedAction::Confirm {
            card_index: 0,
            pin: Some("1234"),
        },
    ]);
    let session = Session::start(service.clone(), &script, test_config());

    session.send(&authenticate_request("9", TEST_NONCE, "https://example.org"));
    let (_, responses) = session.finish();

    // The command ultimately succeeded.
    assert_eq!(responses.len(), 1);
    assert!(responses[0].get("error").is_none());

    let confirmations = script.confirmations();
    assert_eq!(confirmations.len(), 2);
    assert!(confirmations[0].retry.is_none());
    assert_eq!(
        confirmations[1].retry,
        Some(RetryReason::WrongPin { retries_left: 2 })
    );
    assert_eq!(confirmations[1].candidates[0].pin.retries_left, 2);
}

#[test]
fn exhausted_pin_is_terminal_and_shows_no_further_dialog() {
    let service = MockCardService::new(true, true);
    service
        .state
        .lock()
        .unwrap()
        .sign_failures
        .push_back(CardError::WrongPin { retries_left: 0 });
    let script = UiScript::with_actions([ScriptedAction::Confirm {
        card_index: 0,
        pin: Some("0000"),
    }]);
    let session = Session::start(service.clone(), &script, test_config());

    session.send(&authenticate_request("10", TEST_NONCE, "https://example.org"));
    let (_, responses) = session.finish();

    assert_eq!(responses[0]["error"]["code"], json!("ERR_WEBEID_PIN_BLOCKED"));
    assert_eq!(script.confirmations().len(), 1);
}

#[test]
fn user_cancellation_is_terminal() {
    let service = MockCardService::new(true, true);
    let script = UiScript::with_actions([ScriptedAction::Cancel]);
    let session = Session::start(service, &script, test_config());

    session.send(&authenticate_request("11", TEST_NONCE, "https://example.org"));
    let (_, responses) = session.finish();

    assert_eq!(
        responses[0]["error"]["code"],
        json!("ERR_WEBEID_USER_CANCELLED")
    );
}

#[test]
fn pin_buffer_storage_is_zeroed_after_signing() {
    let service = MockCardService::new(true, true);
    let script = UiScript::with_actions([ScriptedAction::Confirm {
        card_index: 0,
        pin: Some("123456"),
    }]);
    let session = Session::start(service.clone(), &script, test_config());

    session.send(&authenticate_request("12", TEST_NONCE, "https://example.org"));
    let (_, responses) = session.finish();
    assert!(responses[0].get("error").is_none());

    service.inspect_last_pin(|pin| {
        let pin = pin.expect("sign call received a PIN buffer");
        assert!(pin.is_empty());
        assert!(pin.raw_storage().iter().all(|&b| b == 0));
    });
}

#[test]
fn quit_mid_operation_cancels_promptly_and_acknowledges() {
    let service = MockCardService::new(true, true);
    let (started_tx, started_rx) = mpsc::channel();
    {
        let mut state = service.state.lock().unwrap();
        state.block_sign = true;
        state.sign_started = Some(started_tx);
    }
    let script = UiScript::with_actions([ScriptedAction::Confirm {
        card_index: 0,
        pin: Some("1234"),
    }]);
    let mut session = Session::start(service.clone(), &script, test_config());

    session.send(&authenticate_request("13", TEST_NONCE, "https://example.org"));
    started_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("sign never started");

    let quit_sent = Instant::now();
    session.send(&json!({"id": "14", "command": "quit"}));
    session.close_input();
    let (exit, responses) = session.finish();

    // Cancellation must propagate within one APDU round-trip's worth of
    // wall time, not a reader timeout.
    assert!(quit_sent.elapsed() < Duration::from_secs(2));
    assert_eq!(exit, EXIT_OK);
    assert_eq!(responses.len(), 2);
    assert_eq!(
        responses[0]["error"]["code"],
        json!("ERR_WEBEID_USER_CANCELLED")
    );
    assert_eq!(responses[0]["id"], json!("13"));
    assert_eq!(responses[1], json!({"id": "14"}));

    // The PIN buffer was wiped despite the aborted operation.
    service.inspect_last_pin(|pin| {
        let pin = pin.expect("sign call received a PIN buffer");
        assert!(pin.raw_storage().iter().all(|&b| b == 0));
    });
}

#[test]
fn unsupported_card_offers_retry_until_cancelled() {
    let service = MockCardService::new(true, true);
    service.state.lock().unwrap().unknown_card = true;
    let script = UiScript::with_actions([ScriptedAction::Retry, ScriptedAction::Cancel]);
    let session = Session::start(service.clone(), &script, test_config());

    session.send(&authenticate_request("14b", TEST_NONCE, "https://example.org"));
    let (_, responses) = session.finish();

    assert_eq!(
        responses[0]["error"]["code"],
        json!("ERR_WEBEID_USER_CANCELLED")
    );
    // Two retry prompts: the initial failure and the one after retrying.
    assert_eq!(
        script.retries(),
        vec![RetryReason::UnknownCard, RetryReason::UnknownCard]
    );
}

#[test]
fn unknown_command_gets_an_error_and_the_session_continues() {
    let service = MockCardService::new(true, true);
    let script = UiScript::default();
    let mut session = Session::start(service, &script, test_config());

    session.send(&json!({"id": "15", "command": "transmogrify"}));
    session.send(&json!({"id": "16", "command": "status"}));
    session.close_input();
    let (exit, responses) = session.finish();

    assert_eq!(exit, EXIT_OK);
    assert_eq!(responses.len(), 2);
    assert_eq!(
        responses[0]["error"]["code"],
        json!("ERR_WEBEID_NATIVE_INVALID_ARGUMENT")
    );
    assert_eq!(responses[1]["id"], json!("16"));
}

#[test]
fn oversized_frame_fails_the_session_with_exit_code_2() {
    let service = MockCardService::new(true, true);
    let script = UiScript::default();
    let mut session = Session::start(service, &script, test_config());

    session.send_raw((u32::MAX).to_le_bytes().to_vec());
    session.close_input();
    let (exit, responses) = session.finish();

    assert_eq!(exit, 2);
    // A best-effort terminal error was still written.
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0]["error"]["code"], json!("ERR_WEBEID_NATIVE_FATAL"));
}
