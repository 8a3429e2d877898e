//! The per-command controller state machine.
//!
//! The controller runs its mailbox loop on the main thread and owns the UI,
//! the card facade lease and at most one run-worker at a time. Workers, the
//! card-event monitor, the UI backend and the input pump all communicate
//! with it exclusively through [`ControllerEvent`] messages over a bounded
//! mailbox.

pub mod worker;

use std::io::Write;
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::app;
use crate::card::error::CardError;
use crate::card::{CancelFlag, CardCertificate, CardEvent, CardInfo, CardService, CertificatePurpose};
use crate::command::{Command, CommandHandler, HandlerError, Origin, ParsedRequest};
use crate::config::Config;
use crate::error::{CommandError, RetryReason};
use crate::framing::{error_response, success_response, FrameWriter, FramingError};
use crate::pin::PinBuffer;
use crate::ui::{CandidateCard, ConfirmationRequest, Ui, UserIntent};

use self::worker::WorkerHandle;

/// Mailbox depth. Senders block briefly when the controller lags.
pub const MAILBOX_CAPACITY: usize = 32;

/// Everything that can wake the controller.
pub enum ControllerEvent {
    Card(CardEvent),
    Intent(UserIntent),
    WorkerDone(WorkerOutcome),
    /// A frame read by the input pump while a command is in flight.
    Request(ParsedRequest),
    /// A frame that failed envelope validation on the pump.
    BadRequest {
        id: Option<Value>,
        error: CommandError,
    },
    /// The extension closed its end of the pipe.
    InputClosed,
    /// The input stream violated the wire format; the session must end
    /// with exit code 2.
    InputFailed,
}

/// Final message of a run-worker.
pub enum WorkerOutcome {
    CardsFound(Vec<CardInfo>),
    CertificatesRead(Vec<CardCertificate>),
    HandlerFinished(Map<String, Value>),
    Failed(HandlerError),
}

/// Observable controller state, mirroring the command lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    WaitingForReader,
    WaitingForCard,
    ReadingCertificate,
    ConfirmingWithUser,
    RunningHandler,
    Exited,
}

/// Where the controller writes response frames.
pub trait ResponseSink {
    fn write(&mut self, response: &Value) -> Result<(), FramingError>;
}

impl<W: Write> ResponseSink for FrameWriter<W> {
    fn write(&mut self, response: &Value) -> Result<(), FramingError> {
        self.write_response(response)
    }
}

pub struct Controller {
    config: Config,
    service: Arc<dyn CardService>,
    ui: Ui,
    mailbox_tx: SyncSender<ControllerEvent>,
    mailbox_rx: Receiver<ControllerEvent>,
    state: ControllerState,
    worker: Option<WorkerHandle>,
    input_failed: bool,
}

impl Controller {
    pub fn new(config: Config, service: Arc<dyn CardService>, mut ui: Ui) -> Self {
        let (mailbox_tx, mailbox_rx) = std::sync::mpsc::sync_channel(MAILBOX_CAPACITY);
        let intent_tx = mailbox_tx.clone();
        ui.attach(Arc::new(move |intent| {
            let _ = intent_tx.send(ControllerEvent::Intent(intent));
        }));
        Self {
            config,
            service,
            ui,
            mailbox_tx,
            mailbox_rx,
            state: ControllerState::Idle,
            worker: None,
            input_failed: false,
        }
    }

    /// Whether the input stream violated the wire format mid-session.
    /// The process must then exit with code 2.
    pub fn input_failed(&self) -> bool {
        self.input_failed
    }

    /// Sender for the input pump and other out-of-thread event sources.
    pub fn event_sender(&self) -> SyncSender<ControllerEvent> {
        self.mailbox_tx.clone()
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Execute one card command to completion, writing exactly one
    /// response for it (and one per additional request observed while it
    /// ran). Returns only once the session should end.
    pub fn execute(
        &mut self,
        request: ParsedRequest,
        sink: &mut dyn ResponseSink,
    ) -> Result<(), FramingError> {
        let ParsedRequest { id, lang, command } = request;
        self.ui.set_lang(lang.as_deref());
        let command = Arc::new(command);

        let mut quit_ack: Option<Option<Value>> = None;
        let result = self.run_command(&command, sink, &mut quit_ack);

        if let Some(worker) = self.worker.take() {
            worker.cancel();
            worker.join();
        }
        self.state = ControllerState::Exited;
        self.ui.close();

        match result {
            Ok(payload) => sink.write(&success_response(id.as_ref(), payload))?,
            Err(error) => {
                info!(command = command.name(), code = error.code(), "command failed: {error}");
                sink.write(&error_response(id.as_ref(), error.code(), &error.to_string()))?;
            }
        }
        if let Some(quit_id) = quit_ack {
            sink.write(&success_response(quit_id.as_ref(), Map::new()))?;
        }
        Ok(())
    }

    fn run_command(
        &mut self,
        command: &Arc<Command>,
        sink: &mut dyn ResponseSink,
        quit_ack: &mut Option<Option<Value>>,
    ) -> Result<Map<String, Value>, CommandError> {
        let handler = command
            .handler()
            .ok_or_else(|| CommandError::programming("command has no card handler"))?;
        handler.validate(&self.config)?;

        // Validation passed, so the origin parses; show its serialized form.
        let display_origin = Origin::parse(
            handler.origin(),
            &self.config.allowed_insecure_origins,
        )
        .map(|origin| origin.as_str().to_owned())
        .unwrap_or_else(|_| handler.origin().to_owned());

        let monitor = worker::spawn_monitor(self.service.clone(), self.mailbox_tx.clone())
            .map_err(|e| CommandError::programming(format!("failed to start monitor: {e}")))?;

        let result = self.drive(handler, command, &display_origin, sink, quit_ack);

        monitor.cancel();
        monitor.join();
        result
    }

    /// The mailbox loop: owns all state transitions for one command.
    fn drive(
        &mut self,
        handler: &dyn CommandHandler,
        command: &Arc<Command>,
        display_origin: &str,
        sink: &mut dyn ResponseSink,
        quit_ack: &mut Option<Option<Value>>,
    ) -> Result<Map<String, Value>, CommandError> {
        let purpose = handler.purpose();
        let mut certificates: Vec<CardCertificate> = Vec::new();
        let mut chosen = 0usize;
        let mut user_cancelled = false;
        // Card removal while the handler ran: re-enter the wait instead of
        // failing once the cancelled worker reports back.
        let mut rewait = false;

        self.start_wait_worker()?;
        self.state = ControllerState::WaitingForReader;
        self.ui.show_waiting_for_reader();

        loop {
            let event = self
                .mailbox_rx
                .recv()
                .map_err(|_| CommandError::programming("controller mailbox closed"))?;

            match event {
                ControllerEvent::Card(card_event) => {
                    self.on_card_event(card_event, &mut certificates, &mut rewait)?;
                }

                ControllerEvent::Intent(UserIntent::Confirmed { card_index, pin }) => {
                    if self.state != ControllerState::ConfirmingWithUser {
                        debug!("ignoring stale confirmation");
                        continue;
                    }
                    let Some(certificate) = certificates.get(card_index).cloned() else {
                        return Err(CommandError::programming("confirmed card index out of range"));
                    };
                    chosen = card_index;
                    self.start_run_worker(command.clone(), certificate, pin)?;
                    self.state = ControllerState::RunningHandler;
                    self.ui.show_operation_in_progress();
                }

                ControllerEvent::Intent(UserIntent::Retry) => {
                    if self.state != ControllerState::ConfirmingWithUser {
                        debug!("ignoring stale retry");
                        continue;
                    }
                    if certificates.is_empty() {
                        self.start_wait_worker()?;
                        self.state = ControllerState::WaitingForReader;
                        self.ui.show_waiting_for_card();
                    } else {
                        self.request_confirmation(handler, display_origin, &certificates, None);
                    }
                }

                ControllerEvent::Intent(UserIntent::Cancelled) => {
                    user_cancelled = true;
                    match &self.worker {
                        Some(worker) => worker.cancel(),
                        None => return Err(CommandError::UserCancelled),
                    }
                }

                ControllerEvent::WorkerDone(outcome) => {
                    if let Some(worker) = self.worker.take() {
                        worker.join();
                    }
                    let aborting = user_cancelled || quit_ack.is_some();
                    match outcome {
                        WorkerOutcome::HandlerFinished(payload) => return Ok(payload),
                        _ if aborting => return Err(CommandError::UserCancelled),
                        WorkerOutcome::CardsFound(cards) => {
                            self.start_certificate_worker(cards, purpose)?;
                            self.state = ControllerState::ReadingCertificate;
                            self.ui.show_reading_certificate();
                        }
                        WorkerOutcome::CertificatesRead(read) => {
                            certificates = read;
                            chosen = 0;
                            self.state = ControllerState::ConfirmingWithUser;
                            self.request_confirmation(handler, display_origin, &certificates, None);
                        }
                        WorkerOutcome::Failed(HandlerError::Command(error)) => return Err(error),
                        WorkerOutcome::Failed(HandlerError::Card(error)) => {
                            // A wait worker reports NoReader/NoCard only on
                            // timeout, which is terminal.
                            let waiting = matches!(
                                self.state,
                                ControllerState::WaitingForReader | ControllerState::WaitingForCard
                            );
                            if waiting
                                && matches!(error, CardError::NoReader | CardError::NoCard)
                            {
                                return Err(error.into_terminal());
                            }
                            if rewait
                                && matches!(error, CardError::Cancelled | CardError::CardRemoved)
                            {
                                rewait = false;
                                certificates.clear();
                                self.start_wait_worker()?;
                                self.state = ControllerState::WaitingForCard;
                                self.ui.show_waiting_for_card();
                            } else {
                                self.on_card_failure(
                                    error,
                                    handler,
                                    display_origin,
                                    &mut certificates,
                                    chosen,
                                )?;
                            }
                        }
                    }
                }

                ControllerEvent::Request(parsed) => match parsed.command {
                    Command::Quit => {
                        *quit_ack = Some(parsed.id);
                        match &self.worker {
                            Some(worker) => worker.cancel(),
                            None => return Err(CommandError::UserCancelled),
                        }
                    }
                    Command::Status => {
                        // Answerable without touching the card flow.
                        let _ = sink.write(&success_response(
                            parsed.id.as_ref(),
                            app::status_payload(),
                        ));
                    }
                    ref other => {
                        warn!(command = other.name(), "rejecting command during another command");
                        let _ = sink.write(&error_response(
                            parsed.id.as_ref(),
                            "ERR_WEBEID_NATIVE_FATAL",
                            "another command is already in progress",
                        ));
                    }
                },

                ControllerEvent::BadRequest { id, error } => {
                    let _ = sink.write(&error_response(
                        id.as_ref(),
                        error.code(),
                        &error.to_string(),
                    ));
                }

                ControllerEvent::InputClosed => {
                    debug!("input stream closed mid-command");
                    user_cancelled = true;
                    match &self.worker {
                        Some(worker) => worker.cancel(),
                        None => return Err(CommandError::UserCancelled),
                    }
                }

                ControllerEvent::InputFailed => {
                    warn!("wire format violation mid-command");
                    self.input_failed = true;
                    user_cancelled = true;
                    match &self.worker {
                        Some(worker) => worker.cancel(),
                        None => return Err(CommandError::UserCancelled),
                    }
                }
            }
        }
    }

    fn on_card_event(
        &mut self,
        event: CardEvent,
        certificates: &mut Vec<CardCertificate>,
        rewait: &mut bool,
    ) -> Result<(), CommandError> {
        match event {
            CardEvent::ReaderAppeared { reader } => {
                debug!(%reader, "reader appeared");
                if self.state == ControllerState::WaitingForReader {
                    self.state = ControllerState::WaitingForCard;
                    self.ui.show_waiting_for_card();
                }
            }
            CardEvent::CardInserted { reader } => {
                debug!(%reader, "card inserted");
            }
            CardEvent::CardRemoved { reader } => {
                debug!(%reader, "card removed");
                match self.state {
                    ControllerState::RunningHandler | ControllerState::ReadingCertificate => {
                        if let Some(worker) = &self.worker {
                            worker.cancel();
                            *rewait = true;
                        }
                    }
                    ControllerState::ConfirmingWithUser
                        if certificates.iter().any(|c| c.card.reader_name == reader) =>
                    {
                        certificates.clear();
                        self.start_wait_worker()?;
                        self.state = ControllerState::WaitingForCard;
                        self.ui.show_waiting_for_card();
                    }
                    // While waiting, removal just means keep waiting.
                    _ => {}
                }
            }
            CardEvent::ReaderSetChanged => {
                debug!("reader set changed");
            }
        }
        Ok(())
    }

    /// Translate a worker's card failure into a retry round or a terminal
    /// error.
    fn on_card_failure(
        &mut self,
        error: CardError,
        handler: &dyn CommandHandler,
        display_origin: &str,
        certificates: &mut [CardCertificate],
        chosen: usize,
    ) -> Result<(), CommandError> {
        match error.retry_reason() {
            Some(reason) => {
                if let RetryReason::WrongPin { retries_left } = reason {
                    if let Some(certificate) = certificates.get_mut(chosen) {
                        certificate.pin.retries_left = retries_left;
                    }
                }
                self.state = ControllerState::ConfirmingWithUser;
                if certificates.is_empty() {
                    self.ui.request_retry(reason);
                } else {
                    self.request_confirmation(handler, display_origin, certificates, Some(reason));
                }
                Ok(())
            }
            None => Err(error.into_terminal()),
        }
    }

    fn request_confirmation(
        &mut self,
        handler: &dyn CommandHandler,
        display_origin: &str,
        certificates: &[CardCertificate],
        retry: Option<RetryReason>,
    ) {
        let candidates = certificates
            .iter()
            .map(|certificate| CandidateCard {
                reader: certificate.card.reader_name.clone(),
                holder: certificate.subject.display_name(),
                pin: certificate.pin,
            })
            .collect();
        self.ui.request_confirmation(ConfirmationRequest {
            origin: display_origin.to_owned(),
            purpose: handler.purpose(),
            candidates,
            collect_pin: handler.needs_pin(),
            retry,
        });
    }

    /// Starting a worker while one runs is a programming error.
    fn start_worker<F>(&mut self, name: &str, job: F) -> Result<(), CommandError>
    where
        F: FnOnce(&CancelFlag, &mut dyn FnMut(CardEvent)) -> WorkerOutcome + Send + 'static,
    {
        if self.worker.is_some() {
            return Err(CommandError::programming(format!(
                "attempted to start '{name}' while another worker is active"
            )));
        }
        let handle = worker::spawn_run_worker(name, self.mailbox_tx.clone(), job)
            .map_err(|e| CommandError::programming(format!("failed to start '{name}': {e}")))?;
        self.worker = Some(handle);
        Ok(())
    }

    fn start_wait_worker(&mut self) -> Result<(), CommandError> {
        let service = self.service.clone();
        let reader_timeout = self.config.reader_timeout;
        let card_timeout = self.config.card_timeout;
        self.start_worker("wait-for-card", move |cancel, events| {
            match service.wait_for_card(reader_timeout, card_timeout, cancel, events) {
                Ok(cards) => WorkerOutcome::CardsFound(cards),
                Err(error) => WorkerOutcome::Failed(error.into()),
            }
        })
    }

    fn start_certificate_worker(
        &mut self,
        cards: Vec<CardInfo>,
        purpose: CertificatePurpose,
    ) -> Result<(), CommandError> {
        let service = self.service.clone();
        self.start_worker("read-certificate", move |cancel, _events| {
            let mut certificates = Vec::new();
            let mut first_error: Option<CardError> = None;
            for card in cards {
                if cancel.is_cancelled() {
                    return WorkerOutcome::Failed(CardError::Cancelled.into());
                }
                match service.read_certificate(&card, purpose) {
                    Ok(certificate) => certificates.push(certificate),
                    Err(error) => {
                        warn!(reader = %card.reader_name, error = %error, "certificate read failed");
                        first_error.get_or_insert(error);
                    }
                }
            }
            if certificates.is_empty() {
                WorkerOutcome::Failed(first_error.unwrap_or(CardError::NoCard).into())
            } else {
                WorkerOutcome::CertificatesRead(certificates)
            }
        })
    }

    fn start_run_worker(
        &mut self,
        command: Arc<Command>,
        certificate: CardCertificate,
        pin: Option<PinBuffer>,
    ) -> Result<(), CommandError> {
        let service = self.service.clone();
        let config = self.config.clone();
        self.start_worker("run-handler", move |cancel, _events| {
            let Some(handler) = command.handler() else {
                return WorkerOutcome::Failed(
                    CommandError::programming("command has no card handler").into(),
                );
            };
            match handler.run(&config, service.as_ref(), &certificate, pin, cancel) {
                Ok(payload) => WorkerOutcome::HandlerFinished(payload),
                Err(error) => WorkerOutcome::Failed(error),
            }
        })
    }
}
