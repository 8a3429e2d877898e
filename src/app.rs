//! Application lifetime object and session driver.
//!
//! One process serves one native-messaging session: `status` requests are
//! answered inline, the first card command runs through the controller,
//! and the session ends after its response (or on `quit`/EOF). While a
//! card command is in flight, a pump thread keeps reading frames so `quit`
//! can interrupt the operation.

use std::io::{Read, Write};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::thread;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::card::CardService;
use crate::command::{self, Command};
use crate::config::Config;
use crate::controller::{Controller, ControllerEvent};
use crate::framing::{error_response, success_response, FrameReader, FrameWriter, FramingError};
use crate::ui::Ui;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const EXIT_OK: i32 = 0;
pub const EXIT_STARTUP_FAILURE: i32 = 1;
pub const EXIT_FRAMING_FAILURE: i32 = 2;

/// The application version reported in authentication tokens.
pub fn version_string() -> String {
    VERSION.to_owned()
}

/// Payload of the `status` response.
pub fn status_payload() -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("version".into(), Value::String(VERSION.into()));
    payload.insert(
        "nativeApp".into(),
        Value::String(format!("web-eid-helper/{VERSION}")),
    );
    payload
}

/// Main-level lifetime object owning the controller (and through it the UI
/// and the card facade lease).
pub struct App {
    controller: Controller,
}

impl App {
    pub fn new(config: Config, service: Arc<dyn CardService>, ui: Ui) -> Self {
        Self {
            controller: Controller::new(config, service, ui),
        }
    }

    /// Serve the session; returns the process exit code.
    pub fn run<R, W>(mut self, mut reader: FrameReader<R>, mut writer: FrameWriter<W>) -> i32
    where
        R: Read + Send + 'static,
        W: Write,
    {
        loop {
            let envelope = match reader.read_request() {
                Ok(Some(envelope)) => envelope,
                Ok(None) => {
                    debug!("input closed before any card command");
                    return EXIT_OK;
                }
                Err(error) => return framing_failure(&mut writer, &error),
            };

            let parsed = match command::parse(&envelope) {
                Ok(parsed) => parsed,
                Err(error) => {
                    let id = envelope.get("id").cloned();
                    let response = error_response(id.as_ref(), error.code(), &error.to_string());
                    if writer.write_response(&response).is_err() {
                        return EXIT_FRAMING_FAILURE;
                    }
                    continue;
                }
            };

            match parsed.command {
                Command::Status => {
                    let response = success_response(parsed.id.as_ref(), status_payload());
                    if writer.write_response(&response).is_err() {
                        return EXIT_FRAMING_FAILURE;
                    }
                }
                Command::Quit => {
                    let _ = writer
                        .write_response(&success_response(parsed.id.as_ref(), Map::new()));
                    return EXIT_OK;
                }
                Command::Authenticate(_) | Command::GetSigningCertificate(_) | Command::Sign(_) => {
                    let events = self.controller.event_sender();
                    thread::spawn(move || pump_input(reader, events));

                    return match self.controller.execute(parsed, &mut writer) {
                        Ok(()) if self.controller.input_failed() => EXIT_FRAMING_FAILURE,
                        Ok(()) => EXIT_OK,
                        Err(error) => {
                            warn!(error = %error, "failed to write response");
                            EXIT_FRAMING_FAILURE
                        }
                    };
                }
            }
        }
    }
}

/// Read frames for the rest of the session so `quit` (and EOF) can
/// interrupt the in-flight command. Runs on its own thread; every observed
/// frame becomes a controller event.
fn pump_input<R: Read>(mut reader: FrameReader<R>, events: SyncSender<ControllerEvent>) {
    loop {
        match reader.read_request() {
            Ok(Some(envelope)) => {
                let event = match command::parse(&envelope) {
                    Ok(parsed) => ControllerEvent::Request(parsed),
                    Err(error) => ControllerEvent::BadRequest {
                        id: envelope.get("id").cloned(),
                        error,
                    },
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            Ok(None) => {
                let _ = events.send(ControllerEvent::InputClosed);
                break;
            }
            Err(error) => {
                warn!(error = %error, "wire format violation on input");
                let _ = events.send(ControllerEvent::InputFailed);
                break;
            }
        }
    }
}

fn framing_failure<W: Write>(writer: &mut FrameWriter<W>, error: &FramingError) -> i32 {
    warn!(error = %error, "request framing failed");
    let response = error_response(None, "ERR_WEBEID_NATIVE_FATAL", &error.to_string());
    let _ = writer.write_response(&response);
    EXIT_FRAMING_FAILURE
}
