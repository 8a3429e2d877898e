//! Terminal-prompt UI backend for development on Unix.
//!
//! Dialogs become prompts on `/dev/tty`, which stays usable while stdin
//! and stdout carry the native-messaging stream. PIN entry disables
//! terminal echo. Prompts run on their own thread so presentation calls
//! never block the controller.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::io::AsRawFd;
use std::thread;

use tracing::warn;
use zeroize::Zeroize;

use crate::card::CertificatePurpose;
use crate::error::RetryReason;
use crate::pin::PinBuffer;

use super::{ConfirmationRequest, IntentSink, UiBackend, UserIntent};

pub struct TtyBackend {
    intents: Option<IntentSink>,
}

impl TtyBackend {
    /// Fails when the process has no controlling terminal.
    pub fn new() -> io::Result<Self> {
        open_tty()?;
        Ok(Self { intents: None })
    }

    fn write_line(&self, message: &str) {
        if let Ok(mut tty) = open_tty() {
            let _ = writeln!(tty, "[web-eid] {message}");
        }
    }
}

fn open_tty() -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open("/dev/tty")
}

fn read_line(tty: &File) -> io::Result<String> {
    let mut line = String::new();
    BufReader::new(tty.try_clone()?).read_line(&mut line)?;
    Ok(line.trim().to_owned())
}

/// Run `f` with terminal echo disabled, restoring the original settings
/// afterwards.
fn with_echo_disabled<T>(tty: &File, f: impl FnOnce() -> T) -> io::Result<T> {
    let fd = tty.as_raw_fd();
    let mut termios = std::mem::MaybeUninit::<libc::termios>::uninit();
    if unsafe { libc::tcgetattr(fd, termios.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let original = unsafe { termios.assume_init() };
    let mut silenced = original;
    silenced.c_lflag &= !libc::ECHO;
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &silenced) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let out = f();
    unsafe { libc::tcsetattr(fd, libc::TCSANOW, &original) };
    Ok(out)
}

fn prompt_pin(tty: &File) -> io::Result<Option<PinBuffer>> {
    let mut raw = with_echo_disabled(tty, || read_line(tty))??;
    let mut tty_out = tty.try_clone()?;
    let _ = writeln!(tty_out);
    let mut buffer = PinBuffer::new();
    for byte in raw.bytes() {
        if buffer.push(byte).is_err() {
            raw.zeroize();
            return Ok(None);
        }
    }
    raw.zeroize();
    Ok(Some(buffer))
}

fn run_confirmation(request: ConfirmationRequest, intents: IntentSink) {
    let intent = confirmation_dialog(&request).unwrap_or_else(|e| {
        warn!(error = %e, "tty prompt failed");
        UserIntent::Cancelled
    });
    intents(intent);
}

fn confirmation_dialog(request: &ConfirmationRequest) -> io::Result<UserIntent> {
    let tty = open_tty()?;
    let mut out = tty.try_clone()?;

    let action = match request.purpose {
        CertificatePurpose::Authentication => "Authenticate to",
        CertificatePurpose::Signing if request.collect_pin => "Sign a document for",
        CertificatePurpose::Signing => "Share your signing certificate with",
    };
    writeln!(out, "[web-eid] {action} {}?", request.origin)?;
    if let Some(reason) = request.retry {
        writeln!(out, "[web-eid] previous attempt failed: {reason}")?;
    }
    for (index, card) in request.candidates.iter().enumerate() {
        writeln!(out, "  {}: {} ({})", index + 1, card.holder, card.reader)?;
    }

    let card_index = if request.candidates.len() > 1 {
        write!(out, "Select card [1-{}]: ", request.candidates.len())?;
        out.flush()?;
        match read_line(&tty)?.parse::<usize>() {
            Ok(choice) if (1..=request.candidates.len()).contains(&choice) => choice - 1,
            _ => return Ok(UserIntent::Cancelled),
        }
    } else {
        0
    };

    write!(out, "Allow? [y/N] ")?;
    out.flush()?;
    if !read_line(&tty)?.eq_ignore_ascii_case("y") {
        return Ok(UserIntent::Cancelled);
    }

    let info = &request.candidates[card_index].pin;
    let pin = if request.collect_pin && !info.pad_reader {
        write!(out, "PIN ({}-{} digits): ", info.min_length, info.max_length)?;
        out.flush()?;
        match prompt_pin(&tty)? {
            Some(pin) => Some(pin),
            None => return Ok(UserIntent::Cancelled),
        }
    } else {
        None
    };

    Ok(UserIntent::Confirmed { card_index, pin })
}

impl UiBackend for TtyBackend {
    fn attach(&mut self, intents: IntentSink) {
        self.intents = Some(intents);
    }

    fn show_waiting(&mut self, message: &str) {
        self.write_line(message);
    }

    fn show_progress(&mut self, message: &str) {
        self.write_line(message);
    }

    fn request_confirmation(&mut self, request: ConfirmationRequest) {
        let Some(intents) = self.intents.clone() else {
            warn!("confirmation requested before a sink was attached");
            return;
        };
        thread::spawn(move || run_confirmation(request, intents));
    }

    fn request_retry(&mut self, _reason: RetryReason, message: &str) {
        let Some(intents) = self.intents.clone() else {
            warn!("retry requested before a sink was attached");
            return;
        };
        let message = message.to_owned();
        thread::spawn(move || {
            let intent = (|| -> io::Result<UserIntent> {
                let tty = open_tty()?;
                let mut out = tty.try_clone()?;
                write!(out, "[web-eid] {message}. Retry? [y/N] ")?;
                out.flush()?;
                Ok(if read_line(&tty)?.eq_ignore_ascii_case("y") {
                    UserIntent::Retry
                } else {
                    UserIntent::Cancelled
                })
            })()
            .unwrap_or(UserIntent::Cancelled);
            intents(intent);
        });
    }

    fn close(&mut self) {
        self.intents = None;
    }
}
