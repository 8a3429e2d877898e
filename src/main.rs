use std::io;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use web_eid_helper::app::{App, EXIT_STARTUP_FAILURE, VERSION};
use web_eid_helper::card::error::CardError;
use web_eid_helper::card::pcsc::PcscCardService;
use web_eid_helper::card::{
    CancelFlag, CardCertificate, CardInfo, CardService, CertificatePurpose, EidCardDriver,
    EventSink, ReaderInfo,
};
use web_eid_helper::config::{Config, UiKind};
use web_eid_helper::framing::{FrameReader, FrameWriter};
use web_eid_helper::pin::PinBuffer;
use web_eid_helper::ui::headless::HeadlessBackend;
use web_eid_helper::ui::{Ui, UiBackend};

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("WEB_EID_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let browser = match parse_args(std::env::args().skip(1)) {
        Ok(browser) => browser,
        Err(argument) => {
            eprintln!("unrecognised argument '{argument}'");
            eprintln!("usage: web-eid-helper [browser]");
            return EXIT_STARTUP_FAILURE;
        }
    };

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error:#}");
            return EXIT_STARTUP_FAILURE;
        }
    };

    info!(
        version = VERSION,
        browser = browser.as_deref().unwrap_or("unknown"),
        "starting"
    );

    // A missing smart card service is not a startup failure: the helper
    // still answers status and reports the condition per command.
    let service: Arc<dyn CardService> = match PcscCardService::new(eid_drivers()) {
        Ok(service) => Arc::new(service),
        Err(error) => {
            warn!(error = %error, "PC/SC context unavailable");
            Arc::new(UnavailableCardService(error.to_string()))
        }
    };

    let ui = match Ui::new(ui_backend(&config)) {
        Ok(ui) => ui,
        Err(error) => {
            eprintln!("failed to initialise the UI: {error}");
            return EXIT_STARTUP_FAILURE;
        }
    };

    App::new(config, service, ui).run(
        FrameReader::new(io::stdin()),
        FrameWriter::new(io::stdout()),
    )
}

/// Accept at most one positional argument naming the invoking browser.
fn parse_args(args: impl Iterator<Item = String>) -> Result<Option<String>, String> {
    let mut browser = None;
    for argument in args {
        if argument.starts_with('-') || browser.is_some() {
            return Err(argument);
        }
        browser = Some(argument);
    }
    Ok(browser)
}

/// Vendor card drivers are registered here.
fn eid_drivers() -> Vec<Box<dyn EidCardDriver>> {
    Vec::new()
}

fn ui_backend(config: &Config) -> Box<dyn UiBackend> {
    if config.ui == UiKind::Tty {
        #[cfg(unix)]
        match web_eid_helper::ui::tty::TtyBackend::new() {
            Ok(backend) => return Box::new(backend),
            Err(error) => warn!(error = %error, "no controlling terminal, using headless UI"),
        }
        #[cfg(not(unix))]
        warn!("terminal UI is not available on this platform, using headless UI");
    }
    Box::new(HeadlessBackend::default())
}

/// Stand-in card service when the PC/SC context cannot be established.
struct UnavailableCardService(String);

impl CardService for UnavailableCardService {
    fn list_readers(&self) -> Result<Vec<ReaderInfo>, CardError> {
        Err(CardError::ServiceUnavailable(self.0.clone()))
    }

    fn wait_for_card(
        &self,
        _reader_timeout: std::time::Duration,
        _card_timeout: std::time::Duration,
        _cancel: &CancelFlag,
        _events: EventSink<'_>,
    ) -> Result<Vec<CardInfo>, CardError> {
        Err(CardError::ServiceUnavailable(self.0.clone()))
    }

    fn read_certificate(
        &self,
        _card: &CardInfo,
        _purpose: CertificatePurpose,
    ) -> Result<CardCertificate, CardError> {
        Err(CardError::ServiceUnavailable(self.0.clone()))
    }

    fn sign(
        &self,
        _card: &CardInfo,
        _purpose: CertificatePurpose,
        _pin: Option<PinBuffer>,
        _digest: &[u8],
        _cancel: &CancelFlag,
    ) -> Result<Vec<u8>, CardError> {
        Err(CardError::ServiceUnavailable(self.0.clone()))
    }

    fn monitor(&self, _cancel: &CancelFlag, _events: EventSink<'_>) -> Result<(), CardError> {
        Err(CardError::ServiceUnavailable(self.0.clone()))
    }
}
