//! Request envelope validation and command dispatch.
//!
//! The parser checks envelope shape and argument *types* only; semantic
//! validation (nonce length, URL scheme, digest length) belongs to the
//! handlers so that those failures surface as invalid-argument command
//! errors after parsing has succeeded.

pub mod authenticate;
pub mod get_certificate;
pub mod sign;

use serde_json::{Map, Value};
use url::Url;

use crate::card::error::CardError;
use crate::card::{CancelFlag, CardCertificate, CardService, CertificatePurpose};
use crate::config::Config;
use crate::error::CommandError;
use crate::pin::PinBuffer;

pub use authenticate::AuthenticateCommand;
pub use get_certificate::GetSigningCertificateCommand;
pub use sign::SignCommand;

/// A validated request envelope.
#[derive(Debug)]
pub struct ParsedRequest {
    /// Opaque correlation token, echoed verbatim in the response.
    pub id: Option<Value>,
    pub lang: Option<String>,
    pub command: Command,
}

/// The recognised command set.
#[derive(Debug)]
pub enum Command {
    Status,
    Quit,
    Authenticate(AuthenticateCommand),
    GetSigningCertificate(GetSigningCertificateCommand),
    Sign(SignCommand),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Quit => "quit",
            Self::Authenticate(_) => "authenticate",
            Self::GetSigningCertificate(_) => "get-signing-certificate",
            Self::Sign(_) => "sign",
        }
    }

    /// The card-operation handler, for commands that have one.
    pub fn handler(&self) -> Option<&dyn CommandHandler> {
        match self {
            Self::Authenticate(cmd) => Some(cmd),
            Self::GetSigningCertificate(cmd) => Some(cmd),
            Self::Sign(cmd) => Some(cmd),
            Self::Status | Self::Quit => None,
        }
    }
}

/// Failure of a running handler: either a card-level condition the
/// controller may retry, or a terminal command error.
#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    #[error(transparent)]
    Card(#[from] CardError),
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Capability of one command over the fixed lifecycle the controller
/// drives: semantic validation, certificate selection, PIN requirement and
/// the card operation itself.
pub trait CommandHandler: Send + Sync {
    /// Semantic argument validation. Runs before any card I/O.
    fn validate(&self, config: &Config) -> Result<(), CommandError>;

    /// Which certificate (and key) this command operates on.
    fn purpose(&self) -> CertificatePurpose;

    /// Whether the confirmation dialog must collect a PIN.
    fn needs_pin(&self) -> bool {
        true
    }

    /// The origin presented to the user for confirmation.
    fn origin(&self) -> &str;

    /// Execute the card operation and produce the response payload.
    fn run(
        &self,
        config: &Config,
        service: &dyn CardService,
        certificate: &CardCertificate,
        pin: Option<PinBuffer>,
        cancel: &CancelFlag,
    ) -> Result<Map<String, Value>, HandlerError>;
}

/// Validate the envelope and produce a typed command.
pub fn parse(envelope: &Value) -> Result<ParsedRequest, CommandError> {
    let object = envelope
        .as_object()
        .ok_or_else(|| CommandError::invalid_argument("request envelope must be a JSON object"))?;

    let id = object.get("id").cloned();
    let lang = optional_string(object, "lang")?;
    let name = required_string(object, "command")?;

    let arguments = match object.get("arguments") {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => Some(map),
        Some(_) => {
            return Err(CommandError::invalid_argument(
                "'arguments' must be a JSON object",
            ))
        }
    };

    let command = match name {
        "status" => Command::Status,
        "quit" => Command::Quit,
        "authenticate" => {
            let args = required_arguments(arguments, name)?;
            Command::Authenticate(AuthenticateCommand {
                challenge_nonce: required_string(args, "challengeNonce")?.to_owned(),
                origin: required_string(args, "origin")?.to_owned(),
            })
        }
        "get-signing-certificate" => {
            let args = required_arguments(arguments, name)?;
            Command::GetSigningCertificate(GetSigningCertificateCommand {
                origin: required_string(args, "origin")?.to_owned(),
            })
        }
        "sign" => {
            let args = required_arguments(arguments, name)?;
            Command::Sign(SignCommand {
                origin: required_string(args, "origin")?.to_owned(),
                hash: required_string(args, "hash")?.to_owned(),
                hash_function: required_string(args, "hashFunction")?.to_owned(),
            })
        }
        other => {
            return Err(CommandError::invalid_argument(format!(
                "unrecognised command '{other}'"
            )))
        }
    };

    Ok(ParsedRequest { id, lang, command })
}

fn required_arguments<'a>(
    arguments: Option<&'a Map<String, Value>>,
    command: &str,
) -> Result<&'a Map<String, Value>, CommandError> {
    arguments.ok_or_else(|| {
        CommandError::invalid_argument(format!("'{command}' requires an 'arguments' object"))
    })
}

fn required_string<'a>(object: &'a Map<String, Value>, field: &str) -> Result<&'a str, CommandError> {
    match object.get(field) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(CommandError::invalid_argument(format!(
            "'{field}' must be a string"
        ))),
        None => Err(CommandError::invalid_argument(format!(
            "missing required field '{field}'"
        ))),
    }
}

fn optional_string(object: &Map<String, Value>, field: &str) -> Result<Option<String>, CommandError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(CommandError::invalid_argument(format!(
            "'{field}' must be a string"
        ))),
    }
}

/// A validated caller origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    serialized: String,
    host: String,
}

impl Origin {
    /// Parse and validate an origin URL. Only https origins are accepted
    /// unless the serialized origin appears in `allowed_insecure`.
    pub fn parse(raw: &str, allowed_insecure: &[String]) -> Result<Self, CommandError> {
        let url = Url::parse(raw)
            .map_err(|e| CommandError::invalid_argument(format!("invalid origin URL: {e}")))?;
        let origin = url.origin();
        if !origin.is_tuple() {
            return Err(CommandError::invalid_argument(
                "origin must have a scheme, host and port",
            ));
        }
        let serialized = origin.ascii_serialization();
        if url.scheme() != "https" && !allowed_insecure.iter().any(|o| o == &serialized) {
            return Err(CommandError::invalid_argument(
                "origin must use the https scheme",
            ));
        }
        let host = url
            .host_str()
            .ok_or_else(|| CommandError::invalid_argument("origin must include a host"))?
            .to_owned();
        Ok(Self { serialized, host })
    }

    /// The serialized origin, e.g. `https://example.org`. This exact byte
    /// sequence enters the authentication digest.
    pub fn as_str(&self) -> &str {
        &self.serialized
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}
