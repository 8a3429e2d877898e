//! The `get-signing-certificate` command.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{Map, Value};

use crate::card::{CancelFlag, CardCertificate, CardService, CertificatePurpose};
use crate::config::Config;
use crate::error::CommandError;
use crate::pin::PinBuffer;

use super::{CommandHandler, HandlerError, Origin};

#[derive(Debug)]
pub struct GetSigningCertificateCommand {
    pub origin: String,
}

impl CommandHandler for GetSigningCertificateCommand {
    fn validate(&self, config: &Config) -> Result<(), CommandError> {
        Origin::parse(&self.origin, &config.allowed_insecure_origins)?;
        Ok(())
    }

    fn purpose(&self) -> CertificatePurpose {
        CertificatePurpose::Signing
    }

    // Certificate disclosure is confirmed by the user but needs no PIN.
    fn needs_pin(&self) -> bool {
        false
    }

    fn origin(&self) -> &str {
        &self.origin
    }

    fn run(
        &self,
        _config: &Config,
        _service: &dyn CardService,
        certificate: &CardCertificate,
        _pin: Option<PinBuffer>,
        _cancel: &CancelFlag,
    ) -> Result<Map<String, Value>, HandlerError> {
        let algorithms = serde_json::to_value(&certificate.card.algorithms.signing)
            .map_err(|e| CommandError::programming(format!("algorithm serialization: {e}")))?;

        let mut payload = Map::new();
        payload.insert(
            "certificate".into(),
            Value::String(BASE64.encode(&certificate.der)),
        );
        payload.insert("supportedSignatureAlgorithms".into(), algorithms);
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_origin_scheme() {
        let command = GetSigningCertificateCommand {
            origin: "ftp://example.org".into(),
        };
        let err = command.validate(&Config::default()).unwrap_err();
        assert_eq!(err.code(), "ERR_WEBEID_NATIVE_INVALID_ARGUMENT");
    }

    #[test]
    fn discloses_certificate_without_pin() {
        let command = GetSigningCertificateCommand {
            origin: "https://example.org".into(),
        };
        assert!(!command.needs_pin());
        assert_eq!(command.purpose(), CertificatePurpose::Signing);
    }
}
