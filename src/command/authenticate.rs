//! The `authenticate` command.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::app;
use crate::card::algorithm::HashFunction;
use crate::card::{CancelFlag, CardCertificate, CardService, CertificatePurpose};
use crate::config::Config;
use crate::error::CommandError;
use crate::pin::PinBuffer;

use super::{CommandHandler, HandlerError, Origin};

/// Token format identifier fixed by the Web eID authentication protocol.
pub const TOKEN_FORMAT: &str = "web-eid:1.0";

pub const MIN_NONCE_LENGTH: usize = 44;
pub const MAX_NONCE_LENGTH: usize = 128;

#[derive(Debug)]
pub struct AuthenticateCommand {
    pub challenge_nonce: String,
    pub origin: String,
}

/// The response payload of a successful `authenticate`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationToken {
    pub unverified_certificate: String,
    pub algorithm: &'static str,
    pub signature: String,
    pub format: &'static str,
    pub app_version: String,
}

/// The digest the authentication signature covers.
///
/// Origin and nonce are hashed separately and concatenated at the pre-hash
/// level, so two distinct `(origin, nonce)` pairs can never produce the
/// same pre-image.
pub fn authentication_digest(hash: HashFunction, origin: &str, nonce: &str) -> Vec<u8> {
    let mut pre_image = hash.digest(origin.as_bytes());
    pre_image.extend_from_slice(&hash.digest(nonce.as_bytes()));
    hash.digest(&pre_image)
}

impl CommandHandler for AuthenticateCommand {
    fn validate(&self, config: &Config) -> Result<(), CommandError> {
        let length = self.challenge_nonce.chars().count();
        if length < MIN_NONCE_LENGTH {
            return Err(CommandError::invalid_argument(format!(
                "'challengeNonce' must be at least {MIN_NONCE_LENGTH} characters, got {length}"
            )));
        }
        if length > MAX_NONCE_LENGTH {
            return Err(CommandError::invalid_argument(format!(
                "'challengeNonce' must be at most {MAX_NONCE_LENGTH} characters, got {length}"
            )));
        }
        Origin::parse(&self.origin, &config.allowed_insecure_origins)?;
        Ok(())
    }

    fn purpose(&self) -> CertificatePurpose {
        CertificatePurpose::Authentication
    }

    fn origin(&self) -> &str {
        &self.origin
    }

    fn run(
        &self,
        config: &Config,
        service: &dyn CardService,
        certificate: &CardCertificate,
        pin: Option<PinBuffer>,
        cancel: &CancelFlag,
    ) -> Result<Map<String, Value>, HandlerError> {
        let origin = Origin::parse(&self.origin, &config.allowed_insecure_origins)?;
        let algorithm = certificate.card.algorithms.authentication;
        let digest = authentication_digest(
            algorithm.hash_function(),
            origin.as_str(),
            &self.challenge_nonce,
        );

        let signature = service.sign(
            &certificate.card,
            CertificatePurpose::Authentication,
            pin,
            &digest,
            cancel,
        )?;

        let token = AuthenticationToken {
            unverified_certificate: BASE64.encode(&certificate.der),
            algorithm: algorithm.name(),
            signature: BASE64.encode(signature),
            format: TOKEN_FORMAT,
            app_version: app::version_string(),
        };
        let Value::Object(payload) = serde_json::to_value(token)
            .map_err(|e| CommandError::programming(format!("token serialization: {e}")))?
        else {
            return Err(CommandError::programming("token must serialize to an object").into());
        };
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn command(nonce: &str, origin: &str) -> AuthenticateCommand {
        AuthenticateCommand {
            challenge_nonce: nonce.into(),
            origin: origin.into(),
        }
    }

    #[rstest]
    #[case("short")]
    #[case("")]
    fn rejects_short_nonce(#[case] nonce: &str) {
        let err = command(nonce, "https://example.org")
            .validate(&Config::default())
            .unwrap_err();
        assert_eq!(err.code(), "ERR_WEBEID_NATIVE_INVALID_ARGUMENT");
        assert!(err.to_string().contains("at least 44 characters"));
    }

    #[test]
    fn rejects_overlong_nonce() {
        let err = command(&"n".repeat(129), "https://example.org")
            .validate(&Config::default())
            .unwrap_err();
        assert!(err.to_string().contains("at most 128 characters"));
    }

    #[test]
    fn rejects_non_https_origin() {
        let err = command(&"n".repeat(44), "http://example.org")
            .validate(&Config::default())
            .unwrap_err();
        assert_eq!(err.code(), "ERR_WEBEID_NATIVE_INVALID_ARGUMENT");
    }

    #[test]
    fn accepts_valid_arguments() {
        command(&"n".repeat(44), "https://example.org")
            .validate(&Config::default())
            .unwrap();
        command(&"n".repeat(128), "https://example.org")
            .validate(&Config::default())
            .unwrap();
    }

    #[test]
    fn digest_separates_origin_and_nonce_domains() {
        let hash = HashFunction::Sha384;
        let base = authentication_digest(hash, "https://example.org", "nonce-one");
        assert_eq!(base.len(), 48);
        // Changing either input changes the digest.
        assert_ne!(
            base,
            authentication_digest(hash, "https://example.com", "nonce-one")
        );
        assert_ne!(
            base,
            authentication_digest(hash, "https://example.org", "nonce-two")
        );
        // Moving bytes across the origin/nonce boundary changes the
        // pre-image because each side is hashed before concatenation.
        assert_ne!(
            authentication_digest(hash, "https://a", "bc"),
            authentication_digest(hash, "https://ab", "c")
        );
    }
}
