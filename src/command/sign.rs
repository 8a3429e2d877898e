//! The `sign` command.
//!
//! The caller supplies a ready-made document digest; the handler never
//! re-hashes. The digest length must match the declared hash function
//! before any card I/O happens.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::card::algorithm::{HashFunction, SignatureAlgorithm};
use crate::card::{CancelFlag, CardCertificate, CardService, CertificatePurpose};
use crate::config::Config;
use crate::error::CommandError;
use crate::pin::PinBuffer;

use super::{CommandHandler, HandlerError, Origin};

#[derive(Debug)]
pub struct SignCommand {
    pub origin: String,
    pub hash: String,
    pub hash_function: String,
}

/// The response payload of a successful `sign`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureResult {
    pub signature: String,
    pub signature_algorithm: SignatureAlgorithm,
}

impl SignCommand {
    /// Decode and length-check the document hash against the declared
    /// function.
    fn document_hash(&self) -> Result<(HashFunction, Vec<u8>), CommandError> {
        let hash_function = HashFunction::from_name(&self.hash_function).ok_or_else(|| {
            CommandError::invalid_argument(format!(
                "unsupported hash function '{}'",
                self.hash_function
            ))
        })?;
        let digest = BASE64
            .decode(&self.hash)
            .map_err(|e| CommandError::invalid_argument(format!("'hash' is not valid base64: {e}")))?;
        if digest.len() != hash_function.digest_len() {
            return Err(CommandError::invalid_argument(format!(
                "'hash' is {} bytes but {} digests are {} bytes",
                digest.len(),
                hash_function.name(),
                hash_function.digest_len()
            )));
        }
        Ok((hash_function, digest))
    }
}

impl CommandHandler for SignCommand {
    fn validate(&self, config: &Config) -> Result<(), CommandError> {
        Origin::parse(&self.origin, &config.allowed_insecure_origins)?;
        self.document_hash()?;
        Ok(())
    }

    fn purpose(&self) -> CertificatePurpose {
        CertificatePurpose::Signing
    }

    fn origin(&self) -> &str {
        &self.origin
    }

    fn run(
        &self,
        _config: &Config,
        service: &dyn CardService,
        certificate: &CardCertificate,
        pin: Option<PinBuffer>,
        cancel: &CancelFlag,
    ) -> Result<Map<String, Value>, HandlerError> {
        let (hash_function, digest) = self.document_hash()?;
        let algorithm = certificate
            .card
            .algorithms
            .signing
            .iter()
            .find(|a| a.hash_function == hash_function)
            .copied()
            .ok_or_else(|| {
                CommandError::invalid_argument(format!(
                    "the card does not support signing {} digests",
                    hash_function.name()
                ))
            })?;

        let signature = service.sign(
            &certificate.card,
            CertificatePurpose::Signing,
            pin,
            &digest,
            cancel,
        )?;

        let result = SignatureResult {
            signature: BASE64.encode(signature),
            signature_algorithm: algorithm,
        };
        let Value::Object(payload) = serde_json::to_value(result)
            .map_err(|e| CommandError::programming(format!("result serialization: {e}")))?
        else {
            return Err(CommandError::programming("result must serialize to an object").into());
        };
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn command(hash: &str, function: &str) -> SignCommand {
        SignCommand {
            origin: "https://sign.example.org".into(),
            hash: hash.into(),
            hash_function: function.into(),
        }
    }

    #[test]
    fn accepts_matching_digest_length() {
        let digest = BASE64.encode([0u8; 48]);
        command(&digest, "SHA-384").validate(&Config::default()).unwrap();
    }

    #[rstest]
    #[case(32, "SHA-384")]
    #[case(48, "SHA-256")]
    #[case(64, "SHA-384")]
    fn rejects_digest_length_mismatch(#[case] len: usize, #[case] function: &str) {
        let digest = BASE64.encode(vec![0u8; len]);
        let err = command(&digest, function)
            .validate(&Config::default())
            .unwrap_err();
        assert_eq!(err.code(), "ERR_WEBEID_NATIVE_INVALID_ARGUMENT");
    }

    #[test]
    fn rejects_unknown_hash_function() {
        let digest = BASE64.encode([0u8; 20]);
        let err = command(&digest, "SHA-1")
            .validate(&Config::default())
            .unwrap_err();
        assert!(err.to_string().contains("unsupported hash function"));
    }

    #[test]
    fn rejects_undecodable_hash() {
        let err = command("not base64!!!", "SHA-256")
            .validate(&Config::default())
            .unwrap_err();
        assert!(err.to_string().contains("base64"));
    }
}
