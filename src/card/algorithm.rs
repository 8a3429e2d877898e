//! Signature and digest algorithm descriptors.

use serde::Serialize;
use sha2::{Digest, Sha256, Sha384, Sha512};

/// Digest function recognised on the wire and on supported cards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HashFunction {
    #[serde(rename = "SHA-256")]
    Sha256,
    #[serde(rename = "SHA-384")]
    Sha384,
    #[serde(rename = "SHA-512")]
    Sha512,
}

impl HashFunction {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "SHA-256" => Some(Self::Sha256),
            "SHA-384" => Some(Self::Sha384),
            "SHA-512" => Some(Self::Sha512),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Sha256 => "SHA-256",
            Self::Sha384 => "SHA-384",
            Self::Sha512 => "SHA-512",
        }
    }

    /// Expected digest length in bytes.
    pub fn digest_len(self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

/// JWS algorithm name declared by the card for its authentication key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JwsAlgorithm {
    Rs256,
    Ps256,
    Es256,
    Es384,
    Es512,
}

impl JwsAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            Self::Rs256 => "RS256",
            Self::Ps256 => "PS256",
            Self::Es256 => "ES256",
            Self::Es384 => "ES384",
            Self::Es512 => "ES512",
        }
    }

    /// The digest the authentication signature covers.
    pub fn hash_function(self) -> HashFunction {
        match self {
            Self::Rs256 | Self::Ps256 | Self::Es256 => HashFunction::Sha256,
            Self::Es384 => HashFunction::Sha384,
            Self::Es512 => HashFunction::Sha512,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CryptoAlgorithm {
    #[serde(rename = "RSA")]
    Rsa,
    #[serde(rename = "ECC")]
    Ecc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PaddingScheme {
    #[serde(rename = "NONE")]
    None,
    #[serde(rename = "PKCS1.5")]
    Pkcs15,
    #[serde(rename = "PS")]
    Pss,
}

/// Signing-key capability descriptor, as reported to the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureAlgorithm {
    pub crypto_algorithm: CryptoAlgorithm,
    pub padding_scheme: PaddingScheme,
    pub hash_function: HashFunction,
}

impl SignatureAlgorithm {
    pub fn new(
        crypto_algorithm: CryptoAlgorithm,
        padding_scheme: PaddingScheme,
        hash_function: HashFunction,
    ) -> Self {
        Self {
            crypto_algorithm,
            padding_scheme,
            hash_function,
        }
    }
}
