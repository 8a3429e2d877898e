//! DER certificate parsing for the confirmation dialog.
//!
//! Only the subject fields shown to the user and the validity window are
//! extracted here; the certificate itself crosses the wire as opaque DER.

use std::time::SystemTime;

use x509_cert::der::asn1::ObjectIdentifier;
use x509_cert::der::{Decode, Tag, Tagged};
use x509_cert::Certificate;

use super::error::CardError;

const OID_COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
const OID_SURNAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.4");
const OID_SERIAL_NUMBER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.5");
const OID_COUNTRY: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.6");
const OID_GIVEN_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.42");

/// Subject fields of an eID certificate, as presented to the user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateSubject {
    pub common_name: Option<String>,
    pub given_name: Option<String>,
    pub surname: Option<String>,
    pub serial_number: Option<String>,
    pub country: Option<String>,
}

impl CertificateSubject {
    /// One-line holder name for dialogs: "GIVEN SURNAME", falling back to
    /// the common name.
    pub fn display_name(&self) -> String {
        match (&self.given_name, &self.surname) {
            (Some(given), Some(surname)) => format!("{given} {surname}"),
            _ => self.common_name.clone().unwrap_or_default(),
        }
    }
}

/// Parsed view over a DER certificate.
#[derive(Debug, Clone)]
pub struct ParsedCertificate {
    pub subject: CertificateSubject,
    pub not_after: Option<SystemTime>,
}

impl ParsedCertificate {
    pub fn from_der(der: &[u8]) -> Result<Self, CardError> {
        let certificate = Certificate::from_der(der)
            .map_err(|e| CardError::Communication(format!("malformed certificate: {e}")))?;

        let mut subject = CertificateSubject::default();
        for rdn in certificate.tbs_certificate.subject.0.iter() {
            for atv in rdn.0.iter() {
                let Some(text) = attribute_text(&atv.value) else {
                    continue;
                };
                if atv.oid == OID_COMMON_NAME {
                    subject.common_name = Some(text);
                } else if atv.oid == OID_GIVEN_NAME {
                    subject.given_name = Some(text);
                } else if atv.oid == OID_SURNAME {
                    subject.surname = Some(text);
                } else if atv.oid == OID_SERIAL_NUMBER {
                    subject.serial_number = Some(text);
                } else if atv.oid == OID_COUNTRY {
                    subject.country = Some(text);
                }
            }
        }

        let not_after = certificate
            .tbs_certificate
            .validity
            .not_after
            .to_system_time()
            .into();

        Ok(Self { subject, not_after })
    }

    pub fn expired_at(&self, now: SystemTime) -> bool {
        self.not_after.is_some_and(|not_after| not_after < now)
    }
}

fn attribute_text(value: &x509_cert::der::Any) -> Option<String> {
    match value.tag() {
        Tag::Utf8String | Tag::PrintableString | Tag::Ia5String => {
            std::str::from_utf8(value.value()).ok().map(str::to_owned)
        }
        _ => None,
    }
}
