//! Dialog strings, selected by the request envelope's `lang` tag.

use crate::error::RetryReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lang {
    #[default]
    En,
    Et,
    Fi,
}

impl Lang {
    /// Map a BCP 47-ish tag to a supported language, defaulting to English.
    pub fn from_tag(tag: Option<&str>) -> Self {
        match tag.map(|t| t.split(['-', '_']).next().unwrap_or(t)) {
            Some("et") => Self::Et,
            Some("fi") => Self::Fi,
            _ => Self::En,
        }
    }

    pub fn connect_reader(self) -> &'static str {
        match self {
            Self::En => "Connect a smart card reader",
            Self::Et => "Ühendage ID-kaardi lugeja",
            Self::Fi => "Liitä kortinlukija",
        }
    }

    pub fn insert_card(self) -> &'static str {
        match self {
            Self::En => "Insert your ID card into the reader",
            Self::Et => "Sisestage ID-kaart lugejasse",
            Self::Fi => "Aseta henkilökortti lukijaan",
        }
    }

    pub fn reading_certificate(self) -> &'static str {
        match self {
            Self::En => "Reading the certificate",
            Self::Et => "Sertifikaadi lugemine",
            Self::Fi => "Luetaan varmennetta",
        }
    }

    pub fn operation_in_progress(self) -> &'static str {
        match self {
            Self::En => "Communicating with the card, do not remove it",
            Self::Et => "Suhtlus kaardiga, ärge eemaldage kaarti",
            Self::Fi => "Kortin käsittely käynnissä, älä poista korttia",
        }
    }

    pub fn retry_message(self, reason: RetryReason) -> String {
        match (self, reason) {
            (Self::En, RetryReason::WrongPin { retries_left }) => {
                format!("Incorrect PIN, {retries_left} attempts left")
            }
            (Self::Et, RetryReason::WrongPin { retries_left }) => {
                format!("Vale PIN, jäänud on {retries_left} katset")
            }
            (Self::Fi, RetryReason::WrongPin { retries_left }) => {
                format!("Väärä PIN, {retries_left} yritystä jäljellä")
            }
            (Self::En, RetryReason::CardRemoved) => "The card was removed".into(),
            (Self::Et, RetryReason::CardRemoved) => "Kaart eemaldati".into(),
            (Self::Fi, RetryReason::CardRemoved) => "Kortti poistettiin".into(),
            (Self::En, RetryReason::UnknownCard) => {
                "The inserted card is not supported".into()
            }
            (Self::Et, RetryReason::UnknownCard) => "Sisestatud kaarti ei toetata".into(),
            (Self::Fi, RetryReason::UnknownCard) => "Korttia ei tueta".into(),
            // Remaining reasons keep the English description.
            (_, reason) => reason.to_string(),
        }
    }
}
