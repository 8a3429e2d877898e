//! Command-level error taxonomy.
//!
//! Errors fall into two tiers: [`RetryReason`] values are user-recoverable
//! and only ever rendered by the UI with a retry affordance, while
//! [`CommandError`] values terminate the command and cross the wire as a
//! `{ code, message }` object.

use std::fmt;

/// A user-recoverable condition. The controller re-enters the confirmation
/// dialog (or the card wait) instead of failing the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    NoReader,
    NoCard,
    UnknownCard,
    CardRemoved,
    PinVerifyDisabled,
    WrongPin { retries_left: u8 },
    PinTimeout,
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoReader => write!(f, "no smart card reader attached"),
            Self::NoCard => write!(f, "no eID card in any reader"),
            Self::UnknownCard => write!(f, "the inserted card is not a supported eID card"),
            Self::CardRemoved => write!(f, "the card was removed"),
            Self::PinVerifyDisabled => write!(f, "PIN verification is disabled on the card"),
            Self::WrongPin { retries_left } => {
                write!(f, "wrong PIN, {retries_left} attempts left")
            }
            Self::PinTimeout => write!(f, "PIN entry timed out"),
        }
    }
}

/// Terminal command failure. Every variant maps to a stable wire code.
#[derive(thiserror::Error, Debug)]
pub enum CommandError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("internal error: {0}")]
    Programming(String),
    #[error("PIN is blocked")]
    PinBlocked,
    #[error("user cancelled the operation")]
    UserCancelled,
    #[error("no smart card readers attached")]
    NoReaders,
    #[error("no eID card found")]
    NoCard,
    #[error("the operation timed out")]
    Timeout,
    #[error("card communication failure: {0}")]
    CardCommunication(String),
    #[error("smart card service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl CommandError {
    /// Stable error code written to the native-messaging response.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "ERR_WEBEID_NATIVE_INVALID_ARGUMENT",
            Self::Programming(_) => "ERR_WEBEID_NATIVE_FATAL",
            Self::PinBlocked => "ERR_WEBEID_PIN_BLOCKED",
            Self::UserCancelled => "ERR_WEBEID_USER_CANCELLED",
            Self::NoReaders => "ERR_WEBEID_NO_SMART_CARD_READERS",
            Self::NoCard => "ERR_WEBEID_NO_SMART_CARD",
            Self::Timeout => "ERR_WEBEID_ACTION_TIMEOUT",
            Self::CardCommunication(_) => "ERR_WEBEID_CARD_COMMUNICATION_FAILURE",
            Self::ServiceUnavailable(_) => "ERR_WEBEID_SMART_CARD_SERVICE_UNAVAILABLE",
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn programming(message: impl Into<String>) -> Self {
        Self::Programming(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            CommandError::invalid_argument("x").code(),
            "ERR_WEBEID_NATIVE_INVALID_ARGUMENT"
        );
        assert_eq!(CommandError::NoReaders.code(), "ERR_WEBEID_NO_SMART_CARD_READERS");
        assert_eq!(CommandError::UserCancelled.code(), "ERR_WEBEID_USER_CANCELLED");
    }

    #[test]
    fn wrong_pin_message_carries_retries() {
        let reason = RetryReason::WrongPin { retries_left: 2 };
        assert_eq!(reason.to_string(), "wrong PIN, 2 attempts left");
    }
}
