//! Card subsystem errors and their translation into the command taxonomy.

use crate::error::{CommandError, RetryReason};

/// Failures surfaced by the card facade. The controller decides per state
/// whether a value retries (through [`CardError::retry_reason`]) or
/// terminates the command (through [`CardError::into_terminal`]).
#[derive(thiserror::Error, Debug)]
pub enum CardError {
    #[error("no smart card readers attached")]
    NoReader,
    #[error("no eID card in any reader")]
    NoCard,
    #[error("unsupported card")]
    UnknownCard,
    #[error("card removed")]
    CardRemoved,
    #[error("PIN verification disabled")]
    PinVerifyDisabled,
    #[error("wrong PIN, {retries_left} attempts left")]
    WrongPin { retries_left: u8 },
    #[error("PIN pad entry timed out")]
    PinTimeout,
    #[error("PIN blocked")]
    PinBlocked,
    #[error("operation cancelled")]
    Cancelled,
    #[error("smart card service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("card communication failure: {0}")]
    Communication(String),
}

impl CardError {
    /// The user-recoverable reading of this error, if it has one.
    ///
    /// A wrong PIN with zero attempts left is not recoverable; it is
    /// promoted to [`CardError::PinBlocked`] at translation time.
    pub fn retry_reason(&self) -> Option<RetryReason> {
        match self {
            Self::NoReader => Some(RetryReason::NoReader),
            Self::NoCard => Some(RetryReason::NoCard),
            Self::UnknownCard => Some(RetryReason::UnknownCard),
            Self::CardRemoved => Some(RetryReason::CardRemoved),
            Self::PinVerifyDisabled => Some(RetryReason::PinVerifyDisabled),
            Self::WrongPin { retries_left } if *retries_left > 0 => {
                Some(RetryReason::WrongPin {
                    retries_left: *retries_left,
                })
            }
            Self::PinTimeout => Some(RetryReason::PinTimeout),
            _ => None,
        }
    }

    /// The terminal command error this failure maps to.
    pub fn into_terminal(self) -> CommandError {
        match self {
            Self::NoReader => CommandError::NoReaders,
            Self::NoCard | Self::UnknownCard | Self::CardRemoved => CommandError::NoCard,
            Self::WrongPin { retries_left: 0 } | Self::PinBlocked => CommandError::PinBlocked,
            Self::WrongPin { .. } | Self::PinVerifyDisabled => {
                CommandError::CardCommunication(self.to_string())
            }
            Self::PinTimeout => CommandError::Timeout,
            Self::Cancelled => CommandError::UserCancelled,
            Self::ServiceUnavailable(message) => CommandError::ServiceUnavailable(message),
            Self::Communication(message) => CommandError::CardCommunication(message),
        }
    }
}

impl From<pcsc::Error> for CardError {
    fn from(err: pcsc::Error) -> Self {
        match err {
            pcsc::Error::NoService | pcsc::Error::ServiceStopped => {
                Self::ServiceUnavailable(err.to_string())
            }
            pcsc::Error::NoReadersAvailable | pcsc::Error::UnknownReader => Self::NoReader,
            pcsc::Error::RemovedCard | pcsc::Error::NoSmartcard => Self::CardRemoved,
            pcsc::Error::Cancelled => Self::Cancelled,
            other => Self::Communication(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrong_pin_with_retries_is_retriable() {
        let err = CardError::WrongPin { retries_left: 2 };
        assert_eq!(
            err.retry_reason(),
            Some(RetryReason::WrongPin { retries_left: 2 })
        );
    }

    #[test]
    fn exhausted_pin_promotes_to_blocked() {
        let err = CardError::WrongPin { retries_left: 0 };
        assert!(err.retry_reason().is_none());
        assert!(matches!(err.into_terminal(), CommandError::PinBlocked));
    }

    #[test]
    fn cancellation_is_terminal() {
        assert!(CardError::Cancelled.retry_reason().is_none());
        assert!(matches!(
            CardError::Cancelled.into_terminal(),
            CommandError::UserCancelled
        ));
    }
}
