//! Mix session error types.

use cspp_crypto::CryptoError;

use crate::confirmer::ConfirmError;
use crate::transport::TransportError;

/// Errors that end a mix session.
///
/// Failures the protocol can recover from (blame and reruns) never surface
/// here; they are handled inside the run loop.
#[derive(Debug, thiserror::Error)]
pub enum MixError {
    #[error("mix cancelled")]
    Cancelled,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("invalid roster: {0}")]
    InvalidRoster(String),

    #[error("incorrect self message count: expected {expected}, got {actual}")]
    SelfMessageCount { expected: usize, actual: i64 },

    #[error("wrong total {what} count: expected {expected}, got {actual}")]
    PeerTotal {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },

    #[error("root {0} is not in the field")]
    RootNotInField(String),

    #[error("generator returned {actual} messages, expected {expected}")]
    GeneratedCount { expected: usize, actual: usize },

    #[error("generated message {index} is {actual} bytes, expected {expected}")]
    GeneratedSize {
        index: usize,
        expected: usize,
        actual: usize,
    },

    #[error("generate: {0}")]
    Generate(#[source] ConfirmError),

    #[error("payload: {0}")]
    Payload(#[source] ConfirmError),

    #[error("confirm: {0}")]
    Confirm(#[source] ConfirmError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("run index overflow")]
    RunOverflow,
}

impl MixError {
    /// The coordinator error code behind this failure, if any.
    pub const fn server_error(&self) -> Option<crate::messages::ServerError> {
        match self {
            Self::Transport(e) => e.server_error(),
            _ => None,
        }
    }

    /// Whether a coordinator message missed its deadline.
    pub const fn is_timeout(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout(),
            _ => false,
        }
    }
}

impl From<rand::Error> for MixError {
    fn from(e: rand::Error) -> Self {
        Self::Crypto(CryptoError::Randomness(e))
    }
}
