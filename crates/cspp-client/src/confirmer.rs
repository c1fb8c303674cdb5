//! The anonymized payload contract.
//!
//! A mix carries an opaque payload (for example a transaction) that every
//! peer contributes to before mixing and confirms afterwards. The session
//! only moves its binary form; generating anonymized messages and checking
//! the merged result is up to the implementor.

/// Size of every anonymized message.
pub const MESSAGE_SIZE: usize = 20;

/// Failure reported by a [`GenConfirmer`].
#[derive(Debug, thiserror::Error)]
pub enum ConfirmError {
    /// One or more of this peer's anonymized messages are absent from the
    /// mix. The run is blamed and retried rather than aborted.
    #[error("missing anonymized message: {0}")]
    MissingMessage(String),

    #[error("invalid payload: {0}")]
    Invalid(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl ConfirmError {
    pub const fn is_missing_message(&self) -> bool {
        matches!(self, Self::MissingMessage(_))
    }
}

/// Generates anonymized messages and confirms the mixed payload.
pub trait GenConfirmer: Send {
    /// Binary form of the current payload.
    fn marshal(&self) -> Result<Vec<u8>, ConfirmError>;

    /// Replace the payload with a decoded mix.
    fn unmarshal(&mut self, data: &[u8]) -> Result<(), ConfirmError>;

    /// Fresh anonymized messages, one per contributed message, each
    /// [`MESSAGE_SIZE`] bytes long.
    fn generate(&mut self) -> Result<Vec<Vec<u8>>, ConfirmError>;

    /// Check the merged payload and apply this peer's confirmation to it.
    fn confirm(&mut self) -> Result<(), ConfirmError>;
}
