use thiserror::Error;

/// Errors surfaced by the public API of this crate.
///
/// `ProtocolError` from the spec (a malformed DBServer query response) is
/// deliberately not a variant here: per spec, a short or oversized read is
/// logged and treated as an unknown port, never raised to the caller.
#[derive(Debug, Error)]
pub enum ProDjLinkError {
    #[error("failed to bind announcement socket: {0}")]
    NetworkBind(#[source] std::io::Error),

    #[error("operation requires an active DeviceFinder")]
    NotActive,

    #[error("no such player: {0}")]
    NoSuchPlayer(u8),

    #[error("no available source device number to pose as when querying player {0}")]
    NoAvailableSourceNumber(u8),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProDjLinkError>;
