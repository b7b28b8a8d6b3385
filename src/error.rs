use thiserror::Error;

/// Protocol-level failures.
///
/// `IncompleteFrame` is not fatal: it means the buffer does not yet hold a
/// whole frame and the caller should wait for more data. The other two
/// variants abort the upgrade or close the offending connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed handshake: {0}")]
    MalformedHandshake(&'static str),

    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    #[error("incomplete frame")]
    IncompleteFrame,
}
