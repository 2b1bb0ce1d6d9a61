use std::{error, fmt};

/// Errors caused by users of the library.
///
/// Priority signals from the peer are never errors: a malicious or buggy
/// peer must not be able to crash the endpoint, so self-dependencies,
/// unknown dependencies, stale handles and double removes are all downgraded
/// or ignored. The only surfaced error is a locally constructed call that
/// cannot mean anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserError {
    /// Stream ID zero names the connection and cannot be added as a stream.
    InvalidStreamId,
}

// ===== impl UserError =====

impl error::Error for UserError {}

impl fmt::Display for UserError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        use self::UserError::*;

        fmt.write_str(match *self {
            InvalidStreamId => "invalid stream ID",
        })
    }
}
