use coap_lite::error::MessageError;
use std::{fmt, io};

/// Failures surfaced by the message layer.
///
/// All of these are per-exchange conditions; none of them tears down the
/// socket or the reactor.
#[derive(Debug)]
pub enum Error {
    /// A confirmable exhausted its retransmissions without an ACK or RST.
    ConfirmableTimeout,
    /// The peer answered a confirmable with a reset.
    PeerReset,
    /// All 65 536 message IDs are currently reserved. Transient
    /// backpressure; retrying after a short pause will succeed.
    NoFreeMessageIds,
    /// A webservice failed to produce a response.
    HandlerFailed(String),
    /// The codec rejected a message on encode.
    MessageFormat(MessageError),
    /// Socket-level failure.
    Network(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConfirmableTimeout => write!(f, "confirmable timed out without acknowledgement"),
            Error::PeerReset => write!(f, "peer answered with reset"),
            Error::NoFreeMessageIds => write!(f, "all message IDs are reserved"),
            Error::HandlerFailed(reason) => write!(f, "handler failed: {}", reason),
            Error::MessageFormat(error) => write!(f, "message format error: {:?}", error),
            Error::Network(error) => write!(f, "network error: {}", error),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Network(error) => Some(error),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Error {
        Error::Network(error)
    }
}

impl From<MessageError> for Error {
    fn from(error: MessageError) -> Error {
        Error::MessageFormat(error)
    }
}
