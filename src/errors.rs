//! Error taxonomy for the server.

use std::fmt;

/// Every error the server can produce, classified by how the connection
/// loop (`connection.rs`) must react to it.
#[derive(Debug)]
pub enum Error {
    /// Socket or file I/O failure. Recovered per-connection; never fatal
    /// to the process.
    Io(std::io::Error),

    /// Malformed frame or short header. Drop the connection.
    Protocol(String),

    /// Declared frame length exceeds the configured cap.
    TooLarge { declared: u32, max: u32 },

    /// Credential or session-related failure reported to the client; the
    /// connection stays open.
    Auth(AuthError),

    /// Command issued in the wrong FSM state.
    State(StateError),

    /// Domain-level rule violation (follow graph, formatting, ...).
    Domain(DomainError),

    /// Allocation/lock failure or other unexpected internal condition.
    /// Reported to the client as `-1 ...` and the connection is then
    /// terminated.
    Internal(String),

    /// The password hashing primitive refused to produce a hash.
    Crypto(String),
}

#[derive(Debug, Eq, PartialEq)]
pub enum AuthError {
    NoSuchEmail,
    BadPassword,
    Busy,
}

#[derive(Debug, Eq, PartialEq)]
pub enum StateError {
    NotLoggedIn,
    AlreadyLoggedIn,
}

#[derive(Debug, Eq, PartialEq)]
pub enum DomainError {
    AlreadyFollowing,
    NotFollowing,
    SelfFollow,
    BadFormat,
    AlreadyExists,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "i/o error: {e}"),
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Error::TooLarge { declared, max } => write!(
                f,
                "command string exceeds the maximum length of {max} bytes (got {declared})"
            ),
            Error::Auth(e) => write!(f, "{e:?}"),
            Error::State(e) => write!(f, "{e:?}"),
            Error::Domain(e) => write!(f, "{e:?}"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
            Error::Crypto(msg) => write!(f, "crypto error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Whether this error must terminate the connection once a reply (if any)
/// has been flushed.
impl Error {
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Protocol(_) | Error::Internal(_))
    }
}
