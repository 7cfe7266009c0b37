//! Error types for the HA client.

use thiserror::Error;

/// Result type for HA operations.
pub type Result<T> = std::result::Result<T, Error>;

/// SQLSTATE reported for invalid datetime binds and values.
pub const SQLSTATE_INVALID_DATETIME: &str = "22007";

/// One failed connection attempt, kept inside [`Error::AllHostsFailed`].
#[derive(Debug)]
pub struct HostFailure {
    /// Host that was tried, as `host:port` or a socket path
    pub host: String,
    /// Why the attempt failed
    pub cause: Error,
}

/// Error type for HA operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Malformed bytes on the wire; the connection must be closed
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Packet sequence numbers were not contiguous; the connection must be closed
    #[error("protocol desynchronized: expected sequence {expected}, got {actual}")]
    ProtocolDesync {
        /// Sequence number that was expected next
        expected: u8,
        /// Sequence number that arrived
        actual: u8,
    },

    /// The server greeting or capability exchange could not be completed
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Authentication was rejected or could not be carried out
    #[error("authentication failed ({plugin}): {message}")]
    Auth {
        /// Auth plugin that was in use
        plugin: String,
        /// Failure detail
        message: String,
    },

    /// The server requested an auth plugin outside the configured allow-list
    #[error("authentication plugin '{0}' is not permitted by restricted_auth")]
    AuthRestricted(String),

    /// The server rejected a well-formed request
    #[error("server error {code} ({sql_state}): {message}")]
    Server {
        /// Vendor error number
        code: u16,
        /// 5-character SQLSTATE
        sql_state: String,
        /// Server-provided message
        message: String,
    },

    /// Local parameter validation failed; nothing was sent to the server
    #[error("bind error ({sql_state}): {message}")]
    Bind {
        /// 5-character SQLSTATE, `22007` for invalid temporal binds
        sql_state: String,
        /// Failure detail
        message: String,
    },

    /// The physical connection was lost mid-operation
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A buffered transaction statement failed while replaying on a new
    /// connection; the transaction state is lost
    #[error("transaction replay aborted: {detail} (original failure: {cause})")]
    Replay {
        /// What went wrong during replay
        detail: String,
        /// The connection failure that triggered the replay
        #[source]
        cause: Box<Error>,
    },

    /// Every candidate host failed during connect
    #[error("all hosts failed: {}", format_host_failures(.0))]
    AllHostsFailed(Vec<HostFailure>),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Invalid configuration or call parameter
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Connection is closed
    #[error("connection is closed")]
    ConnectionClosed,

    /// Timeout
    #[error("operation timed out")]
    Timeout,

    /// Type conversion error
    #[error("type conversion error: {0}")]
    TypeConversion(String),
}

fn format_host_failures(failures: &[HostFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.host, f.cause))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Build a bind-arity mismatch error.
    pub(crate) fn bind_mismatch(expected: usize, actual: usize) -> Self {
        Error::Bind {
            sql_state: "HY000".to_string(),
            message: format!("statement expects {expected} parameters, {actual} bound"),
        }
    }

    /// Build the invalid-datetime bind error with SQLSTATE `22007`.
    pub(crate) fn invalid_datetime(message: impl Into<String>) -> Self {
        Error::Bind {
            sql_state: SQLSTATE_INVALID_DATETIME.to_string(),
            message: message.into(),
        }
    }

    /// The standardized 5-character state code for this error.
    pub fn sql_state(&self) -> &str {
        match self {
            Error::Server { sql_state, .. } | Error::Bind { sql_state, .. } => sql_state,
            Error::Protocol(_) | Error::ProtocolDesync { .. } | Error::ConnectionLost(_) => "08S01",
            Error::Handshake(_) | Error::AllHostsFailed(_) | Error::Io(_) | Error::Timeout => {
                "08001"
            }
            Error::Auth { .. } | Error::AuthRestricted(_) => "28000",
            Error::Replay { .. } => "25S03",
            Error::ConnectionClosed => "08003",
            _ => "HY000",
        }
    }

    /// The vendor error number, when the server supplied one.
    pub fn error_code(&self) -> Option<u16> {
        match self {
            Error::Server { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether this error means the physical connection is unusable.
    ///
    /// Fatal errors trigger failover when an HA mode is configured.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Protocol(_)
            | Error::ProtocolDesync { .. }
            | Error::ConnectionLost(_)
            | Error::Io(_) => true,
            // ER_SERVER_SHUTDOWN, ER_CONNECTION_KILLED, CR_SERVER_GONE_ERROR, CR_SERVER_LOST
            Error::Server { code, .. } => matches!(code, 1053 | 1927 | 2006 | 2013),
            _ => false,
        }
    }
}
