use std::io;

/// Failure reported by the store client for a single command or for the
/// whole connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(String),
    #[error("server closed the connection")]
    Eof,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("client is closing")]
    Closing,
    #[error("empty command")]
    EmptyCommand,
    #[error("not connected")]
    NotConnected,
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        ClientError::Io(err.to_string())
    }
}

/// Errors surfaced by the bridges.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("no runtime installed on this thread")]
    NoRuntime,
    #[error("client already has event hooks attached")]
    AlreadyAttached,
    #[error("connection was detached")]
    Detached,
    #[error("connection lost before the reply arrived")]
    Disconnected,
    #[error("could not issue command: {0}")]
    Issue(#[from] ClientError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<BridgeError> for io::Error {
    fn from(value: BridgeError) -> Self {
        match value {
            BridgeError::Io(err) => err,
            BridgeError::NoRuntime => io::Error::new(io::ErrorKind::Other, value),
            BridgeError::AlreadyAttached => io::Error::new(io::ErrorKind::AlreadyExists, value),
            BridgeError::Detached | BridgeError::Disconnected => {
                io::Error::new(io::ErrorKind::NotConnected, value)
            }
            BridgeError::Issue(_) => io::Error::new(io::ErrorKind::Other, value),
        }
    }
}
