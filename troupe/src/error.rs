use std::fmt::{self, Display};

use crate::live::Thrown;

/// Fabric error.
#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// Occurs when a channel, port or queue is closed.
    Closed,
    /// Value (or one of its members) is neither cloneable data
    /// nor handled by a registered codec.
    Unencodable(&'static str),
    /// Incoming envelope names a codec this wire does not know.
    UnknownCodec(String),
    /// Incoming envelope or payload does not have the expected shape.
    Malformed(String),
    /// Value owns a resource that cannot be duplicated.
    NotClonable(&'static str),
    /// Operation is not supported by this flavor of port or channel.
    Unsupported(&'static str),
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "channel closed"),
            Self::Unencodable(kind) => write!(f, "no codec can handle {kind} value"),
            Self::UnknownCodec(name) => write!(f, "unknown codec `{name}`"),
            Self::Malformed(what) => write!(f, "malformed {what}"),
            Self::NotClonable(kind) => write!(f, "{kind} value cannot be cloned"),
            Self::Unsupported(what) => write!(f, "unsupported operation: {what}"),
        }
    }
}

impl std::error::Error for Error {}

/// Error of a remote-value operation.
#[derive(Debug, PartialEq)]
pub enum RemoteError {
    /// Transporting the request or response failed.
    Transport(Error),
    /// The operation ran on the remote side and failed there;
    /// this is the re-thrown fault.
    Thrown(Thrown),
    /// The response arrived but its shape was not understood.
    Malformed(String),
}

impl Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(error) => write!(f, "{error}"),
            Self::Thrown(thrown) => write!(f, "{thrown}"),
            Self::Malformed(what) => write!(f, "malformed {what}"),
        }
    }
}

impl std::error::Error for RemoteError {}

impl From<Error> for RemoteError {
    fn from(error: Error) -> Self {
        RemoteError::Transport(error)
    }
}
