use std::fmt::{self, Display};

use uuid::Uuid;

use crate::address::Address;

/// Stage runtime error.
#[derive(Debug, PartialEq, Eq)]
pub enum StageError {
    /// A link peer broke the stage protocol (wrong handshake, second
    /// parent, and the like).
    Protocol(String),
    /// Datagram addressed to this stage names an actor that does not
    /// exist here.
    UnknownActor(Address),
    /// Lookup failed: no reply arrived before the links closed.
    Unresolved(String),
    /// Underlying fabric failure. Link closure surfaces as
    /// `Transport(Closed)`.
    Transport(troupe::Error),
    /// The stage has no link to the given peer.
    ///
    /// Reserved for routing policies that fail instead of degrading;
    /// the default router broadcasts datagrams for unknown stages and
    /// never constructs this.
    UnknownStage(Uuid),
}

impl Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(what) => write!(f, "protocol violation: {what}"),
            Self::UnknownActor(address) => write!(f, "no actor {address} on this stage"),
            Self::Unresolved(whois) => write!(f, "`{whois}` did not resolve"),
            Self::Transport(error) => write!(f, "{error}"),
            Self::UnknownStage(stage) => write!(f, "no link to stage {stage}"),
        }
    }
}

impl std::error::Error for StageError {}

impl From<troupe::Error> for StageError {
    fn from(error: troupe::Error) -> Self {
        StageError::Transport(error)
    }
}
