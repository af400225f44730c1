//! Dynamic values moved by the fabric.

use std::{
    collections::BTreeMap,
    fmt::{self, Debug, Display},
    sync::Arc,
};

use crate::{channel::Channel, envelope::Transferable, error::Error, port::Port, remote::Proxy};

/// Native function callable through the fabric.
///
/// Sending one across a boundary promotes it into a remote proxy.
pub type NativeFn = Arc<dyn Fn(Vec<Live>) -> Result<Live, Thrown> + Send + Sync>;

/// A value living on this side of a boundary.
///
/// Cloneable leaves and containers cross boundaries by structure; the
/// capability leaves (ports, channels, functions, marked values) are
/// promoted by codecs instead.
pub enum Live {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Live>),
    Map(BTreeMap<String, Live>),
    /// A transferable port; moves across the boundary.
    Port(Port),
    /// A channel; encodes as its underlying port, moving it.
    Channel(Channel),
    /// A callable; becomes a remote proxy on the far side.
    Func(NativeFn),
    /// Explicitly marked for promotion into a remote proxy.
    ///
    /// The marker is a variant of this enum, so it cannot collide with
    /// any user-controlled key.
    Marked(Box<Live>),
    /// Proxy to a value owned by the far side.
    Remote(Proxy),
    /// An error value; re-thrown when it decodes as an operation result.
    Fault(Thrown),
    /// Value with explicitly associated transferables that ride along
    /// when it is encoded.
    Attached {
        value: Box<Live>,
        transfers: Vec<Transferable>,
    },
}

impl Live {
    /// Build a map value.
    pub fn map<K, I>(entries: I) -> Live
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Live)>,
    {
        Live::Map(
            entries
                .into_iter()
                .map(|(key, value)| (key.into(), value))
                .collect(),
        )
    }

    /// Build a list value.
    pub fn list<I: IntoIterator<Item = Live>>(items: I) -> Live {
        Live::List(items.into_iter().collect())
    }

    /// Wrap a native function.
    pub fn func<F>(function: F) -> Live
    where
        F: Fn(Vec<Live>) -> Result<Live, Thrown> + Send + Sync + 'static,
    {
        Live::Func(Arc::new(function))
    }

    /// Mark a value for promotion into a remote proxy when it crosses
    /// a boundary.
    pub fn marked(value: Live) -> Live {
        Live::Marked(Box::new(value))
    }

    /// Associate transferables with a value so they ride along when it
    /// is encoded.
    pub fn attached(value: Live, transfers: Vec<Transferable>) -> Live {
        Live::Attached {
            value: Box::new(value),
            transfers,
        }
    }

    /// Member of a map value.
    pub fn get(&self, key: &str) -> Option<&Live> {
        match self {
            Live::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Remove and return a member of a map value.
    pub fn take(&mut self, key: &str) -> Option<Live> {
        match self {
            Live::Map(map) => map.remove(key),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Live::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Live::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Live::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Live::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Live]> {
        match self {
            Live::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_list(self) -> Option<Vec<Live>> {
        match self {
            Live::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Live>> {
        match self {
            Live::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Kind of the value, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Live::Unit => "unit",
            Live::Bool(_) => "bool",
            Live::Int(_) => "int",
            Live::Float(_) => "float",
            Live::Text(_) => "text",
            Live::Bytes(_) => "bytes",
            Live::List(_) => "list",
            Live::Map(_) => "map",
            Live::Port(_) => "port",
            Live::Channel(_) => "channel",
            Live::Func(_) => "function",
            Live::Marked(_) => "marked",
            Live::Remote(_) => "proxy",
            Live::Fault(_) => "fault",
            Live::Attached { .. } => "attached",
        }
    }

    /// Duplicate the value.
    ///
    /// Fails for values owning a resource that can only move: ports,
    /// channels, proxies and attached transferables.
    pub fn try_clone(&self) -> Result<Live, Error> {
        Ok(match self {
            Live::Unit => Live::Unit,
            Live::Bool(value) => Live::Bool(*value),
            Live::Int(value) => Live::Int(*value),
            Live::Float(value) => Live::Float(*value),
            Live::Text(value) => Live::Text(value.clone()),
            Live::Bytes(bytes) => Live::Bytes(bytes.clone()),
            Live::List(items) => Live::List(
                items
                    .iter()
                    .map(Live::try_clone)
                    .collect::<Result<_, _>>()?,
            ),
            Live::Map(map) => Live::Map(
                map.iter()
                    .map(|(key, value)| Ok((key.clone(), value.try_clone()?)))
                    .collect::<Result<_, Error>>()?,
            ),
            Live::Func(function) => Live::Func(function.clone()),
            Live::Marked(value) => Live::Marked(Box::new(value.try_clone()?)),
            Live::Fault(thrown) => Live::Fault(thrown.clone()),
            Live::Port(_) => return Err(Error::NotClonable("port")),
            Live::Channel(_) => return Err(Error::NotClonable("channel")),
            Live::Remote(_) => return Err(Error::NotClonable("proxy")),
            Live::Attached { .. } => return Err(Error::NotClonable("attached")),
        })
    }
}

impl PartialEq for Live {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Live::Unit, Live::Unit) => true,
            (Live::Bool(a), Live::Bool(b)) => a == b,
            (Live::Int(a), Live::Int(b)) => a == b,
            (Live::Float(a), Live::Float(b)) => a == b,
            (Live::Text(a), Live::Text(b)) => a == b,
            (Live::Bytes(a), Live::Bytes(b)) => a == b,
            (Live::List(a), Live::List(b)) => a == b,
            (Live::Map(a), Live::Map(b)) => a == b,
            (Live::Marked(a), Live::Marked(b)) => a == b,
            (Live::Fault(a), Live::Fault(b)) => a == b,
            (Live::Func(a), Live::Func(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Debug for Live {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Live::Unit => f.write_str("Unit"),
            Live::Bool(value) => write!(f, "Bool({value})"),
            Live::Int(value) => write!(f, "Int({value})"),
            Live::Float(value) => write!(f, "Float({value})"),
            Live::Text(value) => write!(f, "Text({value:?})"),
            Live::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Live::List(items) => f.debug_tuple("List").field(items).finish(),
            Live::Map(map) => f.debug_tuple("Map").field(map).finish(),
            Live::Port(_) => f.write_str("Port(..)"),
            Live::Channel(_) => f.write_str("Channel(..)"),
            Live::Func(_) => f.write_str("Func(..)"),
            Live::Marked(value) => f.debug_tuple("Marked").field(value).finish(),
            Live::Remote(_) => f.write_str("Remote(..)"),
            Live::Fault(thrown) => f.debug_tuple("Fault").field(thrown).finish(),
            Live::Attached { value, transfers } => f
                .debug_struct("Attached")
                .field("value", value)
                .field("transfers", &transfers.len())
                .finish(),
        }
    }
}

impl From<bool> for Live {
    fn from(value: bool) -> Self {
        Live::Bool(value)
    }
}

impl From<i32> for Live {
    fn from(value: i32) -> Self {
        Live::Int(value.into())
    }
}

impl From<i64> for Live {
    fn from(value: i64) -> Self {
        Live::Int(value)
    }
}

impl From<f64> for Live {
    fn from(value: f64) -> Self {
        Live::Float(value)
    }
}

impl From<&str> for Live {
    fn from(value: &str) -> Self {
        Live::Text(value.to_string())
    }
}

impl From<String> for Live {
    fn from(value: String) -> Self {
        Live::Text(value)
    }
}

impl From<uuid::Uuid> for Live {
    fn from(value: uuid::Uuid) -> Self {
        Live::Text(value.to_string())
    }
}

impl From<Vec<u8>> for Live {
    fn from(bytes: Vec<u8>) -> Self {
        Live::Bytes(bytes)
    }
}

impl From<Thrown> for Live {
    fn from(thrown: Thrown) -> Self {
        Live::Fault(thrown)
    }
}

/// Wire-portable error shape.
///
/// Preserves name, message and (when present) a stack-like context
/// string across boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thrown {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl Thrown {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Thrown {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }
}

impl Display for Thrown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for Thrown {}
