//! Wire envelopes and their transferable side channel.

use serde::{Deserialize, Serialize};

use crate::{error::Error, port::Port};

/// Encoding unit on the wire.
///
/// Envelopes form a tree: a plain list or map holds child envelopes,
/// so an encoded value may sit anywhere inside cloneable structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    /// Structure-cloneable payload.
    Plain(Plain),
    /// Opaque payload interpreted by the named codec.
    Encoded { codec: String, payload: Plain },
}

/// Structure-cloneable payload tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Plain {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Envelope>),
    Map(Vec<(String, Envelope)>),
}

/// Object whose underlying storage moves (is not copied) across the
/// boundary, riding out-of-band next to an envelope.
#[derive(Debug)]
pub enum Transferable {
    Port(Port),
    Buffer(Vec<u8>),
}

/// An envelope together with its transferable side channel; the unit
/// a port carries.
#[derive(Debug)]
pub struct Packet {
    pub envelope: Envelope,
    pub transfers: Vec<Transferable>,
}

impl Packet {
    /// Packet carrying nothing out-of-band.
    pub fn plain(envelope: Envelope) -> Self {
        Packet {
            envelope,
            transfers: Vec::new(),
        }
    }

    /// The aggregated transferables attached to this envelope.
    pub fn transferables(&self) -> &[Transferable] {
        &self.transfers
    }
}

/// Decode-side source of transferables.
///
/// Hands out each transferable exactly once, by the index the encoding
/// side assigned to it.
pub struct Transfers {
    slots: Vec<Option<Transferable>>,
}

impl Transfers {
    pub fn new(transfers: Vec<Transferable>) -> Self {
        Transfers {
            slots: transfers.into_iter().map(Some).collect(),
        }
    }

    /// Take the transferable at `index`.
    ///
    /// Fails if the index is out of range or was already taken.
    pub fn take(&mut self, index: usize) -> Result<Transferable, Error> {
        self.slots
            .get_mut(index)
            .and_then(Option::take)
            .ok_or_else(|| Error::Malformed(format!("transferable reference {index}")))
    }
}
