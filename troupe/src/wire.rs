//! Codec registry: encoding and decoding of values crossing a boundary.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::{
    channel::Channel,
    envelope::{Envelope, Packet, Plain, Transferable, Transfers},
    error::Error,
    live::{Live, Thrown},
    remote::RemoteCodec,
};

/// Bidirectional translator between a class of values and a cloneable
/// payload plus a set of transferables.
///
/// Codecs may recurse through the wire to handle children; plain
/// structure recursion never re-enters a codec for the same sub-value,
/// so mutual recursion terminates.
pub trait Codec: Send + Sync {
    /// Discriminant used on the wire.
    fn name(&self) -> &str;

    /// Whether this codec takes the value.
    ///
    /// Must return `false` for values outside the codec's domain;
    /// the first matching codec wins.
    fn can_handle(&self, value: &Live) -> bool;

    fn encode(
        &self,
        value: Live,
        wire: &Wire,
        transfers: &mut Vec<Transferable>,
    ) -> Result<Plain, Error>;

    fn decode(&self, payload: Plain, wire: &Wire, transfers: &mut Transfers)
        -> Result<Live, Error>;
}

/// Registry of codecs; encode/decode entry point.
///
/// Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct Wire {
    codecs: Arc<RwLock<Vec<Arc<dyn Codec>>>>,
}

impl Wire {
    /// Create a wire with the built-in codecs registered: `port`,
    /// `channel`, `attach`, `thrown` and `remote`.
    pub fn new() -> Self {
        let wire = Self::empty();
        wire.register(PortCodec);
        wire.register(ChannelCodec);
        wire.register(AttachCodec);
        wire.register(ThrownCodec);
        wire.register(RemoteCodec);
        wire
    }

    /// Create a wire with no codecs at all.
    pub fn empty() -> Self {
        Wire {
            codecs: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Add a codec to the active set.
    ///
    /// A codec with an already registered name replaces the old one in
    /// place, keeping its precedence slot; a new name is appended after
    /// all existing codecs.
    pub fn register<C: Codec + 'static>(&self, codec: C) {
        let mut codecs = self.codecs.write();
        match codecs.iter_mut().find(|slot| slot.name() == codec.name()) {
            Some(slot) => *slot = Arc::new(codec),
            None => codecs.push(Arc::new(codec)),
        }
    }

    fn handler(&self, value: &Live) -> Option<Arc<dyn Codec>> {
        self.codecs
            .read()
            .iter()
            .find(|codec| codec.can_handle(value))
            .cloned()
    }

    fn by_name(&self, name: &str) -> Option<Arc<dyn Codec>> {
        self.codecs
            .read()
            .iter()
            .find(|codec| codec.name() == name)
            .cloned()
    }

    /// Encode a value into a packet, collecting transferables bottom-up.
    ///
    /// Consumes the value: whatever owns ports moves onto the wire.
    pub fn encode(&self, value: Live) -> Result<Packet, Error> {
        let mut transfers = Vec::new();
        let envelope = self.encode_value(value, &mut transfers)?;
        Ok(Packet {
            envelope,
            transfers,
        })
    }

    /// Encode one node of the value tree.
    ///
    /// Entry point for recursive codecs.
    pub fn encode_value(
        &self,
        value: Live,
        transfers: &mut Vec<Transferable>,
    ) -> Result<Envelope, Error> {
        if let Some(codec) = self.handler(&value) {
            let name = codec.name().to_string();
            let payload = codec.encode(value, self, transfers)?;
            return Ok(Envelope::Encoded {
                codec: name,
                payload,
            });
        }
        let plain = match value {
            Live::Unit => Plain::Unit,
            Live::Bool(value) => Plain::Bool(value),
            Live::Int(value) => Plain::Int(value),
            Live::Float(value) => Plain::Float(value),
            Live::Text(value) => Plain::Text(value),
            Live::Bytes(bytes) => Plain::Bytes(bytes),
            Live::List(items) => Plain::List(
                items
                    .into_iter()
                    .map(|item| self.encode_value(item, transfers))
                    .collect::<Result<_, _>>()?,
            ),
            Live::Map(map) => Plain::Map(
                map.into_iter()
                    .map(|(key, value)| Ok((key, self.encode_value(value, transfers)?)))
                    .collect::<Result<_, Error>>()?,
            ),
            other => return Err(Error::Unencodable(other.kind())),
        };
        Ok(Envelope::Plain(plain))
    }

    /// Decode a packet back into a value.
    pub fn decode(&self, packet: Packet) -> Result<Live, Error> {
        let Packet {
            envelope,
            transfers,
        } = packet;
        let mut transfers = Transfers::new(transfers);
        self.decode_value(envelope, &mut transfers)
    }

    /// Decode one node of the envelope tree.
    ///
    /// Entry point for recursive codecs.
    pub fn decode_value(
        &self,
        envelope: Envelope,
        transfers: &mut Transfers,
    ) -> Result<Live, Error> {
        match envelope {
            Envelope::Encoded { codec, payload } => {
                let handler = self
                    .by_name(&codec)
                    .ok_or(Error::UnknownCodec(codec))?;
                handler.decode(payload, self, transfers)
            }
            Envelope::Plain(plain) => Ok(match plain {
                Plain::Unit => Live::Unit,
                Plain::Bool(value) => Live::Bool(value),
                Plain::Int(value) => Live::Int(value),
                Plain::Float(value) => Live::Float(value),
                Plain::Text(value) => Live::Text(value),
                Plain::Bytes(bytes) => Live::Bytes(bytes),
                Plain::List(items) => Live::List(
                    items
                        .into_iter()
                        .map(|item| self.decode_value(item, transfers))
                        .collect::<Result<_, _>>()?,
                ),
                Plain::Map(entries) => Live::Map(
                    entries
                        .into_iter()
                        .map(|(key, value)| Ok((key, self.decode_value(value, transfers)?)))
                        .collect::<Result<_, Error>>()?,
                ),
            }),
        }
    }

    /// Associate transferables with a value so they ride along when it
    /// is encoded.
    pub fn transfer(&self, value: Live, transfers: Vec<Transferable>) -> Live {
        Live::attached(value, transfers)
    }
}

impl Default for Wire {
    fn default() -> Self {
        Self::new()
    }
}

/// A port moves into the transfer list; the payload is its slot index.
struct PortCodec;

impl Codec for PortCodec {
    fn name(&self) -> &str {
        "port"
    }

    fn can_handle(&self, value: &Live) -> bool {
        matches!(value, Live::Port(_))
    }

    fn encode(
        &self,
        value: Live,
        _wire: &Wire,
        transfers: &mut Vec<Transferable>,
    ) -> Result<Plain, Error> {
        let Live::Port(port) = value else {
            return Err(Error::Malformed("port codec input".to_string()));
        };
        let index = transfers.len() as i64;
        transfers.push(Transferable::Port(port));
        Ok(Plain::Int(index))
    }

    fn decode(
        &self,
        payload: Plain,
        _wire: &Wire,
        transfers: &mut Transfers,
    ) -> Result<Live, Error> {
        let Plain::Int(index) = payload else {
            return Err(Error::Malformed("port payload".to_string()));
        };
        match transfers.take(index as usize)? {
            Transferable::Port(port) => Ok(Live::Port(port)),
            Transferable::Buffer(_) => Err(Error::Malformed("port slot".to_string())),
        }
    }
}

/// A channel encodes as its underlying port; sending a channel moves it.
struct ChannelCodec;

impl Codec for ChannelCodec {
    fn name(&self) -> &str {
        "channel"
    }

    fn can_handle(&self, value: &Live) -> bool {
        matches!(value, Live::Channel(_))
    }

    fn encode(
        &self,
        value: Live,
        _wire: &Wire,
        transfers: &mut Vec<Transferable>,
    ) -> Result<Plain, Error> {
        let Live::Channel(channel) = value else {
            return Err(Error::Malformed("channel codec input".to_string()));
        };
        let port = channel.into_port()?;
        let index = transfers.len() as i64;
        transfers.push(Transferable::Port(port));
        Ok(Plain::Int(index))
    }

    fn decode(
        &self,
        payload: Plain,
        wire: &Wire,
        transfers: &mut Transfers,
    ) -> Result<Live, Error> {
        let Plain::Int(index) = payload else {
            return Err(Error::Malformed("channel payload".to_string()));
        };
        match transfers.take(index as usize)? {
            Transferable::Port(port) => Ok(Live::Channel(Channel::new(port, wire.clone()))),
            Transferable::Buffer(_) => Err(Error::Malformed("channel slot".to_string())),
        }
    }
}

/// Explicitly associated transferables ride the side channel; the
/// payload keeps their slot indices next to the inner value.
struct AttachCodec;

impl Codec for AttachCodec {
    fn name(&self) -> &str {
        "attach"
    }

    fn can_handle(&self, value: &Live) -> bool {
        matches!(value, Live::Attached { .. })
    }

    fn encode(
        &self,
        value: Live,
        wire: &Wire,
        transfers: &mut Vec<Transferable>,
    ) -> Result<Plain, Error> {
        let Live::Attached {
            value,
            transfers: attached,
        } = value
        else {
            return Err(Error::Malformed("attach codec input".to_string()));
        };
        let indices = attached
            .into_iter()
            .map(|transferable| {
                let index = transfers.len() as i64;
                transfers.push(transferable);
                Envelope::Plain(Plain::Int(index))
            })
            .collect();
        let inner = wire.encode_value(*value, transfers)?;
        Ok(Plain::Map(vec![
            ("value".to_string(), inner),
            ("transfers".to_string(), Envelope::Plain(Plain::List(indices))),
        ]))
    }

    fn decode(
        &self,
        payload: Plain,
        wire: &Wire,
        transfers: &mut Transfers,
    ) -> Result<Live, Error> {
        let Plain::Map(entries) = payload else {
            return Err(Error::Malformed("attach payload".to_string()));
        };
        let mut inner = None;
        let mut attached = Vec::new();
        for (key, envelope) in entries {
            match key.as_str() {
                "value" => inner = Some(envelope),
                "transfers" => {
                    let Envelope::Plain(Plain::List(indices)) = envelope else {
                        return Err(Error::Malformed("attach transfer list".to_string()));
                    };
                    for index in indices {
                        let Envelope::Plain(Plain::Int(index)) = index else {
                            return Err(Error::Malformed("attach transfer index".to_string()));
                        };
                        attached.push(transfers.take(index as usize)?);
                    }
                }
                _ => return Err(Error::Malformed("attach payload entry".to_string())),
            }
        }
        let inner = inner.ok_or_else(|| Error::Malformed("attach payload".to_string()))?;
        let value = wire.decode_value(inner, transfers)?;
        Ok(Live::attached(value, attached))
    }
}

/// Error values cross the boundary with name, message and context
/// preserved, so awaiting the matching response re-throws them.
struct ThrownCodec;

impl Codec for ThrownCodec {
    fn name(&self) -> &str {
        "thrown"
    }

    fn can_handle(&self, value: &Live) -> bool {
        matches!(value, Live::Fault(_))
    }

    fn encode(
        &self,
        value: Live,
        _wire: &Wire,
        _transfers: &mut Vec<Transferable>,
    ) -> Result<Plain, Error> {
        let Live::Fault(thrown) = value else {
            return Err(Error::Malformed("thrown codec input".to_string()));
        };
        let stack = match thrown.stack {
            Some(stack) => Plain::Text(stack),
            None => Plain::Unit,
        };
        Ok(Plain::Map(vec![
            (
                "name".to_string(),
                Envelope::Plain(Plain::Text(thrown.name)),
            ),
            (
                "message".to_string(),
                Envelope::Plain(Plain::Text(thrown.message)),
            ),
            ("stack".to_string(), Envelope::Plain(stack)),
        ]))
    }

    fn decode(
        &self,
        payload: Plain,
        _wire: &Wire,
        _transfers: &mut Transfers,
    ) -> Result<Live, Error> {
        let Plain::Map(entries) = payload else {
            return Err(Error::Malformed("thrown payload".to_string()));
        };
        let mut name = None;
        let mut message = None;
        let mut stack = None;
        for (key, envelope) in entries {
            let Envelope::Plain(plain) = envelope else {
                return Err(Error::Malformed("thrown payload entry".to_string()));
            };
            match (key.as_str(), plain) {
                ("name", Plain::Text(text)) => name = Some(text),
                ("message", Plain::Text(text)) => message = Some(text),
                ("stack", Plain::Text(text)) => stack = Some(text),
                ("stack", Plain::Unit) => {}
                _ => return Err(Error::Malformed("thrown payload entry".to_string())),
            }
        }
        match (name, message) {
            (Some(name), Some(message)) => Ok(Live::Fault(Thrown {
                name,
                message,
                stack,
            })),
            _ => Err(Error::Malformed("thrown payload".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Wire;
    use crate::{
        envelope::{Envelope, Plain, Transferable},
        error::Error,
        live::{Live, Thrown},
        port::Port,
    };

    #[cfg(target_arch = "wasm32")]
    use wasm_bindgen_test::{wasm_bindgen_test, wasm_bindgen_test_configure};
    #[cfg(target_arch = "wasm32")]
    wasm_bindgen_test_configure!(run_in_browser);

    fn sample() -> Live {
        Live::map([
            ("n", Live::Int(42)),
            ("pi", Live::Float(3.5)),
            ("name", Live::from("troupe")),
            ("flag", Live::Bool(true)),
            ("nothing", Live::Unit),
            ("raw", Live::Bytes(vec![1, 2, 3])),
            (
                "nested",
                Live::list([Live::Int(1), Live::from("two"), Live::list([])]),
            ),
        ])
    }

    fn test_plain_round_trip_inner() {
        let wire = Wire::new();

        let expected = sample();
        let packet = wire.encode(sample()).unwrap();
        assert!(packet.transferables().is_empty());

        assert_eq!(wire.decode(packet).unwrap(), expected);
    }

    fn test_thrown_round_trip_inner() {
        let wire = Wire::new();

        let mut thrown = Thrown::new("Error", "boom");
        thrown.stack = Some("somewhere deep".to_string());

        let packet = wire.encode(Live::Fault(thrown.clone())).unwrap();
        assert!(matches!(
            packet.envelope,
            Envelope::Encoded { ref codec, .. } if codec == "thrown"
        ));

        assert_eq!(wire.decode(packet).unwrap(), Live::Fault(thrown));
    }

    fn test_port_transfer_inner() {
        let wire = Wire::new();

        let (left, right) = Port::in_process_pair();
        let packet = wire
            .encode(Live::map([("port", Live::Port(left)), ("n", Live::Int(1))]))
            .unwrap();
        assert_eq!(packet.transferables().len(), 1);

        let decoded = wire.decode(packet).unwrap();
        let Some(Live::Port(port)) = decoded.get("port") else {
            panic!("port did not survive the trip");
        };
        assert!(!port.is_closed());
        drop(right);
    }

    fn test_each_port_gets_its_own_slot_inner() {
        let wire = Wire::new();

        let (first, _keep_first) = Port::in_process_pair();
        let (second, _keep_second) = Port::in_process_pair();
        let packet = wire
            .encode(Live::list([Live::Port(first), Live::Port(second)]))
            .unwrap();
        assert_eq!(packet.transferables().len(), 2);

        let decoded = wire.decode(packet).unwrap();
        let ports = decoded.as_list().unwrap();
        assert!(matches!(ports[0], Live::Port(_)));
        assert!(matches!(ports[1], Live::Port(_)));
    }

    fn test_attach_inner() {
        let wire = Wire::new();

        let (extra, _keep) = Port::in_process_pair();
        let value = wire.transfer(Live::Int(7), vec![Transferable::Port(extra)]);

        let packet = wire.encode(value).unwrap();
        assert_eq!(packet.transferables().len(), 1);

        let Live::Attached { value, transfers } = wire.decode(packet).unwrap() else {
            panic!("attachment did not survive the trip");
        };
        assert_eq!(*value, Live::Int(7));
        assert_eq!(transfers.len(), 1);
    }

    fn test_unknown_codec_inner() {
        let wire = Wire::new();
        let empty = Wire::empty();

        let packet = wire.encode(Live::Fault(Thrown::new("Error", "boom"))).unwrap();
        assert_eq!(
            empty.decode(packet),
            Err(Error::UnknownCodec("thrown".to_string()))
        );
    }

    fn test_unencodable_inner() {
        let empty = Wire::empty();

        let (port, _keep) = Port::in_process_pair();
        assert_eq!(
            empty.encode(Live::Port(port)).unwrap_err(),
            Error::Unencodable("port")
        );
    }

    fn test_override_inner() {
        struct Negate;

        impl super::Codec for Negate {
            fn name(&self) -> &str {
                "thrown"
            }

            fn can_handle(&self, value: &Live) -> bool {
                matches!(value, Live::Fault(_))
            }

            fn encode(
                &self,
                _value: Live,
                _wire: &Wire,
                _transfers: &mut Vec<Transferable>,
            ) -> Result<Plain, Error> {
                Ok(Plain::Unit)
            }

            fn decode(
                &self,
                _payload: Plain,
                _wire: &Wire,
                _transfers: &mut crate::envelope::Transfers,
            ) -> Result<Live, Error> {
                Ok(Live::Unit)
            }
        }

        let wire = Wire::new();
        wire.register(Negate);

        let packet = wire.encode(Live::Fault(Thrown::new("Error", "gone"))).unwrap();
        assert_eq!(wire.decode(packet).unwrap(), Live::Unit);
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn test_plain_round_trip() {
        test_plain_round_trip_inner()
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn test_thrown_round_trip() {
        test_thrown_round_trip_inner()
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn test_port_transfer() {
        test_port_transfer_inner()
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn test_each_port_gets_its_own_slot() {
        test_each_port_gets_its_own_slot_inner()
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn test_attach() {
        test_attach_inner()
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn test_unknown_codec() {
        test_unknown_codec_inner()
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn test_unencodable() {
        test_unencodable_inner()
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn test_override() {
        test_override_inner()
    }

    #[cfg(target_arch = "wasm32")]
    #[wasm_bindgen_test]
    fn test_plain_round_trip() {
        test_plain_round_trip_inner()
    }

    #[cfg(target_arch = "wasm32")]
    #[wasm_bindgen_test]
    fn test_thrown_round_trip() {
        test_thrown_round_trip_inner()
    }

    #[cfg(target_arch = "wasm32")]
    #[wasm_bindgen_test]
    fn test_attach() {
        test_attach_inner()
    }
}
