//! Protocol spoken between linked stages.

use troupe::{Error, Live};
use uuid::Uuid;

use crate::address::Address;

/// A stage-to-stage protocol message.
///
/// Four kinds travel between stages: identification, name lookup,
/// lookup reply and the actor datagram. Anything else is stage-level
/// request/response traffic and lands in the stage's own mailbox.
#[derive(Debug)]
pub enum StagePacket {
    /// Link identification; re-sent on the parent link when the stage
    /// becomes ready.
    Stage { stage: Uuid },
    /// Lookup of an actor by local alias or actor id.
    Whois { whois: String, id: Uuid },
    /// Lookup reply.
    ActorIs { id: Uuid, actor: Address },
    /// Actor-to-actor datagram. `origin` and `seq` stamp the datagram
    /// for broadcast cycle breaking.
    Send {
        origin: Uuid,
        seq: u64,
        to: Address,
        message: Box<Live>,
    },
    /// Not part of the routing protocol.
    Other(Live),
}

impl StagePacket {
    pub fn into_live(self) -> Live {
        match self {
            StagePacket::Stage { stage } => Live::map([
                ("kind", Live::from("stage")),
                ("stage", Live::from(stage)),
            ]),
            StagePacket::Whois { whois, id } => Live::map([
                ("kind", Live::from("whois")),
                ("whois", Live::Text(whois)),
                ("id", Live::from(id)),
            ]),
            StagePacket::ActorIs { id, actor } => Live::map([
                ("kind", Live::from("actor")),
                ("id", Live::from(id)),
                ("actor", actor.to_live()),
            ]),
            StagePacket::Send {
                origin,
                seq,
                to,
                message,
            } => Live::map([
                ("kind", Live::from("send")),
                ("origin", Live::from(origin)),
                ("seq", Live::Int(seq as i64)),
                ("to", to.to_live()),
                ("message", *message),
            ]),
            StagePacket::Other(value) => value,
        }
    }

    pub fn from_live(mut value: Live) -> Result<StagePacket, Error> {
        let kind = match value.get("kind").and_then(Live::as_str) {
            Some(kind) => kind.to_string(),
            None => return Ok(StagePacket::Other(value)),
        };
        match kind.as_str() {
            "stage" => {
                let stage = uuid_field(&value, "stage")?;
                Ok(StagePacket::Stage { stage })
            }
            "whois" => {
                let whois = value
                    .get("whois")
                    .and_then(Live::as_str)
                    .ok_or_else(|| Error::Malformed("whois packet".to_string()))?
                    .to_string();
                let id = uuid_field(&value, "id")?;
                Ok(StagePacket::Whois { whois, id })
            }
            "actor" => {
                let id = uuid_field(&value, "id")?;
                let actor = value
                    .get("actor")
                    .and_then(Address::from_live)
                    .ok_or_else(|| Error::Malformed("actor packet".to_string()))?;
                Ok(StagePacket::ActorIs { id, actor })
            }
            "send" => {
                let origin = uuid_field(&value, "origin")?;
                let seq = value
                    .get("seq")
                    .and_then(Live::as_int)
                    .ok_or_else(|| Error::Malformed("send packet".to_string()))?
                    as u64;
                let to = value
                    .get("to")
                    .and_then(Address::from_live)
                    .ok_or_else(|| Error::Malformed("send packet".to_string()))?;
                let message = value
                    .take("message")
                    .ok_or_else(|| Error::Malformed("send packet".to_string()))?;
                Ok(StagePacket::Send {
                    origin,
                    seq,
                    to,
                    message: Box::new(message),
                })
            }
            _ => Ok(StagePacket::Other(value)),
        }
    }
}

fn uuid_field(value: &Live, key: &str) -> Result<Uuid, Error> {
    value
        .get(key)
        .and_then(Live::as_str)
        .and_then(|text| Uuid::parse_str(text).ok())
        .ok_or_else(|| Error::Malformed(format!("{key} field")))
}

#[cfg(test)]
mod tests {
    use troupe::Live;
    use uuid::Uuid;

    use crate::address::Address;

    use super::StagePacket;

    #[test]
    fn test_send_round_trip() {
        let to = Address::new(Uuid::new_v4(), Uuid::new_v4());
        let origin = Uuid::new_v4();
        let packet = StagePacket::Send {
            origin,
            seq: 3,
            to,
            message: Box::new(Live::from("payload")),
        };

        let parsed = StagePacket::from_live(packet.into_live()).unwrap();
        let StagePacket::Send {
            origin: parsed_origin,
            seq,
            to: parsed_to,
            message,
        } = parsed
        else {
            panic!("wrong packet kind");
        };
        assert_eq!(parsed_origin, origin);
        assert_eq!(seq, 3);
        assert_eq!(parsed_to, to);
        assert_eq!(*message, Live::from("payload"));
    }

    #[test]
    fn test_unknown_kind_is_other() {
        let value = Live::map([("kind", Live::from("greeting"))]);
        assert!(matches!(
            StagePacket::from_live(value).unwrap(),
            StagePacket::Other(_)
        ));
    }

    #[test]
    fn test_plain_value_is_other() {
        assert!(matches!(
            StagePacket::from_live(Live::Int(5)).unwrap(),
            StagePacket::Other(_)
        ));
    }
}
