//! Remote-value protocol: transparent operation on values living on
//! the other side of a boundary.
//!
//! A handler runs beside the real value and executes reflective
//! operations against it; a proxy on the other side synthesizes
//! requests and selectively receives the matching responses. Only
//! functions and explicitly [marked] values are promoted; plain data
//! is cloned as usual.
//!
//! [marked]: crate::live::Live::marked

use std::{
    fmt::{self, Debug},
    sync::atomic::{AtomicU64, Ordering},
};

use uuid::Uuid;

use crate::{
    channel::Channel,
    envelope::{Envelope, Plain, Transferable, Transfers},
    error::{Error, RemoteError},
    live::{Live, Thrown},
    mailbox::Mailbox,
    port::Port,
    task,
    wire::{Codec, Wire},
};

enum Op {
    Get(String),
    Set(String, Live),
    Delete(String),
    Apply(Vec<Live>),
    Construct(Vec<Live>),
}

struct Request {
    id: Uuid,
    seq: u64,
    op: Op,
}

impl Request {
    fn into_live(self) -> Live {
        let mut entries = vec![
            ("id".to_string(), Live::from(self.id)),
            ("seq".to_string(), Live::Int(self.seq as i64)),
        ];
        match self.op {
            Op::Get(key) => {
                entries.push(("op".to_string(), Live::from("get")));
                entries.push(("key".to_string(), Live::Text(key)));
            }
            Op::Set(key, value) => {
                entries.push(("op".to_string(), Live::from("set")));
                entries.push(("key".to_string(), Live::Text(key)));
                entries.push(("value".to_string(), value));
            }
            Op::Delete(key) => {
                entries.push(("op".to_string(), Live::from("delete")));
                entries.push(("key".to_string(), Live::Text(key)));
            }
            Op::Apply(args) => {
                entries.push(("op".to_string(), Live::from("apply")));
                entries.push(("args".to_string(), Live::List(args)));
            }
            Op::Construct(args) => {
                entries.push(("op".to_string(), Live::from("construct")));
                entries.push(("args".to_string(), Live::List(args)));
            }
        }
        Live::map(entries)
    }

    fn from_live(mut message: Live) -> Result<Request, Error> {
        let id = message
            .get("id")
            .and_then(Live::as_str)
            .and_then(|id| Uuid::parse_str(id).ok())
            .ok_or_else(|| Error::Malformed("request id".to_string()))?;
        let seq = message
            .get("seq")
            .and_then(Live::as_int)
            .ok_or_else(|| Error::Malformed("request sequence".to_string()))?
            as u64;
        let op = message
            .get("op")
            .and_then(Live::as_str)
            .ok_or_else(|| Error::Malformed("request operation".to_string()))?
            .to_string();
        fn property(message: &Live) -> Result<String, Error> {
            message
                .get("key")
                .and_then(Live::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::Malformed("request key".to_string()))
        }
        let op = match op.as_str() {
            "get" => Op::Get(property(&message)?),
            "delete" => Op::Delete(property(&message)?),
            "set" => {
                let property = property(&message)?;
                let value = message
                    .take("value")
                    .ok_or_else(|| Error::Malformed("request value".to_string()))?;
                Op::Set(property, value)
            }
            "apply" | "construct" => {
                let args = message
                    .take("args")
                    .and_then(Live::into_list)
                    .ok_or_else(|| Error::Malformed("request arguments".to_string()))?;
                if op == "apply" {
                    Op::Apply(args)
                } else {
                    Op::Construct(args)
                }
            }
            _ => return Err(Error::Malformed(format!("request operation `{op}`"))),
        };
        Ok(Request { id, seq, op })
    }
}

fn response(id: Uuid, seq: u64, outcome: Result<Live, Thrown>) -> Live {
    let mut entries = vec![
        ("id".to_string(), Live::from(id)),
        ("seq".to_string(), Live::Int(seq as i64)),
    ];
    match outcome {
        Ok(value) => entries.push(("ok".to_string(), value)),
        Err(thrown) => entries.push(("err".to_string(), Live::Fault(thrown))),
    }
    Live::map(entries)
}

/// Execute one reflective operation against the subject.
fn perform(subject: &mut Live, op: Op) -> Result<Live, Thrown> {
    match op {
        Op::Get(key) => match subject {
            Live::Map(map) => map
                .get(&key)
                .ok_or_else(|| Thrown::new("TypeError", format!("no property `{key}`")))?
                .try_clone()
                .map_err(|_| {
                    Thrown::new("TypeError", format!("property `{key}` cannot leave its side"))
                }),
            _ => Err(Thrown::new(
                "TypeError",
                format!("{} value has no properties", subject.kind()),
            )),
        },
        Op::Set(key, value) => match subject {
            Live::Map(map) => {
                map.insert(key, value);
                Ok(Live::Unit)
            }
            _ => Err(Thrown::new(
                "TypeError",
                format!("{} value has no properties", subject.kind()),
            )),
        },
        Op::Delete(key) => match subject {
            Live::Map(map) => {
                map.remove(&key);
                Ok(Live::Unit)
            }
            _ => Err(Thrown::new(
                "TypeError",
                format!("{} value has no properties", subject.kind()),
            )),
        },
        Op::Apply(args) | Op::Construct(args) => match subject {
            Live::Func(function) => function(args),
            _ => Err(Thrown::new(
                "TypeError",
                format!("{} value is not callable", subject.kind()),
            )),
        },
    }
}

/// Run a handler for `value` over the given channel.
///
/// The handler executes every incoming operation against the value and
/// responds on the same channel; operation failures are answered as
/// faults and the loop continues. The loop ends when the channel
/// closes.
pub fn spawn_handler(value: Live, channel: Channel) {
    task::spawn(async move {
        handle(value, channel).await;
    });
}

async fn handle(mut subject: Live, channel: Channel) {
    loop {
        let message = match channel.recv().await {
            Ok(message) => message,
            Err(_) => break,
        };
        let reply = match Request::from_live(message) {
            Ok(request) => {
                let outcome = perform(&mut subject, request.op);
                response(request.id, request.seq, outcome)
            }
            Err(error) => {
                tracing::debug!("dropping malformed remote request: {error}");
                continue;
            }
        };
        if channel.send(reply).is_err() {
            break;
        }
    }
}

/// Proxy to a value owned by the far side.
///
/// Every operation is executed against the real value by its handler;
/// a fault raised there re-throws here as [`RemoteError::Thrown`].
/// Ownership is explicit: [close] drops this half of the conversation,
/// and with it the handler.
///
/// [close]: Proxy::close
pub struct Proxy {
    mailbox: Mailbox,
    id: Uuid,
    seq: AtomicU64,
}

impl Proxy {
    pub(crate) fn new(channel: Channel, id: Uuid) -> Self {
        Proxy {
            mailbox: Mailbox::new(channel),
            id,
            seq: AtomicU64::new(0),
        }
    }

    /// Identity of the remote conversation.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Read a property of the remote value.
    pub async fn get(&self, key: &str) -> Result<Live, RemoteError> {
        self.request(Op::Get(key.to_string())).await
    }

    /// Assign a property of the remote value.
    pub async fn set(&self, key: &str, value: Live) -> Result<(), RemoteError> {
        self.request(Op::Set(key.to_string(), value)).await?;
        Ok(())
    }

    /// Delete a property of the remote value.
    pub async fn delete(&self, key: &str) -> Result<(), RemoteError> {
        self.request(Op::Delete(key.to_string())).await?;
        Ok(())
    }

    /// Call the remote value.
    pub async fn call(&self, args: Vec<Live>) -> Result<Live, RemoteError> {
        self.request(Op::Apply(args)).await
    }

    /// Construct through the remote value.
    pub async fn construct(&self, args: Vec<Live>) -> Result<Live, RemoteError> {
        self.request(Op::Construct(args)).await
    }

    async fn request(&self, op: Op) -> Result<Live, RemoteError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let request = Request {
            id: self.id,
            seq,
            op,
        };
        self.mailbox.send(request.into_live())?;
        let expected_id = Live::from(self.id);
        let expected_seq = Live::Int(seq as i64);
        let mut reply = self
            .mailbox
            .take(move |message| {
                message.get("id") == Some(&expected_id)
                    && message.get("seq") == Some(&expected_seq)
            })
            .await?;
        if let Some(value) = reply.take("ok") {
            return Ok(value);
        }
        match reply.take("err") {
            Some(Live::Fault(thrown)) => Err(RemoteError::Thrown(thrown)),
            _ => Err(RemoteError::Malformed("response".to_string())),
        }
    }

    /// Close both halves of the conversation.
    pub fn close(&self) {
        self.mailbox.close();
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }
}

impl Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Proxy({})", self.id)
    }
}

/// Codec promoting callables and marked values into remote proxies.
///
/// Encoding spawns a handler beside the value over a fresh port pair
/// and transfers the peer half; decoding wraps the received port into
/// a proxy. A value returned by a remote operation goes through the
/// wire again, so marked results compose into proxies of their own.
pub(crate) struct RemoteCodec;

impl Codec for RemoteCodec {
    fn name(&self) -> &str {
        "remote"
    }

    fn can_handle(&self, value: &Live) -> bool {
        matches!(value, Live::Func(_) | Live::Marked(_))
    }

    fn encode(
        &self,
        value: Live,
        wire: &Wire,
        transfers: &mut Vec<Transferable>,
    ) -> Result<Plain, Error> {
        let subject = match value {
            Live::Marked(inner) => *inner,
            other => other,
        };
        let id = Uuid::new_v4();
        let (ours, theirs) = Port::pair();
        spawn_handler(subject, Channel::new(ours, wire.clone()));
        let index = transfers.len() as i64;
        transfers.push(Transferable::Port(theirs));
        Ok(Plain::Map(vec![
            (
                "id".to_string(),
                Envelope::Plain(Plain::Text(id.to_string())),
            ),
            ("port".to_string(), Envelope::Plain(Plain::Int(index))),
        ]))
    }

    fn decode(
        &self,
        payload: Plain,
        wire: &Wire,
        transfers: &mut Transfers,
    ) -> Result<Live, Error> {
        let Plain::Map(entries) = payload else {
            return Err(Error::Malformed("remote payload".to_string()));
        };
        let mut id = None;
        let mut port = None;
        for (key, envelope) in entries {
            match (key.as_str(), envelope) {
                ("id", Envelope::Plain(Plain::Text(text))) => {
                    id = Uuid::parse_str(&text).ok();
                }
                ("port", Envelope::Plain(Plain::Int(index))) => {
                    match transfers.take(index as usize)? {
                        Transferable::Port(received) => port = Some(received),
                        Transferable::Buffer(_) => {
                            return Err(Error::Malformed("remote port slot".to_string()))
                        }
                    }
                }
                _ => return Err(Error::Malformed("remote payload entry".to_string())),
            }
        }
        match (id, port) {
            (Some(id), Some(port)) => Ok(Live::Remote(Proxy::new(
                Channel::new(port, wire.clone()),
                id,
            ))),
            _ => Err(Error::Malformed("remote payload".to_string())),
        }
    }
}
