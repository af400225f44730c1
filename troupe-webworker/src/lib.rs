//! Transport for communication with
//! [Web Workers](https://developer.mozilla.org/en-US/docs/Web/API/Web_Workers_API).
//!
//! A thin adapter: it turns a dedicated worker, a shared worker port
//! or the worker-side global scope into a [`PortLike`] the fabric can
//! drive. Packets are framed with a binary codec; port transferables
//! map onto the real `MessagePort` transfer list, so channels and
//! remote proxies cross the worker boundary intact.

use std::{
    any::Any,
    fmt::{self, Display},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use js_sys::Uint8Array;
use kodec::{Decode, Encode};
use serde::{Deserialize, Serialize};
use troupe::{Channel, Envelope, Error, Packet, Port, PortLike, Queue, Transferable, Wire};
use wasm_bindgen::{closure::Closure, JsCast, JsValue};
use web_sys::{
    Blob, BlobPropertyBag, DedicatedWorkerGlobalScope, EventTarget, MessageChannel, MessageEvent,
    MessagePort, SharedWorker, SharedWorkerGlobalScope, Url, Window, Worker,
};

/// Adapter failure while constructing a worker connection.
#[derive(Debug)]
pub struct WorkerError(String);

impl WorkerError {
    fn new(what: &str, value: JsValue) -> Self {
        WorkerError(format!("{what}: {value:?}"))
    }
}

impl Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for WorkerError {}

/// Kind of the current execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    /// A tab (window scope).
    Window,
    /// A dedicated worker.
    Dedicated,
    /// A shared worker.
    Shared,
    Unknown,
}

/// Identify the current execution context.
pub fn context() -> Context {
    let global = js_sys::global();
    if global.dyn_ref::<Window>().is_some() {
        Context::Window
    } else if global.dyn_ref::<DedicatedWorkerGlobalScope>().is_some() {
        Context::Dedicated
    } else if global.dyn_ref::<SharedWorkerGlobalScope>().is_some() {
        Context::Shared
    } else {
        Context::Unknown
    }
}

pub trait PostMessage {
    fn post_message_with_transfer(
        &self,
        message: &JsValue,
        transfer: &JsValue,
    ) -> Result<(), JsValue>;
}

impl PostMessage for Worker {
    fn post_message_with_transfer(
        &self,
        message: &JsValue,
        transfer: &JsValue,
    ) -> Result<(), JsValue> {
        Worker::post_message_with_transfer(self, message, transfer)
    }
}

impl PostMessage for DedicatedWorkerGlobalScope {
    fn post_message_with_transfer(
        &self,
        message: &JsValue,
        transfer: &JsValue,
    ) -> Result<(), JsValue> {
        DedicatedWorkerGlobalScope::post_message_with_transfer(self, message, transfer)
    }
}

impl PostMessage for MessagePort {
    fn post_message_with_transfer(
        &self,
        message: &JsValue,
        transfer: &JsValue,
    ) -> Result<(), JsValue> {
        MessagePort::post_message_with_transferable(self, message, transfer)
    }
}

enum Target {
    Worker(Worker),
    Scope(DedicatedWorkerGlobalScope),
    Port(MessagePort),
}

impl Target {
    fn event_target(&self) -> &EventTarget {
        match self {
            Target::Worker(worker) => worker.as_ref(),
            Target::Scope(scope) => scope.as_ref(),
            Target::Port(port) => port.as_ref(),
        }
    }

    fn post(&self, message: &JsValue, transfer: &JsValue) -> Result<(), JsValue> {
        match self {
            Target::Worker(worker) => worker.post_message_with_transfer(message, transfer),
            Target::Scope(scope) => scope.post_message_with_transfer(message, transfer),
            Target::Port(port) => port.post_message_with_transfer(message, transfer),
        }
    }
}

/// Wire frame crossing the `postMessage` boundary.
///
/// Buffer transferables ride in-band as lanes; each `Port` lane
/// consumes the next entry of the event's transferred port list.
#[derive(Debug, Serialize, Deserialize)]
enum Frame {
    Open,
    Payload { envelope: Envelope, lanes: Vec<Lane> },
    Close,
}

#[derive(Debug, Serialize, Deserialize)]
enum Lane {
    Port,
    Buffer(Vec<u8>),
}

struct Listener {
    target: EventTarget,
    name: &'static str,
    closure: Closure<dyn FnMut(MessageEvent)>,
}

impl Listener {
    fn new(
        target: &EventTarget,
        name: &'static str,
        handler: impl FnMut(MessageEvent) + 'static,
    ) -> Result<Self, WorkerError> {
        let closure = Closure::wrap(Box::new(handler) as Box<dyn FnMut(MessageEvent)>);
        target
            .add_event_listener_with_callback(name, closure.as_ref().unchecked_ref())
            .map_err(|error| WorkerError::new("cannot attach listener", error))?;
        Ok(Listener {
            target: target.clone(),
            name,
            closure,
        })
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let _ = self
            .target
            .remove_event_listener_with_callback(self.name, self.closure.as_ref().unchecked_ref());
    }
}

/// A [`PortLike`] over a `postMessage` target.
pub struct JsPort {
    target: Target,
    codec: kodec::binary::Codec,
    incoming: Arc<Queue<Packet>>,
    detached: AtomicBool,
    _message_listener: Listener,
    _message_error_listener: Listener,
}

// Worker execution contexts are single-threaded; these types never
// actually cross a thread.
unsafe impl Send for JsPort {}
unsafe impl Sync for JsPort {}

impl JsPort {
    fn attach(
        target: Target,
        codec: kodec::binary::Codec,
        opened: Option<Arc<Queue<()>>>,
    ) -> Result<Self, WorkerError> {
        let incoming = Arc::new(Queue::new());

        let incoming_clone = incoming.clone();
        let codec_clone = codec.clone();
        let message_listener =
            Listener::new(target.event_target(), "message", move |event: MessageEvent| {
                let bytes = Uint8Array::new(&event.data()).to_vec();
                let frame: Frame = match codec_clone.decode(&bytes[..]) {
                    Ok(frame) => frame,
                    Err(error) => {
                        tracing::warn!("dropping undecodable frame: {error:?}");
                        return;
                    }
                };
                match frame {
                    Frame::Open => {
                        if let Some(opened) = &opened {
                            let _ = opened.push(());
                        }
                    }
                    Frame::Payload { envelope, lanes } => {
                        let ports = event.ports();
                        let mut next_port = 0;
                        let mut transfers = Vec::with_capacity(lanes.len());
                        for lane in lanes {
                            match lane {
                                Lane::Buffer(bytes) => {
                                    transfers.push(Transferable::Buffer(bytes));
                                }
                                Lane::Port => {
                                    let Ok(port) =
                                        ports.get(next_port).dyn_into::<MessagePort>()
                                    else {
                                        tracing::warn!("frame lane without a transferred port");
                                        return;
                                    };
                                    next_port += 1;
                                    match JsPort::from_message_port(port, codec_clone.clone()) {
                                        Ok(port) => {
                                            transfers.push(Transferable::Port(Port::new(port)));
                                        }
                                        Err(error) => {
                                            tracing::warn!("cannot adopt transferred port: {error}");
                                            return;
                                        }
                                    }
                                }
                            }
                        }
                        let _ = incoming_clone.push(Packet {
                            envelope,
                            transfers,
                        });
                    }
                    Frame::Close => incoming_clone.close(),
                }
            })?;
        let message_error_listener = Listener::new(
            target.event_target(),
            "messageerror",
            move |_event: MessageEvent| {
                tracing::warn!("message could not be deserialized by the browser");
            },
        )?;

        if let Target::Port(port) = &target {
            port.start();
        }

        Ok(JsPort {
            target,
            codec,
            incoming,
            detached: AtomicBool::new(false),
            _message_listener: message_listener,
            _message_error_listener: message_error_listener,
        })
    }

    /// Wrap a raw `MessagePort` (freshly created or just transferred
    /// in) into a fabric port.
    pub fn from_message_port(
        port: MessagePort,
        codec: kodec::binary::Codec,
    ) -> Result<Self, WorkerError> {
        JsPort::attach(Target::Port(port), codec, None)
    }

    fn send_frame(&self, frame: Frame, transfer: &js_sys::Array) -> Result<(), Error> {
        let mut buffer = Vec::new();
        self.codec
            .encode(&mut buffer, &frame)
            .map_err(|error| Error::Malformed(format!("frame encoding: {error:?}")))?;
        let bytes = Uint8Array::from(&buffer[..]);
        self.target
            .post(&bytes, transfer)
            .map_err(|_| Error::Closed)
    }

    /// Extract the raw `MessagePort` for transfer, neutralizing this
    /// wrapper.
    fn into_raw(self) -> Result<MessagePort, Error> {
        let Target::Port(port) = &self.target else {
            return Err(Error::Unsupported(
                "only message ports can cross a process boundary",
            ));
        };
        let port = port.clone();
        self.detached.store(true, Ordering::Relaxed);
        Ok(port)
    }
}

#[async_trait]
impl PortLike for JsPort {
    fn post(&self, packet: Packet) -> Result<(), Error> {
        if self.incoming.is_closed() {
            return Err(Error::Closed);
        }
        let transfer = js_sys::Array::new();
        let mut lanes = Vec::with_capacity(packet.transfers.len());
        for transferable in packet.transfers {
            match transferable {
                Transferable::Buffer(bytes) => lanes.push(Lane::Buffer(bytes)),
                Transferable::Port(port) => {
                    let port = port
                        .into_inner()
                        .into_any()
                        .downcast::<JsPort>()
                        .map_err(|_| {
                            Error::Unsupported("in-process port across a process boundary")
                        })?;
                    transfer.push(&(*port).into_raw()?.into());
                    lanes.push(Lane::Port);
                }
            }
        }
        self.send_frame(
            Frame::Payload {
                envelope: packet.envelope,
                lanes,
            },
            &transfer,
        )
    }

    async fn recv(&self) -> Result<Packet, Error> {
        self.incoming.pop().await
    }

    fn close(&self) {
        if !self.incoming.is_closed() {
            let _ = self.send_frame(Frame::Close, &js_sys::Array::new());
        }
        self.incoming.close();
    }

    fn is_closed(&self) -> bool {
        self.incoming.is_closed()
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

impl Drop for JsPort {
    fn drop(&mut self) {
        if !self.detached.load(Ordering::Relaxed) && !self.incoming.is_closed() {
            let _ = self.send_frame(Frame::Close, &js_sys::Array::new());
            self.incoming.close();
        }
    }
}

/// Make [`troupe::Port::pair`] produce `MessageChannel`-backed pairs,
/// so fabric-created ports can cross worker boundaries. Installed by
/// every connection constructor; calling it again does nothing.
pub fn use_message_channels() {
    Port::install_pair_factory(|| {
        let channel = MessageChannel::new().expect("MessageChannel is unavailable");
        let codec = kodec::binary::Codec::default();
        let left = JsPort::from_message_port(channel.port1(), codec.clone())
            .expect("cannot wrap message port");
        let right =
            JsPort::from_message_port(channel.port2(), codec).expect("cannot wrap message port");
        (Port::new(left), Port::new(right))
    });
}

/// Open handshake, then hand the connection out as a channel.
async fn connect(target: Target, wire: Wire, announce_first: bool) -> Result<Channel, WorkerError> {
    use_message_channels();
    let opened = Arc::new(Queue::new());
    let port = JsPort::attach(
        target,
        kodec::binary::Codec::default(),
        Some(opened.clone()),
    )?;

    let empty = js_sys::Array::new();
    if announce_first {
        port.send_frame(Frame::Open, &empty)
            .map_err(|error| WorkerError(format!("open announcement failed: {error}")))?;
        let _ = opened.pop().await;
    } else {
        let _ = opened.pop().await;
        port.send_frame(Frame::Open, &empty)
            .map_err(|error| WorkerError(format!("open announcement failed: {error}")))?;
    }

    Ok(Channel::new(Port::new(port), wire))
}

/// Spawn a dedicated worker from a script URL and open a channel to it.
pub async fn dedicated(url: &str, wire: &Wire) -> Result<Channel, WorkerError> {
    let worker =
        Worker::new(url).map_err(|error| WorkerError::new("cannot construct worker", error))?;
    connect(Target::Worker(worker), wire.clone(), false).await
}

/// Spawn a dedicated worker from inline script source.
pub async fn dedicated_from_source(source: &str, wire: &Wire) -> Result<Channel, WorkerError> {
    let parts = js_sys::Array::of1(&JsValue::from_str(source));
    let mut options = BlobPropertyBag::new();
    options.type_("application/javascript");
    let blob = Blob::new_with_str_sequence_and_options(&parts, &options)
        .map_err(|error| WorkerError::new("cannot build source blob", error))?;
    let url = Url::create_object_url_with_blob(&blob)
        .map_err(|error| WorkerError::new("cannot build source url", error))?;
    dedicated(&url, wire).await
}

/// Connect to a shared worker from a script URL.
pub async fn shared(url: &str, wire: &Wire) -> Result<Channel, WorkerError> {
    let worker = SharedWorker::new(url)
        .map_err(|error| WorkerError::new("cannot construct shared worker", error))?;
    connect(Target::Port(worker.port()), wire.clone(), false).await
}

/// Open a channel to the spawning context.
///
/// Call from inside a dedicated worker; panics outside worker scope.
pub async fn parent(wire: &Wire) -> Result<Channel, WorkerError> {
    let scope = js_sys::global()
        .dyn_into::<DedicatedWorkerGlobalScope>()
        .expect("not inside a dedicated worker");
    connect(Target::Scope(scope), wire.clone(), true).await
}

/// Adopt one connection of a shared worker.
///
/// Call from inside a shared worker's `connect` handler with the
/// event's port.
pub async fn accept(port: MessagePort, wire: &Wire) -> Result<Channel, WorkerError> {
    connect(Target::Port(port), wire.clone(), true).await
}
