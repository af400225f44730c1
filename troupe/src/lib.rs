//! Object-capability messaging fabric.
//!
//! Values cross boundaries through a pluggable [codec registry] that
//! promotes non-clonable things (functions, channels, marked objects)
//! into transparent [remote proxies]. [Channels] are ordered duplexes
//! of values over [ports]; [mailboxes] add Erlang-style selective
//! receive on top.
//!
//! [codec registry]: wire::Wire
//! [remote proxies]: remote::Proxy
//! [Channels]: channel::Channel
//! [ports]: port::Port
//! [mailboxes]: mailbox::Mailbox

pub mod channel;
pub mod envelope;
pub mod error;
pub mod live;
pub mod mailbox;
pub mod port;
pub mod queue;
pub mod remote;
pub mod task;
pub mod wire;

pub use channel::{Channel, Fanout, Select};
pub use envelope::{Envelope, Packet, Plain, Transferable, Transfers};
pub use error::{Error, RemoteError};
pub use live::{Live, NativeFn, Thrown};
pub use mailbox::Mailbox;
pub use port::{Port, PortLike};
pub use queue::Queue;
pub use remote::{spawn_handler, Proxy};
pub use wire::{Codec, Wire};
