//! Stage and actor runtime for the troupe messaging fabric.
//!
//! A [`Stage`] is the actor runtime of one execution context. Stages
//! link into a tree over [channels], host actors addressed by globally
//! unique [`Address`], and route datagrams among them: locally by
//! direct delivery, to linked stages by forwarding, and everywhere
//! else by cycle-checked broadcast.
//!
//! ```ignore
//! let stage = Stage::new(Wire::new());
//! stage.adopt(channel_to_parent, Role::Parent).await?;
//!
//! stage.register("add", |me, mailbox| async move {
//!     while let Ok(mut request) = mailbox.recv().await {
//!         let a = request.get("a").and_then(Live::as_int).unwrap_or(0);
//!         let b = request.get("b").and_then(Live::as_int).unwrap_or(0);
//!         if let Some(from) = request.take("from").as_ref().and_then(Address::from_live) {
//!             let _ = me.stage().send(from, Live::map([("sum", Live::Int(a + b))]));
//!         }
//!     }
//! });
//! stage.ready()?;
//! ```
//!
//! [channels]: troupe::Channel

pub mod address;
pub mod error;
pub mod packet;
pub mod stage;

pub use address::Address;
pub use error::StageError;
pub use packet::StagePacket;
pub use stage::{ActorRef, Query, Role, Stage};
