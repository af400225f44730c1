//! The stage: actor runtime bound to one execution context.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt::{self, Debug},
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use troupe::{task, Channel, Live, Mailbox, Queue, Wire};
use uuid::Uuid;

use crate::{address::Address, error::StageError, packet::StagePacket};

/// Broadcast cycle breaker capacity: datagrams remembered per stage.
const SEEN_CAPACITY: usize = 1024;

/// Role of a link peer relative to this stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Parent,
    Child,
}

/// Actor lookup key: a stage-local alias or an actor id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Query {
    Name(String),
    Id(Uuid),
}

impl From<&str> for Query {
    fn from(name: &str) -> Self {
        Query::Name(name.to_string())
    }
}

impl From<String> for Query {
    fn from(name: String) -> Self {
        Query::Name(name)
    }
}

impl From<Uuid> for Query {
    fn from(id: Uuid) -> Self {
        Query::Id(id)
    }
}

/// Bounded set of datagrams already broadcast, keyed by
/// `(origin, seq)`; oldest entries are evicted first.
struct Seen {
    set: HashSet<(Uuid, u64)>,
    order: VecDeque<(Uuid, u64)>,
    capacity: usize,
}

impl Seen {
    fn new(capacity: usize) -> Self {
        Seen {
            set: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Record the key; returns `false` if it was already known.
    fn fresh(&mut self, key: (Uuid, u64)) -> bool {
        if !self.set.insert(key) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        true
    }
}

struct Link {
    role: Role,
    channel: Arc<Channel>,
}

struct Inner {
    id: Uuid,
    wire: Wire,
    /// Stage-local aliases.
    names: Mutex<HashMap<String, Uuid>>,
    /// Inboxes of actors living on this stage.
    actors: Mutex<HashMap<Uuid, Arc<Queue<Live>>>>,
    /// Resolved remote addresses. Never evicted; a stage whose peer
    /// went away keeps its stale entries.
    cache: Mutex<HashMap<Query, Address>>,
    links: Mutex<HashMap<Uuid, Link>>,
    parent: Mutex<Option<Uuid>>,
    ready: AtomicBool,
    inbox_queue: Arc<Queue<Live>>,
    inbox: Mailbox,
    seen: Mutex<Seen>,
    seq: AtomicU64,
}

/// The actor runtime of one execution context.
///
/// Stages link into a tree over channels, host actors addressed by
/// globally unique [`Address`], and route datagrams among them. Cheap
/// to clone; clones share the runtime.
#[derive(Clone)]
pub struct Stage {
    inner: Arc<Inner>,
}

static LIVE: OnceCell<Stage> = OnceCell::new();

impl Stage {
    /// Create a stage with its own fresh identity.
    pub fn new(wire: Wire) -> Self {
        let inbox_queue = Arc::new(Queue::new());
        let inbox = Mailbox::new(Channel::from_queue(inbox_queue.clone()));
        Stage {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                wire,
                names: Mutex::new(HashMap::new()),
                actors: Mutex::new(HashMap::new()),
                cache: Mutex::new(HashMap::new()),
                links: Mutex::new(HashMap::new()),
                parent: Mutex::new(None),
                ready: AtomicBool::new(false),
                inbox_queue,
                inbox,
                seen: Mutex::new(Seen::new(SEEN_CAPACITY)),
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// The process-wide stage.
    ///
    /// Created with a default wire on first use; every later call
    /// yields the same stage.
    pub fn live() -> &'static Stage {
        LIVE.get_or_init(|| Stage::new(Wire::new()))
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn wire(&self) -> &Wire {
        &self.inner.wire
    }

    /// Stage-level mailbox: protocol traffic that is not routing lands
    /// here.
    pub fn inbox(&self) -> &Mailbox {
        &self.inner.inbox
    }

    /// Linked peer stages and their roles.
    pub fn peers(&self) -> Vec<(Uuid, Role)> {
        self.inner
            .links
            .lock()
            .iter()
            .map(|(peer, link)| (*peer, link.role))
            .collect()
    }

    /// Link this stage to a peer over a channel.
    ///
    /// Identification packets are exchanged first: each side announces
    /// its stage id, and the first packet received must be such an
    /// announcement. A router task then consumes the channel for the
    /// life of the link.
    pub async fn adopt(&self, channel: Channel, role: Role) -> Result<Uuid, StageError> {
        if role == Role::Parent && self.inner.parent.lock().is_some() {
            return Err(StageError::Protocol(
                "stage already has a parent link".to_string(),
            ));
        }
        channel.send(
            StagePacket::Stage {
                stage: self.inner.id,
            }
            .into_live(),
        )?;
        let first = channel.recv().await?;
        let peer = match StagePacket::from_live(first) {
            Ok(StagePacket::Stage { stage }) => stage,
            _ => {
                channel.close();
                return Err(StageError::Protocol(
                    "first packet on a link must identify the peer stage".to_string(),
                ));
            }
        };
        let channel = Arc::new(channel);
        self.inner.links.lock().insert(
            peer,
            Link {
                role,
                channel: channel.clone(),
            },
        );
        if role == Role::Parent {
            *self.inner.parent.lock() = Some(peer);
        }
        task::spawn(route(self.inner.clone(), peer, channel));
        Ok(peer)
    }

    /// Spawn an actor.
    ///
    /// The body receives a reference to itself and its private
    /// mailbox; selective receive is [`Mailbox::take`]. The actor is
    /// unregistered when the body returns.
    pub fn spawn<F, Fut>(&self, body: F) -> ActorRef
    where
        F: FnOnce(ActorRef, Mailbox) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let queue = Arc::new(Queue::new());
        self.inner.actors.lock().insert(id, queue.clone());
        let actor = ActorRef {
            address: Address::new(id, self.inner.id),
            stage: self.clone(),
        };
        let mailbox = Mailbox::new(Channel::from_queue(queue));
        let future = body(actor.clone(), mailbox);
        let inner = self.inner.clone();
        task::spawn(async move {
            future.await;
            inner.actors.lock().remove(&id);
            inner.names.lock().retain(|_, actor| *actor != id);
        });
        actor
    }

    /// Spawn an actor and install a stage-local alias for it.
    ///
    /// Aliases are local; a remote lookup resolves them to
    /// fully-qualified addresses.
    pub fn register<F, Fut>(&self, name: &str, body: F) -> ActorRef
    where
        F: FnOnce(ActorRef, Mailbox) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let actor = self.spawn(body);
        self.inner
            .names
            .lock()
            .insert(name.to_string(), actor.address().actor);
        actor
    }

    /// Resolve an actor by alias or id.
    ///
    /// Local actors and cached resolutions answer immediately;
    /// otherwise every link is asked and the first reply wins (and is
    /// cached).
    pub async fn actor(&self, query: impl Into<Query>) -> Result<ActorRef, StageError> {
        let query = query.into();
        if let Some(address) = self.inner.resolve_local(&query) {
            return Ok(ActorRef {
                address,
                stage: self.clone(),
            });
        }
        let whois = match &query {
            Query::Name(name) => name.clone(),
            Query::Id(id) => id.to_string(),
        };
        let links: Vec<Arc<Channel>> = self
            .inner
            .links
            .lock()
            .values()
            .map(|link| link.channel.clone())
            .collect();
        if links.is_empty() {
            return Err(StageError::Unresolved(whois));
        }
        let id = Uuid::new_v4();
        let packet = StagePacket::Whois {
            whois: whois.clone(),
            id,
        }
        .into_live();
        for link in &links {
            let _ = link.send(packet.try_clone()?);
        }
        let expected = Live::from(id);
        let reply = self
            .inner
            .inbox
            .take(move |message| {
                message.get("kind").and_then(Live::as_str) == Some("actor")
                    && message.get("id") == Some(&expected)
            })
            .await
            .map_err(|_| StageError::Unresolved(whois.clone()))?;
        let address = match StagePacket::from_live(reply) {
            Ok(StagePacket::ActorIs { actor, .. }) => actor,
            _ => return Err(StageError::Unresolved(whois)),
        };
        self.inner.cache.lock().insert(query, address);
        Ok(ActorRef {
            address,
            stage: self.clone(),
        })
    }

    /// Send a datagram to an actor anywhere in the federation.
    ///
    /// Local addresses deliver directly (unknown local actors are an
    /// error); datagrams for a linked stage are forwarded on its link;
    /// everything else is broadcast, gated by the cycle breaker.
    pub fn send(&self, to: Address, message: Live) -> Result<(), StageError> {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        self.inner
            .route_send(None, self.inner.id, seq, to, message)
    }

    /// Mark the stage ready.
    ///
    /// The first call re-announces the stage on its parent link,
    /// signalling the spawner that boot has completed; later calls do
    /// nothing.
    pub fn ready(&self) -> Result<(), StageError> {
        if self.inner.ready.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let parent = *self.inner.parent.lock();
        if let Some(parent) = parent {
            let link = self
                .inner
                .links
                .lock()
                .get(&parent)
                .map(|link| link.channel.clone());
            if let Some(link) = link {
                link.send(
                    StagePacket::Stage {
                        stage: self.inner.id,
                    }
                    .into_live(),
                )?;
            }
        }
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    /// Wait until the given child stage announces readiness.
    pub async fn wait_ready(&self, stage: Uuid) -> Result<(), StageError> {
        let expected = Live::from(stage);
        self.inner
            .inbox
            .take(move |message| {
                message.get("kind").and_then(Live::as_str) == Some("stage")
                    && message.get("stage") == Some(&expected)
            })
            .await?;
        Ok(())
    }
}

impl Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stage({})", self.inner.id)
    }
}

impl Inner {
    fn resolve_local(&self, query: &Query) -> Option<Address> {
        match query {
            Query::Name(name) => self
                .names
                .lock()
                .get(name)
                .map(|actor| Address::new(*actor, self.id)),
            Query::Id(id) => {
                if self.actors.lock().contains_key(id) {
                    return Some(Address::new(*id, self.id));
                }
                self.cache.lock().get(query).copied()
            }
        }
    }

    /// Answer a lookup: aliases first, then known actors.
    fn lookup(&self, whois: &str) -> Option<Address> {
        if let Some(actor) = self.names.lock().get(whois) {
            return Some(Address::new(*actor, self.id));
        }
        if let Ok(id) = Uuid::parse_str(whois) {
            if self.actors.lock().contains_key(&id) {
                return Some(Address::new(id, self.id));
            }
            if let Some(address) = self.cache.lock().get(&Query::Id(id)) {
                return Some(*address);
            }
        }
        None
    }

    fn route_send(
        &self,
        arrived_on: Option<Uuid>,
        origin: Uuid,
        seq: u64,
        to: Address,
        message: Live,
    ) -> Result<(), StageError> {
        if to.stage == self.id {
            let actor = self.actors.lock().get(&to.actor).cloned();
            return match actor {
                Some(queue) => queue.push(message).map_err(|_| StageError::UnknownActor(to)),
                None => Err(StageError::UnknownActor(to)),
            };
        }
        let target = self
            .links
            .lock()
            .get(&to.stage)
            .map(|link| link.channel.clone());
        let packet = StagePacket::Send {
            origin,
            seq,
            to,
            message: Box::new(message),
        };
        if let Some(link) = target {
            return link.send(packet.into_live()).map_err(StageError::from);
        }
        // No route: broadcast to every link except the one the
        // datagram arrived on, at most once per (origin, seq).
        if !self.seen.lock().fresh((origin, seq)) {
            return Ok(());
        }
        let targets: Vec<Arc<Channel>> = self
            .links
            .lock()
            .iter()
            .filter(|(peer, _)| Some(**peer) != arrived_on)
            .map(|(_, link)| link.channel.clone())
            .collect();
        let value = packet.into_live();
        let mut remaining = targets.len();
        for link in targets {
            remaining -= 1;
            if remaining == 0 {
                let _ = link.send(value);
                break;
            }
            match value.try_clone() {
                Ok(copy) => {
                    let _ = link.send(copy);
                }
                Err(error) => {
                    // A capability payload cannot be duplicated into
                    // several links; it goes down this one.
                    tracing::warn!("datagram fan-out truncated: {error}");
                    let _ = link.send(value);
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Per-link router: consumes a link's channel for its whole life.
async fn route(stage: Arc<Inner>, from: Uuid, channel: Arc<Channel>) {
    loop {
        let message = match channel.recv().await {
            Ok(message) => message,
            Err(_) => break,
        };
        match StagePacket::from_live(message) {
            Ok(StagePacket::Whois { whois, id }) => {
                if let Some(actor) = stage.lookup(&whois) {
                    if channel
                        .send(StagePacket::ActorIs { id, actor }.into_live())
                        .is_err()
                    {
                        break;
                    }
                }
                // Unknown names draw no reply.
            }
            Ok(StagePacket::Send {
                origin,
                seq,
                to,
                message,
            }) => {
                if let Err(error) = stage.route_send(Some(from), origin, seq, to, *message) {
                    tracing::warn!("dropping datagram for {to}: {error}");
                }
            }
            Ok(packet @ (StagePacket::Stage { .. } | StagePacket::ActorIs { .. })) => {
                let _ = stage.inbox_queue.push(packet.into_live());
            }
            Ok(StagePacket::Other(value)) => {
                let _ = stage.inbox_queue.push(value);
            }
            Err(error) => {
                tracing::warn!("dropping malformed stage packet: {error}");
            }
        }
    }
    stage.links.lock().remove(&from);
    let mut parent = stage.parent.lock();
    if *parent == Some(from) {
        *parent = None;
    }
    drop(parent);
    tracing::debug!(stage = %stage.id, peer = %from, "link closed");
}

/// Handle to an actor, local or remote.
#[derive(Clone)]
pub struct ActorRef {
    address: Address,
    stage: Stage,
}

impl ActorRef {
    pub fn address(&self) -> Address {
        self.address
    }

    /// The stage this handle sends through.
    pub fn stage(&self) -> &Stage {
        &self.stage
    }

    /// Send a message to the actor.
    pub fn send(&self, message: Live) -> Result<(), StageError> {
        self.stage.send(self.address, message)
    }
}

impl Debug for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorRef({})", self.address)
    }
}
