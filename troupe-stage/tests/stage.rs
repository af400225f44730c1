use std::time::Duration;

use futures::future::join;
use tokio::time::timeout;
use troupe::{Channel, Live, Wire};
use troupe_stage::{Address, Query, Role, Stage, StageError, StagePacket};
use uuid::Uuid;

/// Link two stages over an in-process channel pair.
async fn link(parent: &Stage, child: &Stage, wire: &Wire) {
    let (up, down) = Channel::pair(wire);
    let (parent_side, child_side) = join(
        parent.adopt(up, Role::Child),
        child.adopt(down, Role::Parent),
    )
    .await;
    assert_eq!(parent_side.unwrap(), child.id());
    assert_eq!(child_side.unwrap(), parent.id());
}

/// Pose as a stage on the raw protocol: handshake by hand and return
/// the probe's channel half.
async fn probe(stage: &Stage, wire: &Wire) -> (Uuid, Channel) {
    let id = Uuid::new_v4();
    let (ours, theirs) = Channel::pair(wire);
    let (adopted, ()) = join(stage.adopt(theirs, Role::Child), async {
        ours.send(StagePacket::Stage { stage: id }.into_live())
            .unwrap();
    })
    .await;
    assert_eq!(adopted.unwrap(), id);
    // The stage's own identification packet.
    let first = ours.recv().await.unwrap();
    assert_eq!(
        first.get("kind").and_then(Live::as_str),
        Some("stage")
    );
    (id, ours)
}

#[tokio::test]
async fn test_register_resolve_deliver() {
    let wire = Wire::new();
    let parent = Stage::new(wire.clone());
    let child = Stage::new(wire.clone());
    link(&parent, &child, &wire).await;

    child.register("add", |me, mailbox| async move {
        while let Ok(mut request) = mailbox.recv().await {
            let reply_to = request
                .take("from")
                .as_ref()
                .and_then(Address::from_live);
            let a = request.get("a").and_then(Live::as_int).unwrap_or(0);
            let b = request.get("b").and_then(Live::as_int).unwrap_or(0);
            if let Some(reply_to) = reply_to {
                let _ = me
                    .stage()
                    .send(reply_to, Live::map([("sum", Live::Int(a + b))]));
            }
        }
    });

    let adder = parent.actor("add").await.unwrap();
    assert_eq!(adder.address().stage, child.id());

    let (reply_in, reply_out) = tokio::sync::oneshot::channel();
    let requester = parent.spawn(move |_me, mailbox| async move {
        let reply = mailbox.recv().await.unwrap();
        let _ = reply_in.send(reply);
    });

    adder
        .send(Live::map([
            ("from", requester.address().to_live()),
            ("a", Live::Int(2)),
            ("b", Live::Int(40)),
        ]))
        .unwrap();

    let reply = reply_out.await.unwrap();
    assert_eq!(reply.get("sum"), Some(&Live::Int(42)));
}

#[tokio::test]
async fn test_resolve_by_id() {
    let wire = Wire::new();
    let parent = Stage::new(wire.clone());
    let child = Stage::new(wire.clone());
    link(&parent, &child, &wire).await;

    let actor = child.spawn(|_me, mailbox| async move {
        while mailbox.recv().await.is_ok() {}
    });

    let resolved = parent.actor(actor.address().actor).await.unwrap();
    assert_eq!(resolved.address(), actor.address());

    // Second resolution answers from the cache, without any link.
    let cached = parent
        .actor(Query::Id(actor.address().actor))
        .await
        .unwrap();
    assert_eq!(cached.address(), actor.address());
}

#[tokio::test]
async fn test_unresolved_name() {
    let wire = Wire::new();
    let parent = Stage::new(wire.clone());
    let child = Stage::new(wire.clone());
    link(&parent, &child, &wire).await;

    // The lookup draws no reply; it only fails once the links close.
    let lookup = parent.actor("nobody");
    let links: Vec<_> = parent.peers();
    assert_eq!(links.len(), 1);
    let pending = timeout(Duration::from_millis(100), lookup).await;
    assert!(pending.is_err());
}

#[tokio::test]
async fn test_unknown_local_actor() {
    let wire = Wire::new();
    let stage = Stage::new(wire);

    let ghost = Address::new(Uuid::new_v4(), stage.id());
    assert!(matches!(
        stage.send(ghost, Live::Unit),
        Err(StageError::UnknownActor(_))
    ));
}

#[tokio::test]
async fn test_actor_unregisters_on_exit() {
    let wire = Wire::new();
    let stage = Stage::new(wire);

    let actor = stage.register("once", |_me, mailbox| async move {
        let _ = mailbox.recv().await;
    });

    actor.send(Live::Unit).unwrap();

    // The actor disappears from the stage once its body returns.
    let mut gone = false;
    for _ in 0..100 {
        tokio::task::yield_now().await;
        if matches!(actor.send(Live::Unit), Err(StageError::UnknownActor(_))) {
            gone = true;
            break;
        }
    }
    assert!(gone);
}

#[tokio::test]
async fn test_handshake_violation() {
    let wire = Wire::new();
    let stage = Stage::new(wire.clone());

    let (ours, theirs) = Channel::pair(&wire);
    ours.send(Live::from("garbage")).unwrap();

    assert!(matches!(
        stage.adopt(theirs, Role::Child).await,
        Err(StageError::Protocol(_))
    ));
}

#[tokio::test]
async fn test_single_parent() {
    let wire = Wire::new();
    let root = Stage::new(wire.clone());
    let middle = Stage::new(wire.clone());
    let leaf = Stage::new(wire.clone());

    link(&root, &middle, &wire).await;

    let (up, _down) = Channel::pair(&wire);
    assert!(matches!(
        middle.adopt(up, Role::Parent).await,
        Err(StageError::Protocol(_))
    ));

    // A child link is still fine.
    link(&middle, &leaf, &wire).await;
}

#[tokio::test]
async fn test_ready_notifies_parent_once() {
    let wire = Wire::new();
    let parent = Stage::new(wire.clone());
    let child = Stage::new(wire.clone());
    link(&parent, &child, &wire).await;

    assert!(!child.is_ready());
    child.ready().unwrap();
    child.ready().unwrap();
    assert!(child.is_ready());

    parent.wait_ready(child.id()).await.unwrap();

    // The duplicate mark produced no second announcement.
    let again = timeout(Duration::from_millis(100), parent.wait_ready(child.id())).await;
    assert!(again.is_err());
}

#[tokio::test]
async fn test_broadcast_chain_no_reemission() {
    let wire = Wire::new();
    let s1 = Stage::new(wire.clone());
    let s2 = Stage::new(wire.clone());
    let s3 = Stage::new(wire.clone());
    link(&s1, &s2, &wire).await;
    link(&s2, &s3, &wire).await;

    let (origin, p1) = probe(&s1, &wire).await;
    let (_p2_id, p2) = probe(&s3, &wire).await;

    // A datagram for a stage nobody knows: broadcast all the way down.
    let ghost = Address::new(Uuid::new_v4(), Uuid::new_v4());
    let datagram = |seq: u64| {
        StagePacket::Send {
            origin,
            seq,
            to: ghost,
            message: Box::new(Live::from("wandering")),
        }
        .into_live()
    };

    p1.send(datagram(7)).unwrap();

    // It reaches the far probe exactly once.
    let seen = timeout(Duration::from_millis(200), p2.recv())
        .await
        .expect("datagram never crossed the chain")
        .unwrap();
    assert_eq!(seen.get("kind").and_then(Live::as_str), Some("send"));
    assert_eq!(seen.get("seq").and_then(Live::as_int), Some(7));

    // A duplicate is dropped at the first stage that saw it.
    p1.send(datagram(7)).unwrap();
    assert!(timeout(Duration::from_millis(100), p2.recv()).await.is_err());

    // Nothing was ever re-emitted onto the origin link.
    assert!(timeout(Duration::from_millis(100), p1.recv()).await.is_err());
}

#[tokio::test]
async fn test_capability_datagram_fans_out_down_one_link() {
    let wire = Wire::new();
    let stage = Stage::new(wire.clone());
    let (_a_id, probe_a) = probe(&stage, &wire).await;
    let (_b_id, probe_b) = probe(&stage, &wire).await;

    // A channel payload cannot be duplicated, so the broadcast
    // degrades to a single link instead of dropping the only copy.
    let ghost = Address::new(Uuid::new_v4(), Uuid::new_v4());
    let (carried, keep) = Channel::pair(&wire);
    keep.send(Live::from("still connected")).unwrap();
    stage.send(ghost, Live::Channel(carried)).unwrap();

    let first = timeout(Duration::from_millis(200), probe_a.recv()).await;
    let second = timeout(Duration::from_millis(200), probe_b.recv()).await;
    let mut delivered: Vec<Live> = [first, second]
        .into_iter()
        .filter_map(|outcome| outcome.ok())
        .map(|received| received.unwrap())
        .collect();
    assert_eq!(delivered.len(), 1);

    let mut datagram = delivered.pop().unwrap();
    assert_eq!(datagram.get("kind").and_then(Live::as_str), Some("send"));
    let Some(Live::Channel(channel)) = datagram.take("message") else {
        panic!("the capability payload did not survive the trip");
    };
    assert_eq!(
        channel.recv().await.unwrap(),
        Live::from("still connected")
    );
}

#[tokio::test]
async fn test_selective_receive_actor() {
    let wire = Wire::new();
    let stage = Stage::new(wire);

    let (done_in, done_out) = tokio::sync::oneshot::channel();
    let worker = stage.spawn(move |_me, mailbox| async move {
        let mut order = vec![];
        // Urgent messages first, whatever the arrival order.
        for _ in 0..2 {
            let urgent = mailbox
                .take(|m| m.get("urgent").and_then(Live::as_bool) == Some(true))
                .await
                .unwrap();
            order.push(urgent.get("n").and_then(Live::as_int).unwrap());
        }
        while let Ok(rest) = mailbox.recv().await {
            order.push(rest.get("n").and_then(Live::as_int).unwrap());
            if order.len() == 4 {
                break;
            }
        }
        let _ = done_in.send(order);
    });

    let message = |n: i64, urgent: bool| {
        Live::map([("n", Live::Int(n)), ("urgent", Live::Bool(urgent))])
    };
    worker.send(message(1, false)).unwrap();
    worker.send(message(2, true)).unwrap();
    worker.send(message(3, false)).unwrap();
    worker.send(message(4, true)).unwrap();

    assert_eq!(done_out.await.unwrap(), vec![2, 4, 1, 3]);
}
