//! Multi-player scenarios driven through a socket-free broker.

mod common;

use bytes::Bytes;
use common::{admin_config, created_id, Harness};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether_net::{
    ClientMessage, DataTree, JoinRejection, ObjectPersistence, PlayerRef, RemoteCall, RfcKey,
    ServerMessage,
};
use tether_server::{BrokerConfig, BrokerServices, FileStore, MemoryFileStore, StoreRequest};

fn create(h: &mut Harness, conn: u64, channel: u32, persistence: ObjectPersistence) -> u32 {
    h.send(
        conn,
        ClientMessage::CreateObject {
            channel,
            type_index: 3,
            persistence,
            payload: Bytes::from_static(b"spawn"),
        },
    );
    h.tick();
    created_id(&h.take(conn))
}

fn call(object_id: u32, function_id: u8, payload: &'static [u8]) -> RemoteCall {
    RemoteCall::new(RfcKey::by_id(object_id, function_id), Bytes::from_static(payload))
}

fn forwarded(msgs: &[ServerMessage]) -> Vec<(Option<u32>, u32, RfcKey, Bytes)> {
    msgs.iter()
        .filter_map(|msg| match msg {
            ServerMessage::ForwardedCall {
                channel,
                sender,
                key,
                payload,
            } => Some((*channel, *sender, key.clone(), payload.clone())),
            _ => None,
        })
        .collect()
}

fn position(msgs: &[ServerMessage], pred: impl Fn(&ServerMessage) -> bool) -> usize {
    msgs.iter().position(pred).expect("message present")
}

#[test]
fn test_late_joiner_receives_saved_state_and_host_moves_on_disconnect() {
    let mut h = Harness::new();
    let (a, pa) = h.connect("alice");
    let (b, pb) = h.connect("bob");

    let burst = h.join(a, 7, false);
    assert!(matches!(burst.first(), Some(ServerMessage::JoiningChannel { channel: 7, .. })));
    assert!(burst.contains(&ServerMessage::SetHost { channel: 7, player: pa }));
    assert_eq!(burst.last(), Some(&ServerMessage::JoinComplete { channel: 7 }));

    let object = create(&mut h, a, 7, ObjectPersistence::Persistent);
    assert!(object >= 32_768);

    h.send(
        a,
        ClientMessage::ForwardToOthersSaved {
            channel: 7,
            call: call(object, 1, b"{x:1}"),
        },
    );
    h.tick();
    assert!(forwarded(&h.take(a)).is_empty());

    let burst = h.join(b, 7, false);
    let created = position(&burst, |m| {
        matches!(m, ServerMessage::ObjectCreated { object_id, .. } if *object_id == object)
    });
    let replay = position(&burst, |m| matches!(m, ServerMessage::ForwardedCall { .. }));
    let complete = position(&burst, |m| matches!(m, ServerMessage::JoinComplete { .. }));
    assert!(created < replay && replay < complete);
    assert_eq!(
        forwarded(&burst),
        vec![(
            Some(7),
            0,
            RfcKey::by_id(object, 1),
            Bytes::from_static(b"{x:1}")
        )]
    );
    assert!(h.take(a).iter().any(|m| matches!(
        m,
        ServerMessage::PlayerJoined { channel: 7, player } if player.id == pb
    )));

    h.send(a, ClientMessage::Disconnect);
    h.tick();
    assert!(h.is_closed(a));
    let notices = h.take(b);
    assert!(notices.contains(&ServerMessage::SetHost { channel: 7, player: pb }));
    assert!(notices.contains(&ServerMessage::PlayerLeft { channel: 7, player: pa }));
    assert!(notices.contains(&ServerMessage::ObjectOwnerChanged {
        channel: 7,
        object_id: object,
        owner: pb
    }));

    let channel = h.broker.channel(7).expect("channel 7 alive");
    assert_eq!(channel.host(), Some(pb));
    assert_eq!(channel.members(), &[pb]);
}

#[test]
fn test_join_burst_order() {
    let mut h = Harness::new();
    let (a, pa) = h.connect("alice");
    let (b, _) = h.connect("bob");
    h.join(a, 5, true);

    h.send(
        a,
        ClientMessage::LoadLevel {
            channel: 5,
            level: "arena".into(),
        },
    );
    h.send(
        a,
        ClientMessage::SetChannelData {
            channel: 5,
            data: DataTree::new(vec![1u8, 2]),
        },
    );
    h.tick();
    let object = create(&mut h, a, 5, ObjectPersistence::Persistent);
    h.send(
        a,
        ClientMessage::DestroyObjects {
            channel: 5,
            object_ids: vec![7],
        },
    );
    for (function_id, payload) in [(1u8, &b"a"[..]), (2, &b"b"[..]), (1, &b"c"[..])] {
        h.send(
            a,
            ClientMessage::ForwardToAllSaved {
                channel: 5,
                call: RemoteCall::new(RfcKey::by_id(10, function_id), payload.to_vec()),
            },
        );
    }
    h.tick();
    h.take(a);

    let burst = h.join(b, 5, true);
    assert_eq!(burst.len(), 9, "{burst:?}");
    assert!(matches!(&burst[0], ServerMessage::JoiningChannel { channel: 5, players } if players.len() == 2));
    assert_eq!(burst[1], ServerMessage::SetHost { channel: 5, player: pa });
    assert_eq!(
        burst[2],
        ServerMessage::ChannelData {
            channel: 5,
            data: DataTree::new(vec![1u8, 2])
        }
    );
    assert_eq!(
        burst[3],
        ServerMessage::LoadLevel {
            channel: 5,
            level: "arena".into()
        }
    );
    assert!(matches!(
        &burst[4],
        ServerMessage::ObjectCreated { object_id, owner, .. } if *object_id == object && *owner == pa
    ));
    assert_eq!(
        burst[5],
        ServerMessage::ObjectsDestroyed {
            channel: 5,
            object_ids: vec![7]
        }
    );
    let replayed: Vec<_> = forwarded(&burst)
        .into_iter()
        .map(|(_, _, key, payload)| (key.function_id, payload))
        .collect();
    assert_eq!(
        replayed,
        vec![(2, Bytes::from_static(b"b")), (1, Bytes::from_static(b"c"))]
    );
    assert_eq!(burst[8], ServerMessage::JoinComplete { channel: 5 });
}

#[test]
fn test_leave_destroys_owner_bound_and_reassigns_persistent() {
    let mut h = Harness::new();
    let (a, pa) = h.connect("alice");
    let (b, pb) = h.connect("bob");
    let (c, _) = h.connect("carol");
    h.join(a, 9, false);
    h.join(b, 9, false);
    h.take(a);

    let bound = create(&mut h, b, 9, ObjectPersistence::OwnerBound);
    let kept = create(&mut h, b, 9, ObjectPersistence::Persistent);
    h.send(
        b,
        ClientMessage::ForwardToAllSaved {
            channel: 9,
            call: call(bound, 1, b"state"),
        },
    );
    h.tick();
    h.take(a);
    h.take(b);

    h.send(b, ClientMessage::LeaveChannel { channel: 9 });
    h.tick();
    assert_eq!(h.take(b), vec![ServerMessage::LeftChannel { channel: 9 }]);
    let notices = h.take(a);
    assert!(notices.contains(&ServerMessage::ObjectsDestroyed {
        channel: 9,
        object_ids: vec![bound]
    }));
    assert!(notices.contains(&ServerMessage::ObjectOwnerChanged {
        channel: 9,
        object_id: kept,
        owner: pa
    }));
    assert!(notices.contains(&ServerMessage::PlayerLeft { channel: 9, player: pb }));
    assert!(!h.is_closed(b));

    let burst = h.join(c, 9, false);
    let created: Vec<_> = burst
        .iter()
        .filter_map(|m| match m {
            ServerMessage::ObjectCreated { object_id, owner, .. } => Some((*object_id, *owner)),
            _ => None,
        })
        .collect();
    assert_eq!(created, vec![(kept, pa)]);
    assert!(forwarded(&burst).is_empty());
}

#[test]
fn test_empty_channels_torn_down_or_hibernated() {
    let mut h = Harness::new();
    let (a, _) = h.connect("alice");
    h.join(a, 1, false);
    h.join(a, 2, true);
    create(&mut h, a, 2, ObjectPersistence::Persistent);

    h.send(a, ClientMessage::LeaveChannel { channel: 1 });
    h.send(a, ClientMessage::LeaveChannel { channel: 2 });
    h.tick();

    assert!(h.broker.channel(1).is_none());
    let persistent = h.broker.channel(2).expect("persistent channel kept");
    assert!(persistent.is_asleep());
    assert!(persistent.has_data());

    let (b, pb) = h.connect("bob");
    let burst = h.join(b, 2, true);
    assert!(burst.iter().any(|m| matches!(
        m,
        ServerMessage::ObjectCreated { owner, .. } if *owner == pb
    )));
    assert!(!h.broker.channel(2).expect("channel").is_asleep());
}

#[test]
fn test_transfer_notices_and_redirect() {
    let mut h = Harness::new();
    let (a, pa) = h.connect("alice");
    let (b, _) = h.connect("bob");
    let (c, _) = h.connect("carol");
    h.join(a, 1, false);
    h.join(a, 2, false);
    h.join(b, 1, false);
    h.join(c, 2, false);
    h.take(a);

    let old_id = create(&mut h, a, 1, ObjectPersistence::Persistent);
    h.send(
        a,
        ClientMessage::ForwardToAllSaved {
            channel: 1,
            call: call(old_id, 4, b"pos"),
        },
    );
    h.tick();
    for conn in [a, b, c] {
        h.take(conn);
    }

    h.send(
        a,
        ClientMessage::TransferObject {
            from: 1,
            to: 2,
            object_id: old_id,
        },
    );
    h.tick();

    let to_a = h.take(a);
    let new_id = match to_a.as_slice() {
        [ServerMessage::ObjectTransferred {
            from: 1,
            to: 2,
            old_id: old,
            new_id,
        }] if *old == old_id => *new_id,
        other => panic!("unexpected notices for member of both: {other:?}"),
    };
    assert_eq!(
        h.take(b),
        vec![ServerMessage::ObjectsDestroyed {
            channel: 1,
            object_ids: vec![old_id]
        }]
    );
    let to_c = h.take(c);
    assert!(matches!(
        to_c.first(),
        Some(ServerMessage::ObjectCreated { channel: 2, object_id, owner, .. })
            if *object_id == new_id && *owner == pa
    ));
    assert_eq!(
        forwarded(&to_c),
        vec![(Some(2), 0, RfcKey::by_id(new_id, 4), Bytes::from_static(b"pos"))]
    );

    let source = h.broker.channel_mut(1).expect("source");
    assert!(source.ledgers_mut().rfcs.is_empty());
    assert!(source.ledgers_mut().objects.get(old_id).is_none());

    // Within the grace period calls on the old id follow the object.
    h.send(
        a,
        ClientMessage::ForwardToAll {
            channel: 1,
            call: call(old_id, 4, b"late"),
        },
    );
    h.tick();
    assert!(forwarded(&h.take(b)).is_empty());
    assert_eq!(
        forwarded(&h.take(c)),
        vec![(Some(2), pa, RfcKey::by_id(new_id, 4), Bytes::from_static(b"late"))]
    );

    h.advance(Duration::from_secs(3));
    h.send(
        a,
        ClientMessage::ForwardToAll {
            channel: 1,
            call: call(old_id, 4, b"stale"),
        },
    );
    h.tick();
    assert_eq!(forwarded(&h.take(b)).len(), 1);
    assert!(forwarded(&h.take(c)).is_empty());
}

#[test]
fn test_transfer_requires_membership_and_open_destination() {
    let mut h = Harness::with(admin_config("secret"), BrokerServices::default());
    let (a, _) = h.connect("alice");
    let (b, _) = h.connect("bob");
    h.join(a, 1, false);
    h.join(a, 2, false);
    h.join(b, 2, false);
    let object = create(&mut h, a, 1, ObjectPersistence::Persistent);

    h.send(
        b,
        ClientMessage::TransferObject {
            from: 1,
            to: 2,
            object_id: object,
        },
    );
    h.tick();
    assert!(h
        .broker
        .channel_mut(1)
        .expect("channel")
        .ledgers_mut()
        .objects
        .contains(object));

    h.make_admin(a, "secret");
    h.send(a, ClientMessage::CloseChannel { channel: 2 });
    h.send(
        a,
        ClientMessage::TransferObject {
            from: 1,
            to: 2,
            object_id: object,
        },
    );
    h.tick();
    assert!(h
        .broker
        .channel_mut(1)
        .expect("channel")
        .ledgers_mut()
        .objects
        .contains(object));
}

#[test]
fn test_transfer_by_host_hands_ownership_to_destination() {
    let mut h = Harness::new();
    let (host, _) = h.connect("hana");
    let (a, _) = h.connect("alice");
    let (c, pc) = h.connect("carol");
    let (d, _) = h.connect("dave");
    h.join(host, 1, false);
    h.join(a, 1, false);
    h.join(c, 2, false);
    h.join(d, 2, false);
    let object = create(&mut h, a, 1, ObjectPersistence::OwnerBound);
    for conn in [host, a, c, d] {
        h.take(conn);
    }

    h.send(
        host,
        ClientMessage::TransferObject {
            from: 1,
            to: 2,
            object_id: object,
        },
    );
    h.tick();
    let new_id = match h.take(c).first() {
        Some(ServerMessage::ObjectCreated {
            channel: 2,
            object_id,
            owner,
            ..
        }) if *owner == pc => *object_id,
        other => panic!("unexpected notice: {other:?}"),
    };

    // The old owner never joined channel 2, so losing them changes nothing there.
    h.broker.connection_lost(a, "gone");
    h.tick();
    assert!(!h
        .take(d)
        .iter()
        .any(|m| matches!(m, ServerMessage::ObjectsDestroyed { .. })));
    let owner = h
        .broker
        .channel_mut(2)
        .expect("channel")
        .ledgers_mut()
        .objects
        .get(new_id)
        .map(|o| o.owner);
    assert_eq!(owner, Some(pc));

    // The new owner leaving takes the owner-bound object with them.
    h.send(c, ClientMessage::LeaveChannel { channel: 2 });
    h.tick();
    assert!(h.take(d).contains(&ServerMessage::ObjectsDestroyed {
        channel: 2,
        object_ids: vec![new_id]
    }));
    assert!(!h
        .broker
        .channel_mut(2)
        .expect("channel")
        .ledgers_mut()
        .objects
        .contains(new_id));
}

#[test]
fn test_transfer_into_empty_channel() {
    let mut h = Harness::new();
    let (a, _) = h.connect("alice");
    h.join(a, 1, false);
    h.join(a, 3, true);
    create(&mut h, a, 3, ObjectPersistence::Persistent);
    h.send(a, ClientMessage::LeaveChannel { channel: 3 });
    h.tick();
    assert!(h.broker.channel(3).expect("kept").is_empty());

    let bound = create(&mut h, a, 1, ObjectPersistence::OwnerBound);
    let kept = create(&mut h, a, 1, ObjectPersistence::Persistent);
    for object_id in [bound, kept] {
        h.send(
            a,
            ClientMessage::TransferObject {
                from: 1,
                to: 3,
                object_id,
            },
        );
    }
    h.tick();
    h.take(a);

    let source = h.broker.channel_mut(1).expect("source");
    assert!(source.ledgers_mut().objects.contains(bound));
    assert!(!source.ledgers_mut().objects.contains(kept));

    // Unowned on arrival, then handed to whoever joins.
    let (b, pb) = h.connect("bob");
    let burst = h.join(b, 3, true);
    let owners: Vec<u32> = burst
        .iter()
        .filter_map(|m| match m {
            ServerMessage::ObjectCreated { owner, .. } => Some(*owner),
            _ => None,
        })
        .collect();
    assert_eq!(owners, vec![pb, pb]);
}

#[test]
fn test_player_targeted_relays() {
    let mut h = Harness::new();
    let (a, pa) = h.connect("alice");
    let (b, pb) = h.connect("bob");

    h.send(
        a,
        ClientMessage::ForwardToPlayer {
            sender: pa,
            target: pb,
            call: call(0, 1, b"hi"),
        },
    );
    h.send(
        a,
        ClientMessage::ForwardByName {
            sender: pa,
            name: "bob".into(),
            call: call(0, 2, b"yo"),
        },
    );
    h.send(
        a,
        ClientMessage::ForwardToPlayer {
            sender: pa,
            target: 999,
            call: call(0, 1, b"?"),
        },
    );
    h.tick();

    let to_b = forwarded(&h.take(b));
    assert_eq!(to_b.len(), 2);
    assert!(to_b.iter().all(|(channel, sender, _, _)| channel.is_none() && *sender == pa));
    assert_eq!(
        h.take(a),
        vec![ServerMessage::PlayerNotFound {
            target: PlayerRef::Id(999)
        }]
    );

    h.send(
        a,
        ClientMessage::ForwardToPlayer {
            sender: pb,
            target: pb,
            call: call(0, 1, b"spoof"),
        },
    );
    h.tick();
    assert!(h.is_closed(a));
    assert!(forwarded(&h.take(b)).is_empty());
}

#[test]
fn test_host_relay_and_unsaved_objects() {
    let mut h = Harness::new();
    let (a, pa) = h.connect("alice");
    let (b, pb) = h.connect("bob");
    h.join(a, 3, false);
    h.join(b, 3, false);
    h.take(a);

    h.send(
        b,
        ClientMessage::ForwardToHost {
            channel: 3,
            call: call(10, 1, b"ask"),
        },
    );
    h.send(
        b,
        ClientMessage::CreateObject {
            channel: 3,
            type_index: 1,
            persistence: ObjectPersistence::Unsaved,
            payload: Bytes::new(),
        },
    );
    h.tick();

    let to_a = h.take(a);
    assert_eq!(forwarded(&to_a), vec![(Some(3), pb, RfcKey::by_id(10, 1), Bytes::from_static(b"ask"))]);
    assert!(to_a.iter().any(|m| matches!(
        m,
        ServerMessage::ObjectCreated { object_id: 0, owner, .. } if *owner == pb
    )));
    assert!(forwarded(&h.take(b)).is_empty());
    assert_eq!(h.broker.channel(3).expect("channel").host(), Some(pa));
}

#[test]
fn test_locked_channel_drops_saved_calls_from_non_admins() {
    let mut h = Harness::with(admin_config("secret"), BrokerServices::default());
    let (a, _) = h.connect("alice");
    let (b, _) = h.connect("bob");
    h.join(a, 4, false);
    h.join(b, 4, false);
    h.make_admin(a, "secret");
    h.take(b);

    h.send(a, ClientMessage::LockChannel { channel: 4, locked: true });
    h.tick();
    assert!(h.take(b).contains(&ServerMessage::ChannelLocked {
        channel: 4,
        locked: true
    }));

    h.send(
        b,
        ClientMessage::ForwardToAllSaved {
            channel: 4,
            call: call(10, 1, b"blocked"),
        },
    );
    h.tick();
    assert!(forwarded(&h.take(a)).is_empty());
    assert!(h.broker.channel_mut(4).expect("channel").ledgers_mut().rfcs.is_empty());

    h.send(
        a,
        ClientMessage::ForwardToAllSaved {
            channel: 4,
            call: call(10, 1, b"allowed"),
        },
    );
    h.tick();
    assert_eq!(forwarded(&h.take(b)).len(), 1);
    assert_eq!(h.broker.channel_mut(4).expect("channel").ledgers_mut().rfcs.len(), 1);
}

#[test]
fn test_admin_verification_kick_and_ban() {
    let mut h = Harness::with(admin_config("secret"), BrokerServices::default());
    let (a, pa) = h.connect("alice");
    let (b, _) = h.connect("bob");
    let (c, _) = h.connect("carol");
    let (d, _) = h.connect("dave");

    h.send(
        d,
        ClientMessage::VerifyAdmin {
            password: "guess".into(),
        },
    );
    h.tick();
    assert!(h.is_closed(d));

    h.send(
        a,
        ClientMessage::VerifyAdmin {
            password: "secret".into(),
        },
    );
    h.tick();
    assert_eq!(h.take(a), vec![ServerMessage::AdminVerified { player: pa }]);

    h.send(
        a,
        ClientMessage::Kick {
            target: PlayerRef::Name("bob".into()),
        },
    );
    h.tick();
    assert_eq!(
        h.take(b),
        vec![ServerMessage::Disconnect {
            reason: "kicked".into()
        }]
    );
    assert!(h.is_closed(b));

    h.send(a, ClientMessage::Ban { entry: "carol".into() });
    h.tick();
    assert!(h.is_closed(c));
    assert!(h.broker.bans().contains("carol"));

    let conn = h
        .broker
        .accept(SocketAddr::from(([10, 0, 0, 9], 5000)), h.now)
        .expect("accept");
    h.send(
        conn,
        ClientMessage::Identify {
            protocol_version: tether_net::PROTOCOL_VERSION,
            name: "carol".into(),
        },
    );
    h.tick();
    assert!(h.is_closed(conn));
    assert!(!h.is_closed(a));
}

#[test]
fn test_broadcast_spam_is_dropped_then_kicked() {
    let config = BrokerConfig {
        broadcast_burst: 2,
        broadcast_kick_threshold: 2,
        ..BrokerConfig::default()
    };
    let mut h = Harness::with(config, BrokerServices::default());
    let (a, _) = h.connect("alice");
    let (b, _) = h.connect("bob");

    for _ in 0..3 {
        h.send(a, ClientMessage::Broadcast { call: call(0, 1, b"!") });
    }
    h.tick();
    assert_eq!(forwarded(&h.take(b)).len(), 2);
    assert!(!h.is_closed(a));

    h.send(a, ClientMessage::Broadcast { call: call(0, 1, b"!") });
    h.tick();
    assert!(h.is_closed(a));
    assert!(forwarded(&h.take(b)).is_empty());
}

#[test]
fn test_snapshot_survives_restart() {
    let store = Arc::new(MemoryFileStore::new());
    let services = BrokerServices::with_files(store.clone());

    let mut h = Harness::with(BrokerConfig::default(), services.clone());
    let (a, _) = h.connect("alice");
    h.join(a, 11, true);
    let object = create(&mut h, a, 11, ObjectPersistence::Persistent);
    h.send(
        a,
        ClientMessage::ForwardToAllSaved {
            channel: 11,
            call: call(object, 2, b"saved"),
        },
    );
    h.send(a, ClientMessage::Disconnect);
    h.tick();
    assert!(h.broker.save_to_store().expect("save"));
    assert!(store.load(tether_server::SNAPSHOT_FILE).expect("load").is_some());

    let mut restarted = Harness::with(BrokerConfig::default(), services);
    assert_eq!(restarted.broker.load_from_store().expect("restore"), 1);
    let (c, pc) = restarted.connect("carol");
    let burst = restarted.join(c, 11, true);
    assert!(burst.iter().any(|m| matches!(
        m,
        ServerMessage::ObjectCreated { object_id, owner, .. } if *object_id == object && *owner == pc
    )));
    assert_eq!(
        forwarded(&burst),
        vec![(Some(11), 0, RfcKey::by_id(object, 2), Bytes::from_static(b"saved"))]
    );
}

#[test]
fn test_udp_activation_and_best_effort_routing() {
    let mut h = Harness::new();
    h.broker.set_local_addrs(
        SocketAddr::from(([127, 0, 0, 1], 5127)),
        Some(SocketAddr::from(([127, 0, 0, 1], 5128))),
    );
    let (a, pa) = h.connect("alice");
    let (b, pb) = h.connect("bob");
    h.join(a, 3, false);
    h.join(b, 3, false);
    h.take(a);

    let stranger = SocketAddr::from(([127, 0, 0, 1], 7000));
    h.send_datagram(stranger, ClientMessage::Ping { client_time: 42 });
    h.tick();
    assert!(matches!(
        h.take_datagrams().as_slice(),
        [(addr, ServerMessage::Pong { client_time: 42, .. })] if *addr == stranger
    ));

    let a_udp = SocketAddr::from(([127, 0, 0, 1], 6000));
    let b_udp = SocketAddr::from(([127, 0, 0, 1], 6001));
    for (conn, player, addr) in [(a, pa, a_udp), (b, pb, b_udp)] {
        h.send(conn, ClientMessage::SetUdp { port: addr.port() });
        h.tick();
        assert_eq!(h.take(conn), vec![ServerMessage::UdpSet { port: 5128 }]);
        h.send_datagram(addr, ClientMessage::ActivateUdp { player_id: player });
        h.tick();
        assert_eq!(
            h.take_datagrams(),
            vec![(addr, ServerMessage::UdpActivated { player_id: player })]
        );
    }

    h.send_datagram(
        b_udp,
        ClientMessage::ForwardToOthers {
            channel: 3,
            call: call(10, 1, b"move"),
        },
    );
    h.tick();
    let datagrams = h.take_datagrams();
    assert_eq!(datagrams.len(), 1);
    assert_eq!(datagrams[0].0, a_udp);
    assert!(h.take(a).is_empty());

    // Reliable traffic keeps using the stream.
    h.send(
        b,
        ClientMessage::ForwardToOthers {
            channel: 3,
            call: call(10, 1, b"chat"),
        },
    );
    h.tick();
    assert_eq!(forwarded(&h.take(a)).len(), 1);
    assert!(h.take_datagrams().is_empty());
}

#[test]
fn test_file_packets() {
    let store = Arc::new(MemoryFileStore::new());
    let mut h = Harness::with(BrokerConfig::default(), BrokerServices::with_files(store.clone()));
    let (a, _) = h.connect("alice");
    let (b, _) = h.connect("bob");

    h.send(
        a,
        ClientMessage::SaveFile {
            name: "maps/one.bin".into(),
            data: Bytes::from_static(b"tiles"),
        },
    );
    h.send(
        a,
        ClientMessage::GetFileList {
            prefix: "maps/".into(),
        },
    );
    h.send(
        a,
        ClientMessage::LoadFile {
            name: "maps/one.bin".into(),
        },
    );
    h.send(
        a,
        ClientMessage::LoadFile {
            name: "maps/none.bin".into(),
        },
    );
    h.tick();
    assert_eq!(
        h.take(a),
        vec![
            ServerMessage::FileList {
                prefix: "maps/".into(),
                names: vec!["maps/one.bin".into()]
            },
            ServerMessage::FileLoaded {
                name: "maps/one.bin".into(),
                data: Some(Bytes::from_static(b"tiles"))
            },
            ServerMessage::FileLoaded {
                name: "maps/none.bin".into(),
                data: None
            },
        ]
    );

    h.send(
        b,
        ClientMessage::DeleteFile {
            name: "maps/one.bin".into(),
        },
    );
    h.tick();
    assert!(h.is_closed(b));
    assert!(store.load("maps/one.bin").expect("load").is_some());

    h.send(
        a,
        ClientMessage::LoadFile {
            name: "../secret".into(),
        },
    );
    h.tick();
    assert!(h.is_closed(a));
}

#[test]
fn test_file_packets_refuse_broker_files() {
    let store = Arc::new(MemoryFileStore::new());
    store.save("admin.txt", b"hunter2\n").expect("save");
    store.save(tether_server::SNAPSHOT_FILE, b"snap").expect("save");
    store.save("notes.txt", b"hi").expect("save");
    let services = BrokerServices::with_files(store.clone());
    let mut h = Harness::with(BrokerConfig::default(), services.clone());

    let (m, _) = h.connect("mallory");
    h.send(
        m,
        ClientMessage::GetFileList {
            prefix: String::new(),
        },
    );
    h.tick();
    assert_eq!(
        h.take(m),
        vec![ServerMessage::FileList {
            prefix: String::new(),
            names: vec!["notes.txt".into()]
        }]
    );

    h.send(
        m,
        ClientMessage::LoadFile {
            name: "admin.txt".into(),
        },
    );
    h.tick();
    assert!(h.is_closed(m));
    assert!(!h
        .take(m)
        .iter()
        .any(|msg| matches!(msg, ServerMessage::FileLoaded { .. })));

    for name in ["admin.txt", "ADMIN.TXT", "server.dat", "ban.txt/."] {
        let (conn, _) = h.connect("mallory");
        h.send(
            conn,
            ClientMessage::SaveFile {
                name: name.into(),
                data: Bytes::from_static(b"pwned\n"),
            },
        );
        h.tick();
        assert!(h.is_closed(conn), "{name} accepted");
    }
    assert_eq!(
        store.load("admin.txt").expect("load"),
        Some(Bytes::from_static(b"hunter2\n"))
    );
    assert_eq!(
        store.load(tether_server::SNAPSHOT_FILE).expect("load"),
        Some(Bytes::from_static(b"snap"))
    );
    assert_eq!(store.load("ban.txt").expect("load"), None);

    let mut restarted = Harness::with(BrokerConfig::default(), services);
    let (conn, _) = restarted.connect("mallory");
    restarted.send(
        conn,
        ClientMessage::VerifyAdmin {
            password: "pwned".into(),
        },
    );
    restarted.tick();
    assert!(restarted.is_closed(conn));
}

#[test]
fn test_store_work_is_queued_not_run_in_tick() {
    let store = Arc::new(MemoryFileStore::new());
    let mut h = Harness::with(
        BrokerConfig::default(),
        BrokerServices::with_files(store.clone()),
    );
    let (a, _) = h.connect("alice");
    h.send(
        a,
        ClientMessage::SaveFile {
            name: "notes.txt".into(),
            data: Bytes::from_static(b"hi"),
        },
    );
    h.broker.tick(h.now);
    assert_eq!(store.load("notes.txt").expect("load"), None);

    let io = h.broker.take_io();
    assert_eq!(
        io.stores,
        vec![StoreRequest::Save {
            name: "notes.txt".into(),
            data: Bytes::from_static(b"hi"),
        }]
    );
    for request in io.stores {
        assert_eq!(request.execute(store.as_ref()), None);
    }
    assert_eq!(
        store.load("notes.txt").expect("load"),
        Some(Bytes::from_static(b"hi"))
    );
}

#[test]
fn test_closed_channel_rejects_joins_and_join_any_allocates() {
    let mut h = Harness::with(admin_config("secret"), BrokerServices::default());
    let (a, _) = h.connect("alice");
    let (b, _) = h.connect("bob");
    h.join(a, 8, false);
    h.make_admin(a, "secret");

    h.send(a, ClientMessage::CloseChannel { channel: 8 });
    h.tick();
    assert_eq!(h.take(a), vec![ServerMessage::ChannelClosed { channel: 8 }]);

    let reply = h.join(b, 8, false);
    assert_eq!(
        reply,
        vec![ServerMessage::JoinFailed {
            channel: Some(8),
            reason: JoinRejection::Closed
        }]
    );
    assert!(!h.is_closed(b));

    h.send(
        b,
        ClientMessage::JoinChannel {
            channel: None,
            password: None,
            level: Some("arena".into()),
            persistent: false,
            player_limit: 4,
        },
    );
    h.tick();
    let burst = h.take(b);
    let joined = match burst.first() {
        Some(ServerMessage::JoiningChannel { channel, .. }) => *channel,
        other => panic!("expected a join burst, got {other:?}"),
    };
    assert_ne!(joined, 8);
    assert!(burst.contains(&ServerMessage::LoadLevel {
        channel: joined,
        level: "arena".into()
    }));

    h.send(b, ClientMessage::GetChannelList);
    h.tick();
    let listing = h.take(b);
    let ServerMessage::ChannelList { channels } = &listing[0] else {
        panic!("expected a channel list");
    };
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].id, joined);
    assert_eq!(channels[0].limit, 4);
}
