//! End-to-end scenarios across multiple managers sharing one in-memory
//! server.

mod common;

use std::sync::{Arc, Mutex};

use chirp_omemo::decrypt::KeyTransport;
use chirp_omemo::error::OmemoError;
use chirp_omemo::observer;
use chirp_omemo::receive::{CarbonDirection, MessageInfo, OmemoMessageListener};
use chirp_omemo::testing::MemoryServer;
use chirp_omemo::transport::RoomInfo;

use common::{client, did, jid, trust_each_other, trusts};

#[test]
fn single_recipient_happy_path() {
    let server = MemoryServer::new();
    let alice = client(&server, "alice@wonderland.lit", 1001);
    let bob1 = client(&server, "bob@wonderland.lit", 2001);
    let bob2 = client(&server, "bob@wonderland.lit", 2002);
    trust_each_other(&alice, &bob1);
    trust_each_other(&alice, &bob2);

    let message = alice
        .manager
        .encrypt(&jid("bob@wonderland.lit"), b"hello")
        .unwrap();

    let element = &message.element;
    assert_eq!(element.sid, did(1001));
    assert_eq!(element.iv.len(), 12);
    assert_eq!(element.keys.len(), 2);
    for rid in [2001, 2002] {
        let key = element.key_for(did(rid)).unwrap();
        assert!(key.prekey, "first message to {rid} must carry the prelude");
    }
    assert!(element.payload.is_some());

    for bob in [&bob1, &bob2] {
        let decrypted = bob
            .manager
            .receive_message(&jid("alice@wonderland.lit"), element)
            .unwrap()
            .unwrap();
        assert_eq!(decrypted.plaintext.unwrap(), b"hello");
        assert_eq!(decrypted.sender, alice.device);
    }
}

#[test]
fn undecided_device_blocks_the_send_without_side_effects() {
    let server = MemoryServer::new();
    let alice = client(&server, "alice@wonderland.lit", 1001);
    let bob1 = client(&server, "bob@wonderland.lit", 2001);
    trust_each_other(&alice, &bob1);

    // A first exchange works fine.
    let message = alice
        .manager
        .encrypt(&jid("bob@wonderland.lit"), b"hi")
        .unwrap();
    bob1.manager
        .receive_message(&jid("alice@wonderland.lit"), &message.element)
        .unwrap();

    // Bob adds a device whose fingerprint Alice has never decided on.
    let bob3 = client(&server, "bob@wonderland.lit", 2003);
    alice
        .manager
        .request_device_list_update(&jid("bob@wonderland.lit"))
        .unwrap();

    let result = alice.manager.encrypt(&jid("bob@wonderland.lit"), b"again");
    match result {
        Err(OmemoError::UndecidedDevices(devices)) => {
            assert_eq!(devices, vec![bob3.device.clone()]);
        }
        other => panic!("expected UndecidedDevices, got: {other:?}"),
    }

    // The aborted send left no session behind for the new device.
    assert!(!alice.manager.has_session(&bob3.device).unwrap());

    // Once decided, the send goes through.
    trusts(&alice, &bob3);
    let message = alice
        .manager
        .encrypt(&jid("bob@wonderland.lit"), b"again")
        .unwrap();
    assert!(message.element.key_for(did(2003)).is_some());
}

#[test]
fn self_sync_includes_own_other_devices_but_not_the_sender() {
    let server = MemoryServer::new();
    let alice1 = client(&server, "alice@wonderland.lit", 1001);
    let alice2 = client(&server, "alice@wonderland.lit", 1002);
    let bob1 = client(&server, "bob@wonderland.lit", 2001);
    let bob2 = client(&server, "bob@wonderland.lit", 2002);

    trust_each_other(&alice1, &bob1);
    trust_each_other(&alice1, &bob2);
    trusts(&alice1, &alice2);
    trusts(&alice2, &alice1);

    // The device-list notification for Alice's own account announces 1002.
    let published = server
        .stored_device_list(&jid("alice@wonderland.lit"))
        .unwrap();
    observer::handle_device_list_event(
        &alice1.manager,
        Some(&jid("alice@wonderland.lit")),
        &published,
    );

    let message = alice1
        .manager
        .encrypt(&jid("bob@wonderland.lit"), b"sync me")
        .unwrap();

    let rids: Vec<u32> = message.element.keys.iter().map(|k| k.rid.get()).collect();
    assert_eq!(message.element.keys.len(), 3);
    for rid in [2001, 2002, 1002] {
        assert!(rids.contains(&rid), "missing recipient {rid}");
    }
    assert!(
        message.element.key_for(did(1001)).is_none(),
        "sender must not wrap a key for itself"
    );

    // The sent carbon reveals the plaintext to the other own device.
    let decrypted = alice2
        .manager
        .receive_carbon(
            CarbonDirection::Sent,
            &jid("alice@wonderland.lit"),
            &message.element,
        )
        .unwrap()
        .unwrap();
    assert_eq!(decrypted.plaintext.unwrap(), b"sync me");
}

#[test]
fn group_chat_requires_members_only_and_non_anonymous() {
    let server = MemoryServer::new();
    let alice = client(&server, "alice@wonderland.lit", 1001);
    let bob = client(&server, "bob@wonderland.lit", 2001);
    let carol = client(&server, "carol@wonderland.lit", 3001);
    trust_each_other(&alice, &bob);
    trust_each_other(&alice, &carol);

    let mut room = RoomInfo {
        room: jid("room@conf.wonderland.lit"),
        members: vec![
            jid("alice@wonderland.lit"),
            jid("bob@wonderland.lit"),
            jid("carol@wonderland.lit"),
        ],
        members_only: false,
        non_anonymous: true,
    };

    assert!(matches!(
        alice.manager.encrypt_for_room(&room, b"hi all"),
        Err(OmemoError::NoOmemoSupport)
    ));

    room.members_only = true;
    let message = alice.manager.encrypt_for_room(&room, b"hi all").unwrap();

    let rids: Vec<u32> = message.element.keys.iter().map(|k| k.rid.get()).collect();
    assert!(rids.contains(&2001));
    assert!(rids.contains(&3001));
    assert!(!rids.contains(&1001));

    for member in [&bob, &carol] {
        let decrypted = member
            .manager
            .receive_message(&jid("alice@wonderland.lit"), &message.element)
            .unwrap()
            .unwrap();
        assert_eq!(decrypted.plaintext.unwrap(), b"hi all");
    }
}

#[test]
fn omitted_own_device_is_republished_exactly_once() {
    let server = MemoryServer::new();
    let alice = client(&server, "alice@wonderland.lit", 1001);
    let publishes_before = server.device_list_publishes();

    // Another client republishes the list without us, and the notification
    // arrives several times.
    let foreign_list = [did(1002)].into_iter().collect();
    for _ in 0..3 {
        observer::handle_device_list_event(
            &alice.manager,
            Some(&jid("alice@wonderland.lit")),
            &foreign_list,
        );
    }
    alice.manager.wait_for_background_tasks();

    assert_eq!(server.device_list_publishes() - publishes_before, 1);
    let list = server
        .stored_device_list(&jid("alice@wonderland.lit"))
        .unwrap();
    assert!(list.contains(did(1001)));
    assert!(list.contains(did(1002)));
}

#[test]
fn skipped_messages_decrypt_out_of_order_and_the_map_drains() {
    let server = MemoryServer::new();
    let alice = client(&server, "alice@wonderland.lit", 1001);
    let bob = client(&server, "bob@wonderland.lit", 2001);
    trust_each_other(&alice, &bob);

    let m1 = bob.manager.encrypt(&jid("alice@wonderland.lit"), b"m1").unwrap();
    let m2 = bob.manager.encrypt(&jid("alice@wonderland.lit"), b"m2").unwrap();
    let m3 = bob.manager.encrypt(&jid("alice@wonderland.lit"), b"m3").unwrap();

    // Delivery order: M2, M3, M1.
    for (element, body) in [(&m2, b"m2"), (&m3, b"m3"), (&m1, b"m1")] {
        let decrypted = alice
            .manager
            .receive_message(&jid("bob@wonderland.lit"), &element.element)
            .unwrap()
            .unwrap();
        assert_eq!(decrypted.plaintext.unwrap(), body.to_vec());
    }

    assert_eq!(alice.manager.skipped_key_count(&bob.device).unwrap(), 0);
}

#[test]
fn all_recipient_entries_unwrap_to_identical_plaintext() {
    // Indirectly asserted by every multi-device round trip; here the same
    // message is decrypted by three devices and compared.
    let server = MemoryServer::new();
    let alice = client(&server, "alice@wonderland.lit", 1001);
    let bob1 = client(&server, "bob@wonderland.lit", 2001);
    let bob2 = client(&server, "bob@wonderland.lit", 2002);
    let carol = client(&server, "carol@wonderland.lit", 3001);
    trust_each_other(&alice, &bob1);
    trust_each_other(&alice, &bob2);
    trust_each_other(&alice, &carol);

    let message = alice
        .manager
        .encrypt_multi(
            &[jid("bob@wonderland.lit"), jid("carol@wonderland.lit")],
            b"fan out",
        )
        .unwrap();
    assert_eq!(message.element.keys.len(), 3);

    for receiver in [&bob1, &bob2, &carol] {
        let decrypted = receiver
            .manager
            .receive_message(&jid("alice@wonderland.lit"), &message.element)
            .unwrap()
            .unwrap();
        assert_eq!(decrypted.plaintext.unwrap(), b"fan out");
    }
}

#[derive(Default)]
struct RecordingListener {
    infos: Mutex<Vec<MessageInfo>>,
    bodies: Mutex<Vec<Vec<u8>>>,
}

impl OmemoMessageListener for RecordingListener {
    fn message_received(&self, plaintext: &[u8], info: &MessageInfo) {
        self.bodies.lock().unwrap().push(plaintext.to_vec());
        self.infos.lock().unwrap().push(info.clone());
    }

    fn key_transport_received(&self, _transport: &KeyTransport, info: &MessageInfo) {
        self.infos.lock().unwrap().push(info.clone());
    }
}

#[test]
fn listeners_observe_provenance_and_fingerprint() {
    let server = MemoryServer::new();
    let alice = client(&server, "alice@wonderland.lit", 1001);
    let bob = client(&server, "bob@wonderland.lit", 2001);
    trust_each_other(&alice, &bob);

    let listener = Arc::new(RecordingListener::default());
    bob.manager.add_message_listener(listener.clone());

    let direct = alice.manager.encrypt(&jid("bob@wonderland.lit"), b"one").unwrap();
    bob.manager
        .receive_message(&jid("alice@wonderland.lit"), &direct.element)
        .unwrap();

    let archived = alice.manager.encrypt(&jid("bob@wonderland.lit"), b"two").unwrap();
    bob.manager
        .decrypt_archived(&jid("alice@wonderland.lit"), &archived.element)
        .unwrap();

    let infos = listener.infos.lock().unwrap();
    assert_eq!(infos.len(), 2);
    assert!(!infos[0].was_archive);
    assert!(infos[1].was_archive);
    assert!(!infos[1].was_carbon);
    assert_eq!(
        infos[0].fingerprint,
        alice.manager.own_fingerprint().unwrap()
    );
    assert_eq!(infos[0].sender, alice.device);

    let bodies = listener.bodies.lock().unwrap();
    assert_eq!(*bodies, vec![b"one".to_vec(), b"two".to_vec()]);
    drop(bodies);
    drop(infos);

    // After removal the listener no longer observes traffic.
    let handle: Arc<dyn OmemoMessageListener> = listener.clone();
    bob.manager.remove_message_listener(&handle);
    let third = alice.manager.encrypt(&jid("bob@wonderland.lit"), b"three").unwrap();
    bob.manager
        .receive_message(&jid("alice@wonderland.lit"), &third.element)
        .unwrap();
    assert_eq!(listener.infos.lock().unwrap().len(), 2);
}

#[test]
fn archive_batch_skips_what_it_cannot_decrypt() {
    let server = MemoryServer::new();
    let alice = client(&server, "alice@wonderland.lit", 1001);
    let bob = client(&server, "bob@wonderland.lit", 2001);
    trust_each_other(&alice, &bob);

    let m1 = alice.manager.encrypt(&jid("bob@wonderland.lit"), b"kept").unwrap();
    let mut m2 = alice.manager.encrypt(&jid("bob@wonderland.lit"), b"mangled").unwrap();
    m2.element.payload.as_mut().unwrap()[0] ^= 0xFF;

    let batch = vec![
        (jid("alice@wonderland.lit"), m1.element),
        (jid("alice@wonderland.lit"), m2.element),
    ];
    let decrypted = bob.manager.decrypt_archive_batch(&batch);
    assert_eq!(decrypted.len(), 1);
    assert_eq!(decrypted[0].plaintext.as_deref(), Some(b"kept".as_ref()));
}

#[test]
fn removed_device_is_excluded_from_new_sends_but_old_sessions_survive() {
    let server = MemoryServer::new();
    let alice = client(&server, "alice@wonderland.lit", 1001);
    let bob1 = client(&server, "bob@wonderland.lit", 2001);
    let bob2 = client(&server, "bob@wonderland.lit", 2002);
    trust_each_other(&alice, &bob1);
    trust_each_other(&alice, &bob2);

    let first = alice.manager.encrypt(&jid("bob@wonderland.lit"), b"both").unwrap();
    assert_eq!(first.element.keys.len(), 2);
    bob2.manager
        .receive_message(&jid("alice@wonderland.lit"), &first.element)
        .unwrap();

    // Bob's list is replaced without 2002.
    observer::handle_device_list_event(
        &alice.manager,
        Some(&jid("bob@wonderland.lit")),
        &[did(2001)].into_iter().collect(),
    );

    let second = alice.manager.encrypt(&jid("bob@wonderland.lit"), b"one left").unwrap();
    assert!(second.element.key_for(did(2001)).is_some());
    assert!(second.element.key_for(did(2002)).is_none());

    // The old session with 2002 still decrypts traffic from it.
    let from_bob2 = bob2
        .manager
        .encrypt(&jid("alice@wonderland.lit"), b"still here")
        .unwrap();
    let decrypted = alice
        .manager
        .receive_message(&jid("bob@wonderland.lit"), &from_bob2.element)
        .unwrap()
        .unwrap();
    assert_eq!(decrypted.plaintext.unwrap(), b"still here");
    assert!(alice.manager.has_session(&bob2.device).unwrap());
}

#[test]
fn own_device_always_on_published_list_after_initialize() {
    let server = MemoryServer::new();
    // Another device of the account published first.
    let other = client(&server, "alice@wonderland.lit", 1002);
    let this = client(&server, "alice@wonderland.lit", 1001);

    let list = server
        .stored_device_list(&jid("alice@wonderland.lit"))
        .unwrap();
    assert!(list.contains(this.device.id));
    assert!(list.contains(other.device.id));
}

#[test]
fn no_one_time_pre_key_is_consumed_twice_for_a_peer() {
    let server = MemoryServer::new();
    let alice = client(&server, "alice@wonderland.lit", 1001);
    let bob = client(&server, "bob@wonderland.lit", 2001);
    trust_each_other(&alice, &bob);

    // Alice establishes, resets, and establishes again. The second
    // establishment must pick a different one-time pre-key from Bob's
    // bundle; re-using the consumed one would make Bob's decrypt fail.
    let m1 = alice.manager.encrypt(&jid("bob@wonderland.lit"), b"a1").unwrap();
    bob.manager
        .receive_message(&jid("alice@wonderland.lit"), &m1.element)
        .unwrap();

    alice.manager.reset_session(&bob.device).unwrap();
    let m2 = alice.manager.encrypt(&jid("bob@wonderland.lit"), b"a2").unwrap();
    let decrypted = bob
        .manager
        .receive_message(&jid("alice@wonderland.lit"), &m2.element)
        .unwrap()
        .unwrap();
    assert_eq!(decrypted.plaintext.unwrap(), b"a2");
}
