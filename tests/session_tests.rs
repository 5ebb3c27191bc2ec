//! End-to-end session tests: prekey handshakes, replies, duplicate and
//! reordered delivery, tampering and trust revocation.

use rand_core::OsRng;
use std::sync::Arc;
use whisper_session::{
    key_helper, CiphertextMessage, CiphertextMessageType, Error, InMemoryProtocolStore, JobQueue,
    KeyPair, PreKeyBundle, ProtocolAddress, ProtocolStore, SessionBuilder, SessionCipher,
};

/// One protocol participant: identity, storage and its job queue.
struct Peer {
    identity: KeyPair,
    registration_id: u32,
    store: Arc<InMemoryProtocolStore>,
    queue: Arc<JobQueue>,
}

impl Peer {
    fn new(registration_id: u32) -> Self {
        let identity = key_helper::generate_identity_key_pair(&mut OsRng);
        let store = Arc::new(InMemoryProtocolStore::new(identity.clone(), registration_id));
        Self {
            identity,
            registration_id,
            store,
            queue: Arc::new(JobQueue::new()),
        }
    }

    /// Publish a bundle backed by this peer's store.
    fn bundle(&self, signed_pre_key_id: u32, pre_key_id: Option<u32>) -> PreKeyBundle {
        let signed =
            key_helper::generate_signed_pre_key(&mut OsRng, &self.identity, signed_pre_key_id)
                .expect("signing cannot fail with a valid identity");
        self.store.store_signed_pre_key(signed.clone()).unwrap();

        let pre_key = pre_key_id.map(|id| {
            let record = key_helper::generate_pre_key(&mut OsRng, id);
            self.store.store_pre_key(record.clone()).unwrap();
            record.key_pair.public_key
        });

        PreKeyBundle {
            registration_id: self.registration_id,
            identity_key: self.identity.public_key,
            signed_pre_key_id,
            signed_pre_key: signed.key_pair.public_key,
            signed_pre_key_signature: signed.signature,
            pre_key_id,
            pre_key,
        }
    }

    fn cipher(&self, remote: &str) -> SessionCipher {
        SessionCipher::new(
            self.store.clone(),
            self.queue.clone(),
            ProtocolAddress::new(remote, 1),
        )
    }

    fn builder(&self, remote: &str) -> SessionBuilder {
        SessionBuilder::new(
            self.store.clone(),
            self.queue.clone(),
            ProtocolAddress::new(remote, 1),
        )
    }
}

/// Alice processes Bob's bundle; both sides get ciphers toward each other.
async fn establish(
    alice: &Peer,
    bob: &Peer,
    pre_key_id: Option<u32>,
) -> (SessionCipher, SessionCipher) {
    let bundle = bob.bundle(1, pre_key_id);
    alice
        .builder("bob")
        .process_pre_key_bundle(&mut OsRng, &bundle)
        .await
        .unwrap();
    (alice.cipher("bob"), bob.cipher("alice"))
}

/// A consumed-or-never-filled key failure, either direct (PreKey path) or
/// as the cause of the trial-decrypt wrapper (Whisper path).
fn is_counter_error(error: &Error) -> bool {
    match error {
        Error::MessageCounter(_) => true,
        Error::Session {
            source: Some(cause),
            ..
        } => matches!(**cause, Error::MessageCounter(_)),
        _ => false,
    }
}

async fn deliver(receiver: &SessionCipher, message: &CiphertextMessage) -> Result<Vec<u8>, Error> {
    match message.message_type {
        CiphertextMessageType::PreKey => {
            receiver
                .decrypt_pre_key_whisper_message(&mut OsRng, &message.body)
                .await
        }
        CiphertextMessageType::Whisper => {
            receiver
                .decrypt_whisper_message(&mut OsRng, &message.body)
                .await
        }
    }
}

#[tokio::test]
async fn test_outbound_prekey_handshake() {
    let alice = Peer::new(0x0AAA);
    let bob = Peer::new(0x1234);
    let (alice_cipher, bob_cipher) = establish(&alice, &bob, Some(7)).await;

    let message = alice_cipher.encrypt(b"hi").await.unwrap();
    assert_eq!(message.message_type, CiphertextMessageType::PreKey);
    assert_eq!(message.registration_id, Some(0x1234));

    let plaintext = deliver(&bob_cipher, &message).await.unwrap();
    assert_eq!(plaintext, b"hi");

    // the one-time prekey was consumed
    assert!(bob.store.load_pre_key(7).await.unwrap().is_none());

    // still no reply, so the wrapper keeps being sent
    let again = alice_cipher.encrypt(b"hi again").await.unwrap();
    assert_eq!(again.message_type, CiphertextMessageType::PreKey);
    assert_eq!(deliver(&bob_cipher, &again).await.unwrap(), b"hi again");
}

#[tokio::test]
async fn test_handshake_without_one_time_prekey() {
    let alice = Peer::new(1);
    let bob = Peer::new(2);
    let (alice_cipher, bob_cipher) = establish(&alice, &bob, None).await;

    let message = alice_cipher.encrypt(b"no otp").await.unwrap();
    assert_eq!(message.message_type, CiphertextMessageType::PreKey);
    assert_eq!(deliver(&bob_cipher, &message).await.unwrap(), b"no otp");
}

#[tokio::test]
async fn test_reply_clears_pending_and_ratchets() {
    let alice = Peer::new(1);
    let bob = Peer::new(2);
    let (alice_cipher, bob_cipher) = establish(&alice, &bob, Some(7)).await;

    let first = alice_cipher.encrypt(b"hi").await.unwrap();
    deliver(&bob_cipher, &first).await.unwrap();

    // Bob's reply rides a fresh sending chain from his first DH ratchet
    let reply = bob_cipher.encrypt(b"hello").await.unwrap();
    assert_eq!(reply.message_type, CiphertextMessageType::Whisper);
    assert_eq!(deliver(&alice_cipher, &reply).await.unwrap(), b"hello");

    // Alice saw the reply, so her pending-prekey memo is gone
    let second = alice_cipher.encrypt(b"back to you").await.unwrap();
    assert_eq!(second.message_type, CiphertextMessageType::Whisper);
    assert_eq!(
        deliver(&bob_cipher, &second).await.unwrap(),
        b"back to you"
    );
}

#[tokio::test]
async fn test_long_bidirectional_conversation() {
    let alice = Peer::new(1);
    let bob = Peer::new(2);
    let (alice_cipher, bob_cipher) = establish(&alice, &bob, Some(3)).await;

    for round in 0..6u32 {
        let from_alice = format!("alice round {round}");
        let message = alice_cipher.encrypt(from_alice.as_bytes()).await.unwrap();
        assert_eq!(
            deliver(&bob_cipher, &message).await.unwrap(),
            from_alice.as_bytes()
        );

        let from_bob = format!("bob round {round}");
        let message = bob_cipher.encrypt(from_bob.as_bytes()).await.unwrap();
        assert_eq!(
            deliver(&alice_cipher, &message).await.unwrap(),
            from_bob.as_bytes()
        );
    }
}

#[tokio::test]
async fn test_duplicate_delivery_fails_without_corrupting_record() {
    let alice = Peer::new(1);
    let bob = Peer::new(2);
    let (alice_cipher, bob_cipher) = establish(&alice, &bob, Some(7)).await;

    let message = alice_cipher.encrypt(b"hi").await.unwrap();
    assert_eq!(deliver(&bob_cipher, &message).await.unwrap(), b"hi");

    // second delivery of the same frame: the key is gone
    let error = deliver(&bob_cipher, &message).await.unwrap_err();
    assert!(is_counter_error(&error), "got {error:?}");

    // the record still works for fresh traffic
    let next = alice_cipher.encrypt(b"still fine").await.unwrap();
    assert_eq!(deliver(&bob_cipher, &next).await.unwrap(), b"still fine");
}

#[tokio::test]
async fn test_out_of_order_delivery() {
    let alice = Peer::new(1);
    let bob = Peer::new(2);
    let (alice_cipher, bob_cipher) = establish(&alice, &bob, Some(7)).await;

    // settle the handshake so all frames below are plain whisper messages
    let hello = alice_cipher.encrypt(b"hello").await.unwrap();
    deliver(&bob_cipher, &hello).await.unwrap();
    let reply = bob_cipher.encrypt(b"ack").await.unwrap();
    deliver(&alice_cipher, &reply).await.unwrap();

    let m0 = alice_cipher.encrypt(&[0x00]).await.unwrap();
    let m1 = alice_cipher.encrypt(&[0x01]).await.unwrap();
    let m2 = alice_cipher.encrypt(&[0x02]).await.unwrap();

    assert_eq!(deliver(&bob_cipher, &m2).await.unwrap(), vec![0x02]);
    assert_eq!(deliver(&bob_cipher, &m0).await.unwrap(), vec![0x00]);
    assert_eq!(deliver(&bob_cipher, &m1).await.unwrap(), vec![0x01]);

    // every cached key was consumed on the way
    for m in [&m0, &m1, &m2] {
        let error = deliver(&bob_cipher, m).await.unwrap_err();
        assert!(is_counter_error(&error), "got {error:?}");
    }
}

#[tokio::test]
async fn test_mac_tamper_fails_and_key_survives() {
    let alice = Peer::new(1);
    let bob = Peer::new(2);
    let (alice_cipher, bob_cipher) = establish(&alice, &bob, Some(7)).await;

    let hello = alice_cipher.encrypt(b"hello").await.unwrap();
    deliver(&bob_cipher, &hello).await.unwrap();
    let reply = bob_cipher.encrypt(b"ack").await.unwrap();
    deliver(&alice_cipher, &reply).await.unwrap();

    let m0 = alice_cipher.encrypt(&[0x00]).await.unwrap();
    let m1 = alice_cipher.encrypt(&[0x01]).await.unwrap();
    let m2 = alice_cipher.encrypt(&[0x02]).await.unwrap();

    deliver(&bob_cipher, &m0).await.unwrap();
    // decrypting m2 caches the key for m1
    deliver(&bob_cipher, &m2).await.unwrap();

    // corrupt the last ciphertext byte (just before the 8-byte MAC)
    let mut tampered = m1.clone();
    let index = tampered.body.len() - 9;
    tampered.body[index] ^= 0x01;
    match deliver(&bob_cipher, &tampered).await {
        Err(Error::Session { source, .. }) => {
            assert_eq!(*source.expect("cause attached"), Error::Mac);
        }
        other => panic!("expected MAC failure, got {other:?}"),
    }

    // the cached key was not consumed by the failed attempt
    assert_eq!(deliver(&bob_cipher, &m1).await.unwrap(), vec![0x01]);
}

#[tokio::test]
async fn test_version_gate_rejects_before_crypto() {
    let alice = Peer::new(1);
    let bob = Peer::new(2);
    let (alice_cipher, bob_cipher) = establish(&alice, &bob, Some(7)).await;

    let mut message = alice_cipher.encrypt(b"hi").await.unwrap();

    for bad_version in [0x34u8, 0x22] {
        message.body[0] = bad_version;
        match deliver(&bob_cipher, &message).await {
            Err(Error::InvalidMessage(_)) => {}
            other => panic!("expected version rejection, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_trust_revocation_blocks_both_directions() {
    let alice = Peer::new(1);
    let bob = Peer::new(2);
    let (alice_cipher, bob_cipher) = establish(&alice, &bob, Some(7)).await;

    let hello = alice_cipher.encrypt(b"hello").await.unwrap();
    deliver(&bob_cipher, &hello).await.unwrap();

    // storage now expects a different key for bob
    let imposter = key_helper::generate_identity_key_pair(&mut OsRng);
    alice
        .store
        .save_identity("bob", &imposter.public_key)
        .unwrap();

    match alice_cipher.encrypt(b"blocked").await {
        Err(Error::UntrustedIdentity { name, key }) => {
            assert_eq!(name, "bob");
            assert_eq!(key, bob.identity.public_key);
        }
        other => panic!("expected UntrustedIdentity, got {other:?}"),
    }

    // and inbound at bob once alice's key is unpinned there
    bob.store
        .save_identity("alice", &imposter.public_key)
        .unwrap();
    let reply = bob_cipher.encrypt(b"reply");
    match reply.await {
        Err(Error::UntrustedIdentity { name, .. }) => assert_eq!(name, "alice"),
        other => panic!("expected UntrustedIdentity, got {other:?}"),
    }
}

#[tokio::test]
async fn test_encrypt_without_session_fails() {
    let alice = Peer::new(1);
    let cipher = alice.cipher("stranger");
    match cipher.encrypt(b"hi").await {
        Err(Error::Session { message, .. }) => assert_eq!(message, "No sessions"),
        other => panic!("expected Session error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_decrypt_without_record_fails() {
    let alice = Peer::new(1);
    let cipher = alice.cipher("stranger");
    let result = cipher.decrypt_whisper_message(&mut OsRng, &[0x33; 32]).await;
    match result {
        Err(Error::Session { message, .. }) => assert_eq!(message, "No session record"),
        other => panic!("expected Session error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rehandshake_keeps_old_session_decryptable() {
    let alice = Peer::new(1);
    let bob = Peer::new(2);
    let (alice_cipher, bob_cipher) = establish(&alice, &bob, Some(7)).await;

    // traffic sent on the first session but not yet delivered
    let late = alice_cipher.encrypt(b"late frame").await.unwrap();

    // a second handshake replaces the open session
    let bundle = bob.bundle(2, Some(8));
    alice
        .builder("bob")
        .process_pre_key_bundle(&mut OsRng, &bundle)
        .await
        .unwrap();

    let fresh = alice_cipher.encrypt(b"fresh session").await.unwrap();
    assert_eq!(fresh.message_type, CiphertextMessageType::PreKey);
    assert_eq!(
        deliver(&bob_cipher, &fresh).await.unwrap(),
        b"fresh session"
    );

    // the late frame from the closed session still decrypts
    assert_eq!(deliver(&bob_cipher, &late).await.unwrap(), b"late frame");
}

#[tokio::test]
async fn test_session_retirement_caps_record() {
    let alice = Peer::new(1);
    let bob = Peer::new(2);
    let addr = ProtocolAddress::new("bob", 1);

    for i in 0..42u32 {
        let bundle = bob.bundle(i + 1, None);
        alice
            .builder("bob")
            .process_pre_key_bundle(&mut OsRng, &bundle)
            .await
            .unwrap();
    }

    let record = alice.store.load_session(&addr).await.unwrap().unwrap();
    assert_eq!(record.session_count(), 40);
    assert!(record.has_open_session());
}

#[tokio::test]
async fn test_close_and_delete_sessions() {
    let alice = Peer::new(1);
    let bob = Peer::new(2);
    let (alice_cipher, _bob_cipher) = establish(&alice, &bob, Some(7)).await;

    assert!(alice_cipher.has_open_session().await.unwrap());
    alice_cipher.close_open_session().await.unwrap();
    assert!(!alice_cipher.has_open_session().await.unwrap());

    match alice_cipher.encrypt(b"nope").await {
        Err(Error::Session { message, .. }) => assert_eq!(message, "No sessions"),
        other => panic!("expected Session error, got {other:?}"),
    }

    alice_cipher.delete_all_sessions().await.unwrap();
    let record = alice
        .store
        .load_session(&ProtocolAddress::new("bob", 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.session_count(), 0);
}

#[tokio::test]
async fn test_concurrent_encrypts_are_serialized() {
    let alice = Peer::new(1);
    let bob = Peer::new(2);
    let (alice_cipher, bob_cipher) = establish(&alice, &bob, Some(7)).await;
    let alice_cipher = Arc::new(alice_cipher);

    let mut handles = Vec::new();
    for i in 0..10u8 {
        let cipher = alice_cipher.clone();
        handles.push(tokio::spawn(async move {
            cipher.encrypt(&[i]).await.unwrap()
        }));
    }

    let mut messages = Vec::new();
    for handle in handles {
        messages.push(handle.await.unwrap());
    }

    // every frame decrypts exactly once, regardless of completion order
    let mut seen = Vec::new();
    for message in &messages {
        seen.push(deliver(&bob_cipher, message).await.unwrap());
    }
    seen.sort();
    let expected: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i]).collect();
    assert_eq!(seen, expected);
}
