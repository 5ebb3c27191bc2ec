use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand_core::OsRng;
use std::sync::Arc;
use tokio::runtime::Runtime;
use whisper_session::{
    key_helper, InMemoryProtocolStore, JobQueue, PreKeyBundle, ProtocolAddress, SessionBuilder,
    SessionCipher,
};

fn setup_pair(rt: &Runtime) -> (SessionCipher, SessionCipher) {
    let alice_identity = key_helper::generate_identity_key_pair(&mut OsRng);
    let bob_identity = key_helper::generate_identity_key_pair(&mut OsRng);
    let alice_store = Arc::new(InMemoryProtocolStore::new(alice_identity, 1));
    let bob_store = Arc::new(InMemoryProtocolStore::new(bob_identity.clone(), 2));

    let signed = key_helper::generate_signed_pre_key(&mut OsRng, &bob_identity, 1).unwrap();
    let one_time = key_helper::generate_pre_key(&mut OsRng, 7);
    let bundle = PreKeyBundle {
        registration_id: 2,
        identity_key: bob_identity.public_key,
        signed_pre_key_id: signed.id,
        signed_pre_key: signed.key_pair.public_key,
        signed_pre_key_signature: signed.signature,
        pre_key_id: Some(one_time.id),
        pre_key: Some(one_time.key_pair.public_key),
    };
    bob_store.store_signed_pre_key(signed).unwrap();
    bob_store.store_pre_key(one_time).unwrap();

    let bob_addr = ProtocolAddress::new("bob", 1);
    let alice_queue = Arc::new(JobQueue::new());
    let builder = SessionBuilder::new(alice_store.clone(), alice_queue.clone(), bob_addr.clone());
    rt.block_on(builder.process_pre_key_bundle(&mut OsRng, &bundle))
        .unwrap();

    let alice_cipher = SessionCipher::new(alice_store, alice_queue, bob_addr);
    let bob_cipher = SessionCipher::new(
        bob_store,
        Arc::new(JobQueue::new()),
        ProtocolAddress::new("alice", 1),
    );

    // settle the handshake so benches run on plain whisper frames
    let first = rt.block_on(alice_cipher.encrypt(b"hello")).unwrap();
    rt.block_on(bob_cipher.decrypt_pre_key_whisper_message(&mut OsRng, &first.body))
        .unwrap();
    let reply = rt.block_on(bob_cipher.encrypt(b"ack")).unwrap();
    rt.block_on(alice_cipher.decrypt_whisper_message(&mut OsRng, &reply.body))
        .unwrap();

    (alice_cipher, bob_cipher)
}

fn bench_handshake(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("handshake");

    group.bench_function("process_pre_key_bundle", |b| {
        b.iter(|| black_box(setup_pair(&rt)));
    });

    group.finish();
}

fn bench_encrypt(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("encrypt");

    for size in [64usize, 1024, 16384] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let (alice, _) = setup_pair(&rt);
            let message = vec![0u8; size];
            b.iter(|| black_box(rt.block_on(alice.encrypt(&message)).unwrap()));
        });
    }

    group.finish();
}

fn bench_roundtrip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("roundtrip");

    let (alice, bob) = setup_pair(&rt);
    let message = vec![0u8; 1024];

    group.bench_function("encrypt_decrypt_1kb", |b| {
        b.iter(|| {
            let encrypted = rt.block_on(alice.encrypt(&message)).unwrap();
            black_box(
                rt.block_on(bob.decrypt_whisper_message(&mut OsRng, &encrypted.body))
                    .unwrap(),
            )
        });
    });

    group.finish();
}

criterion_group!(benches, bench_handshake, bench_encrypt, bench_roundtrip);
criterion_main!(benches);
