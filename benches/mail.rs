use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use enclave_mail::mail::{MailChannel, MailEnvelope, MinSizePolicy};
use enclave_mail::tee::{ClientIdentity, EphemeralKeyPair, PeerIdentity};

fn client_of(keys: &EphemeralKeyPair) -> PeerIdentity {
    PeerIdentity::Client(ClientIdentity {
        public_key: keys.public_key(),
        nonce: *keys.nonce(),
    })
}

fn channel_pair(padding: MinSizePolicy) -> (MailChannel, MailChannel) {
    let a_keys = EphemeralKeyPair::generate();
    let b_keys = EphemeralKeyPair::generate();
    let a = MailChannel::new(padding.clone());
    let b = MailChannel::new(padding);
    a.establish(&a_keys, &client_of(&b_keys)).unwrap();
    b.establish(&b_keys, &client_of(&a_keys)).unwrap();
    (a, b)
}

fn bench_mail(c: &mut Criterion) {
    let mut group = c.benchmark_group("mail");

    for size in [64usize, 4096] {
        let body = vec![0x5a; size];
        group.throughput(Throughput::Bytes(size as u64));

        let (sender, receiver) = channel_pair(MinSizePolicy::Fixed { size: 0 });
        group.bench_with_input(BenchmarkId::new("seal", size), &body, |b, body| {
            b.iter(|| sender.seal("bench", b"", body).unwrap())
        });

        group.bench_with_input(BenchmarkId::new("seal_open", size), &body, |b, body| {
            b.iter(|| {
                let env = sender.seal("bench", b"", body).unwrap();
                receiver.receive(&env).unwrap()
            })
        });

        let env = sender.seal("bench", b"", &body).unwrap();
        let bytes = env.to_bytes();
        group.bench_with_input(BenchmarkId::new("parse", size), &bytes, |b, bytes| {
            b.iter(|| MailEnvelope::from_bytes(bytes).unwrap())
        });
    }

    group.finish();
}

fn bench_establish(c: &mut Criterion) {
    c.bench_function("establish_pair", |b| {
        b.iter(|| channel_pair(MinSizePolicy::default()))
    });
}

criterion_group!(benches, bench_mail, bench_establish);
criterion_main!(benches);
