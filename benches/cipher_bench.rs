//! Cipher throughput and key derivation benchmarks
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tunnel_proto::crypto::{encrypt_to, CipherRegistry};

const PAYLOAD_SIZE: usize = 64 * 1024;

fn bench_encrypt(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
    let registry = CipherRegistry::with_builtin();
    let payload = vec![0x5au8; PAYLOAD_SIZE];

    let mut group = c.benchmark_group("encrypt");
    group.throughput(Throughput::Bytes(PAYLOAD_SIZE as u64));

    for method in ["aes-128-gcm", "aes-256-gcm", "chacha20-ietf-poly1305", "aes-256-cfb"] {
        group.bench_function(method, |b| {
            b.iter(|| {
                let mut cryptor = registry.new_cryptor(method, "bench-password").unwrap();
                let mut out = Vec::with_capacity(PAYLOAD_SIZE + 4096);
                runtime
                    .block_on(encrypt_to(cryptor.as_mut(), &mut out, black_box(&payload)))
                    .unwrap();
                black_box(out)
            })
        });
    }

    group.finish();
}

fn bench_key_derivation(c: &mut Criterion) {
    use tunnel_proto::crypto::kdf::{derive_subkey, evp_bytes_to_key, PasswordDigest};

    let mut group = c.benchmark_group("kdf");
    group.throughput(Throughput::Elements(1));

    group.bench_function("evp_bytes_to_key", |b| {
        b.iter(|| black_box(evp_bytes_to_key(black_box(b"bench-password"), 32)))
    });

    let master = evp_bytes_to_key(b"bench-password", 32);
    let salt = [7u8; 32];
    group.bench_function("hkdf_subkey", |b| {
        b.iter(|| black_box(derive_subkey(&master, black_box(&salt)).unwrap()))
    });

    group.bench_function("trojan_digest", |b| {
        b.iter(|| black_box(PasswordDigest::new(black_box("bench-password"))))
    });

    let registry = CipherRegistry::with_builtin();
    group.bench_function("cached_cryptor", |b| {
        b.iter(|| black_box(registry.new_cryptor("aes-256-gcm", "bench-password").unwrap()))
    });

    group.finish();
}

criterion_group!(benches, bench_encrypt, bench_key_derivation);
criterion_main!(benches);
