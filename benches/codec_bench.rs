//! Wire codec benchmarks.
//!
//! Frame encoding, packet assembly with and without packet protection, and
//! FEC redundancy.

use std::collections::BTreeSet;
use std::time::Duration;

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::SeedableRng;

use qconn::crypto::{AeadEncrypter, AeadKey, KEY_SIZE};
use qconn::fec::{FecEncoder, FecGroup};
use qconn::generator::PacketGenerator;
use qconn::types::{FecProtection, FecSendPolicy, DEFAULT_MAX_PACKET_SIZE};
use qconn::wire::{AckFrame, Frame};
use qconn::{EncryptionLevel, Perspective, QuicVersion};

fn generator(forward_secure: bool) -> PacketGenerator {
    let mut rng = StdRng::seed_from_u64(1);
    let mut generator = PacketGenerator::new(
        42,
        Perspective::Client,
        QuicVersion::V30,
        DEFAULT_MAX_PACKET_SIZE,
        &mut rng,
    );
    if forward_secure {
        let key = AeadKey::from_bytes([7u8; KEY_SIZE]);
        generator.set_encrypter(
            EncryptionLevel::ForwardSecure,
            Box::new(AeadEncrypter::new(&key, [0, 0, 0, 1])),
        );
        generator.set_encryption_level(EncryptionLevel::ForwardSecure);
    }
    generator
}

fn bench_ack_frame(c: &mut Criterion) {
    let ack = Frame::Ack(AckFrame {
        entropy_hash: 0x5a,
        largest_observed: 10_000,
        ack_delay: Some(Duration::from_millis(3)),
        missing_packets: (9_000..10_000).step_by(10).collect::<BTreeSet<_>>(),
        is_truncated: false,
        latest_revived_packet: 0,
    });
    let mut encoded = BytesMut::new();
    ack.encode(&mut encoded);

    let mut group = c.benchmark_group("ack_frame");
    group.throughput(Throughput::Bytes(encoded.len() as u64));

    group.bench_function("encode_100_missing", |b| {
        b.iter(|| {
            let mut buf = BytesMut::with_capacity(encoded.len());
            black_box(&ack).encode(&mut buf);
            black_box(buf)
        })
    });

    group.bench_function("decode_100_missing", |b| {
        b.iter(|| {
            let mut data = &encoded[1..];
            black_box(Frame::decode_body(encoded[0], &mut data).unwrap())
        })
    });

    group.finish();
}

fn bench_stream_packets(c: &mut Criterion) {
    let payload = vec![0u8; 16 * 1024];

    let mut group = c.benchmark_group("stream_packets");
    group.throughput(Throughput::Bytes(payload.len() as u64));

    for (name, forward_secure) in [("unencrypted", false), ("chacha20poly1305", true)] {
        group.bench_function(name, |b| {
            b.iter_batched(
                || generator(forward_secure),
                |mut generator| {
                    generator
                        .consume_data(5, &payload, 0, false, FecProtection::MayNotFecProtect)
                        .unwrap();
                    black_box(generator.take_packets())
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.bench_function("fec_protected", |b| {
        b.iter_batched(
            || {
                let mut generator = generator(true);
                generator.set_fec_policy(FecSendPolicy::AnyTrigger, 10);
                generator
            },
            |mut generator| {
                generator
                    .consume_data(5, &payload, 0, false, FecProtection::MustFecProtect)
                    .unwrap();
                black_box(generator.take_packets())
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

fn bench_fec(c: &mut Criterion) {
    let mut group = c.benchmark_group("fec");

    for group_size in [4usize, 8, 16] {
        let payloads: Vec<Vec<u8>> = (0..group_size).map(|i| vec![i as u8; 1200]).collect();

        group.bench_function(format!("encode_group_{}", group_size), |b| {
            b.iter(|| {
                let mut encoder = FecEncoder::new();
                encoder.open(1);
                for payload in &payloads {
                    encoder.add_packet(payload);
                }
                black_box(encoder.finish())
            })
        });

        let mut encoder = FecEncoder::new();
        encoder.open(1);
        for payload in &payloads {
            encoder.add_packet(payload);
        }
        let (_, redundancy) = encoder.finish().unwrap();
        let fec_packet = group_size as u64 + 1;

        group.bench_function(format!("revive_group_{}", group_size), |b| {
            b.iter(|| {
                let mut fec_group = FecGroup::new(1);
                // Packet 1 is lost.
                for (i, payload) in payloads.iter().enumerate().skip(1) {
                    fec_group.update(EncryptionLevel::ForwardSecure, i as u64 + 1, payload);
                }
                fec_group.update_fec(EncryptionLevel::ForwardSecure, fec_packet, &redundancy);
                black_box(fec_group.revive())
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_ack_frame, bench_stream_packets, bench_fec);

criterion_main!(benches);
