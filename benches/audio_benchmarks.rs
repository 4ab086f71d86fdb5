//! Performance benchmarks for the audio framing paths
//!
//! Run with: cargo bench
//! Or for specific benchmarks: cargo bench -- <filter>

use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use parli_realtime::core::audio::{
    decode_base64, decode_peer_payload, downsample_by_two, encode_base64, encode_peer_payload,
    pcm16_to_samples, samples_to_pcm16,
};
use parli_realtime::core::realtime::{ClientEvent, ServerEvent};

/// 20ms, 100ms and 1s of 16kHz PCM16
const FRAME_SIZES: [usize; 3] = [640, 3_200, 32_000];

fn sine_pcm(len: usize) -> Vec<u8> {
    let samples: Vec<i16> = (0..len / 2)
        .map(|i| ((i as f32 * 0.05).sin() * 12_000.0) as i16)
        .collect();
    samples_to_pcm16(&samples).to_vec()
}

/// Base64 framing used by the stream transport in both directions
fn bench_base64_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("base64_framing");
    group.measurement_time(Duration::from_secs(5));

    for size in FRAME_SIZES {
        let pcm = sine_pcm(size);
        let encoded = encode_base64(&pcm);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &pcm, |b, pcm| {
            b.iter(|| encode_base64(black_box(pcm)));
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, encoded| {
            b.iter(|| decode_base64(black_box(encoded)));
        });
        group.bench_with_input(BenchmarkId::new("append_event", size), &pcm, |b, pcm| {
            b.iter(|| serde_json::to_string(&ClientEvent::audio_append(black_box(pcm))));
        });
    }

    group.finish();
}

/// Inbound audio delta parsing
fn bench_delta_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("delta_parsing");

    let delta = format!(
        r#"{{"type":"response.audio.delta","response_id":"resp_1","item_id":"item_1","delta":"{}"}}"#,
        encode_base64(&sine_pcm(3_200))
    );
    group.throughput(Throughput::Bytes(delta.len() as u64));
    group.bench_function("response_audio_delta", |b| {
        b.iter(|| ServerEvent::parse(black_box(&delta)));
    });

    group.finish();
}

/// Peer transport media path: resample plus mu-law companding
fn bench_peer_payload(c: &mut Criterion) {
    let mut group = c.benchmark_group("peer_payload");

    for size in FRAME_SIZES {
        let pcm = sine_pcm(size);
        let payload = encode_peer_payload(&pcm);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &pcm, |b, pcm| {
            b.iter(|| encode_peer_payload(black_box(pcm)));
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &payload, |b, payload| {
            b.iter(|| decode_peer_payload(black_box(payload)));
        });
    }

    group.finish();
}

fn bench_resampling(c: &mut Criterion) {
    let mut group = c.benchmark_group("resampling");

    let samples = pcm16_to_samples(&sine_pcm(32_000));
    group.throughput(Throughput::Elements(samples.len() as u64));
    group.bench_function("downsample_by_two_1s", |b| {
        b.iter(|| downsample_by_two(black_box(&samples)));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_base64_framing,
    bench_delta_parsing,
    bench_peer_payload,
    bench_resampling,
);

criterion_main!(benches);
