//! Benchmarks for the activation cache.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use act_cache::cache::codec::{Codec, GroupQuantizer};
use act_cache::cache::controller::CacheController;
use act_cache::cache::identity::fingerprint;
use act_cache::config::Config;
use act_cache::tensor::Tensor;

fn activation() -> Tensor {
    // 8 × 64 × 32 × 32 floats (2 MB).
    Tensor::from_fn(vec![8, 64, 32, 32], |i| ((i as f32) * 0.013).sin()).with_requires_grad(true)
}

fn bench_quantizer(c: &mut Criterion) {
    let codec = GroupQuantizer::default();
    let t = activation();

    for bits in [2u8, 4, 8] {
        c.bench_function(&format!("quantize_{bits}bit_2mb"), |b| {
            b.iter(|| black_box(codec.compress(black_box(&t), bits).unwrap()))
        });
    }

    let payload = codec.compress(&t, 4).unwrap();
    c.bench_function("dequantize_4bit_2mb", |b| {
        b.iter(|| black_box(codec.decompress(black_box(&payload), t.shape()).unwrap()))
    });
}

fn bench_fingerprint(c: &mut Criterion) {
    let t = activation();
    c.bench_function("fingerprint_2mb", |b| b.iter(|| black_box(fingerprint(black_box(&t)))));
}

fn bench_save_restore(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let t = activation();

    for offload in [false, true] {
        let mut config = Config::default();
        config.controller.offload_to_host = offload;
        let mut cache = rt.block_on(async { CacheController::new(&config) }).unwrap();
        let name = if offload {
            "save_restore_offload"
        } else {
            "save_restore_device"
        };

        c.bench_function(name, |b| {
            b.iter(|| {
                rt.block_on(async {
                    let saved = cache.save(t.clone()).unwrap();
                    let out = cache.restore(saved).await.unwrap();
                    cache.end_step();
                    black_box(out);
                })
            })
        });
    }
}

criterion_group!(benches, bench_quantizer, bench_fingerprint, bench_save_restore);
criterion_main!(benches);
