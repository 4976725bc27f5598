use candle_core::{Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use decoder::{DecoderConfig, DecoderLayer, FeedForwardKind, ModelMode, ShardingContext};

fn bench_layer(c: &mut Criterion) {
    let device = Device::Cpu;
    let mut group = c.benchmark_group("decoder_layer");
    for dtype in ["float32", "bfloat16"] {
        let config = DecoderConfig {
            emb_dim: 256,
            num_query_heads: 8,
            q_lora_rank: 64,
            kv_lora_rank: 64,
            qk_nope_head_dim: 32,
            qk_rope_head_dim: 16,
            head_dim: 32,
            mlp_dim: 128,
            num_experts: 8,
            num_experts_per_tok: 2,
            dtype: dtype.to_string(),
            ..DecoderConfig::default()
        };
        let (batch, seq) = (2usize, 64usize);
        let input = Tensor::randn(0f32, 1.0, (batch, seq, config.emb_dim), &device).expect("input");
        let positions = Tensor::arange(0u32, seq as u32, &device)
            .and_then(|t| t.unsqueeze(0))
            .and_then(|t| t.repeat((batch, 1)))
            .expect("positions");
        for kind in [FeedForwardKind::Dense, FeedForwardKind::MixtureOfExperts] {
            let layer = DecoderLayer::new(&config, kind, 0, ShardingContext::default(), &device)
                .expect("layer init");
            group.throughput(Throughput::Elements((batch * seq) as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("{kind:?}"), dtype),
                &(layer, input.clone(), positions.clone()),
                |b, (layer, input, positions)| {
                    b.iter(|| {
                        black_box(
                            layer
                                .forward(black_box(input), None, positions, true, ModelMode::Train, None)
                                .expect("forward"),
                        )
                    });
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, bench_layer);
criterion_main!(benches);
