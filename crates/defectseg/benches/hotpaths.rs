use criterion::{black_box, criterion_group, criterion_main, Criterion};
use defectseg::image::{letterbox, resize_bilinear, PixelBuffer, LETTERBOX_PAD_VALUE};
use defectseg::threshold::{threshold, MaskValues};
use defectseg::weights::{InMemoryWeights, ModelWeights, Tensor};
use defectseg::{ComputeEngine, CpuEngine, EngineConfig, Topology};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn noise_image(w: usize, h: usize, channels: usize, seed: u64) -> PixelBuffer {
    let mut rng = StdRng::seed_from_u64(seed);
    let data = (0..w * h * channels)
        .map(|_| rng.gen_range(0.0f32..255.0))
        .collect();
    PixelBuffer::from_vec(w, h, channels, data).unwrap()
}

/// One-channel weights for every layer; keeps the full plan cheap enough to
/// time the graph walk and conv plumbing rather than raw FLOPs.
fn narrow_weights(topology: &Topology) -> InMemoryWeights {
    let mut rng = StdRng::seed_from_u64(11);
    let mut source = InMemoryWeights::new();
    for (i, spec) in topology.layers.iter().enumerate() {
        let cin = if i == topology.stem.conv.0 {
            topology.input.channels
        } else if topology.decoder.iter().any(|d| d.conv.0 == i) {
            2
        } else {
            1
        };
        let k = spec.kernel;
        let kernel = (0..k * k * cin).map(|_| rng.gen_range(-0.1f32..0.1)).collect();
        source.insert(
            format!("{}/kernel:0", spec.conv),
            Tensor::new(&[k, k, cin, 1], kernel).unwrap(),
        );
        source.insert(
            format!("{}/bias:0", spec.conv),
            Tensor::new(&[1], vec![0.0]).unwrap(),
        );
        if let Some(bn) = spec.bn {
            for (suffix, value) in [
                ("gamma", 1.0),
                ("beta", 0.0),
                ("moving_mean", 0.0),
                ("moving_variance", 1.0),
            ] {
                source.insert(
                    format!("{bn}/{suffix}:0"),
                    Tensor::new(&[1], vec![value]).unwrap(),
                );
            }
        }
    }
    source
}

fn bench_resize(c: &mut Criterion) {
    let img = noise_image(1280, 1024, 3, 7);

    c.bench_function("resize_bilinear_1280x1024_to_224x179", |b| {
        b.iter(|| black_box(resize_bilinear(black_box(&img), 224, 179)))
    });
}

fn bench_letterbox(c: &mut Criterion) {
    let wide = noise_image(1920, 1080, 3, 9);
    let tall = noise_image(480, 640, 3, 13);

    c.bench_function("letterbox_1920x1080", |b| {
        b.iter(|| black_box(letterbox(black_box(&wide), 224, 224, LETTERBOX_PAD_VALUE)))
    });

    c.bench_function("letterbox_480x640", |b| {
        b.iter(|| black_box(letterbox(black_box(&tall), 224, 224, LETTERBOX_PAD_VALUE)))
    });
}

fn bench_threshold(c: &mut Criterion) {
    let mut probs = noise_image(224, 224, 1, 3);
    for v in probs.data_mut() {
        *v /= 255.0;
    }
    let out = Topology::reference().output;

    c.bench_function("threshold_224x224", |b| {
        b.iter(|| {
            let mask = threshold(black_box(&probs), out, 0.15, MaskValues::default()).unwrap();
            black_box(mask.foreground_count())
        })
    });
}

fn bench_plan(c: &mut Criterion) {
    let topology = Topology::reference();

    c.bench_function("build_reference_plan", |b| {
        b.iter(|| black_box(topology.build_plan().unwrap().len()))
    });
}

fn bench_cpu_forward(c: &mut Criterion) {
    let topology = Topology::reference();
    let plan = topology.build_plan().unwrap();
    let weights = ModelWeights::bind(topology, &narrow_weights(topology)).unwrap();
    let engine = CpuEngine::new(&EngineConfig::default()).unwrap();
    let input = letterbox(&noise_image(640, 480, 3, 21), 224, 224, LETTERBOX_PAD_VALUE);

    c.bench_function("cpu_forward_narrow_224", |b| {
        b.iter(|| {
            let out = engine
                .execute(&plan, topology, &weights, black_box(&input))
                .unwrap();
            black_box(out.data()[0])
        })
    });
}

criterion_group!(
    hotpaths,
    bench_resize,
    bench_letterbox,
    bench_threshold,
    bench_plan,
    bench_cpu_forward
);
criterion_main!(hotpaths);
