use criterion::{Criterion, black_box, criterion_group, criterion_main};
use kiln_core::{Digest, DigestFrame};

fn bench_frame_digest(c: &mut Criterion) {
    let inputs: Vec<(String, String)> = (0..64)
        .map(|i| {
            let name = format!("input-{i:02}");
            let digest = Digest::of_bytes(name.as_bytes()).to_string();
            (name, digest)
        })
        .collect();

    c.bench_function("frame_digest_64_inputs", |b| {
        b.iter(|| {
            let mut frame = DigestFrame::new("bench", "bench::Node", 0);
            for (name, digest) in &inputs {
                frame.entry(name.as_str(), digest.as_str());
            }
            black_box(frame.digest())
        })
    });

    c.bench_function("json_value_digest", |b| {
        let value = serde_json::json!({"image": "alpine:3.19", "platforms": ["linux/amd64", "linux/arm64"]});
        b.iter(|| black_box(Digest::of_json(&value)))
    });
}

criterion_group!(benches, bench_frame_digest);
criterion_main!(benches);
