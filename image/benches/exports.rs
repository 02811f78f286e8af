use criterion::{criterion_group, criterion_main, Criterion};
use graft_image::ExeImage;

fn bench_parse_and_lookup(c: &mut Criterion) {
    let own_exe = std::env::current_exe().expect("current exe");
    let data = std::fs::read(&own_exe).expect("read own image");

    c.bench_function("parse_own_image", |b| {
        b.iter(|| ExeImage::from_bytes(std::hint::black_box(&data)).ok())
    });

    if let Ok(image) = ExeImage::from_bytes(&data) {
        if let Some(first) = image.exports().first().map(|e| e.name.clone()) {
            c.bench_function("export_lookup", |b| {
                b.iter(|| image.export(std::hint::black_box(&first)))
            });
        }
    }
}

criterion_group!(benches, bench_parse_and_lookup);
criterion_main!(benches);
