use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use canopy_sync::decoder::WireDecoder;
use canopy_sync::intern::InternTable;
use serde_json::{json, Value};

fn plain_patch(ops: usize) -> String {
    let ops: Vec<Value> = (0..ops)
        .map(|i| json!({ "op": "updateProps", "id": format!("w{i}"), "props": { "value": i } }))
        .collect();
    json!({ "type": "render_patch", "rev": 1, "ops": ops }).to_string()
}

fn card(i: usize) -> Value {
    json!({
        "type": "card", "id": format!("c{i}"),
        "children": [
            { "type": "text", "id": format!("c{i}t"), "props": { "value": "title" } },
            { "type": "button", "id": format!("c{i}b"), "props": { "label": "Open" } }
        ]
    })
}

fn bench_plain_decode(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let frame = plain_patch(100);
    let mut decoder = WireDecoder::default();

    c.bench_function("decode_plain_100_ops", |b| {
        b.iter(|| black_box(rt.block_on(decoder.decode(black_box(&frame))).unwrap()))
    });
}

fn bench_compact_refs(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut decoder = WireDecoder::default();

    let defs: Vec<Value> = (0..50)
        .map(|i| json!({ "op": "replace", "id": format!("c{i}"), "node": { "$def": [format!("k{i}"), card(i)] } }))
        .collect();
    let define = json!({ "type": "render_patch_compact", "ops": defs }).to_string();
    rt.block_on(decoder.decode(&define)).unwrap();

    let refs: Vec<Value> = (0..50)
        .map(|i| json!({ "op": "replace", "id": format!("c{i}"), "node": { "$ref": format!("k{i}") } }))
        .collect();
    let frame = json!({ "type": "render_patch_compact", "ops": refs }).to_string();

    c.bench_function("decode_compact_50_refs", |b| {
        b.iter(|| black_box(rt.block_on(decoder.decode(black_box(&frame))).unwrap()))
    });
}

#[cfg(feature = "deflate")]
fn bench_compressed_decode(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let ops: Vec<Value> = (0..100)
        .map(|i| json!({ "op": "replace", "id": format!("c{i}"), "node": card(i) }))
        .collect();
    let payload = canopy_sync::decoder::deflate_payload(&json!({ "ops": ops })).unwrap();
    let frame = json!({ "type": "render_patch_z", "rev": 1, "ops": payload }).to_string();
    let mut decoder = WireDecoder::default();

    c.bench_function("decode_compressed_100_ops", |b| {
        b.iter(|| black_box(rt.block_on(decoder.decode(black_box(&frame))).unwrap()))
    });
}

#[cfg(not(feature = "deflate"))]
fn bench_compressed_decode(_: &mut Criterion) {}

fn bench_intern_churn(c: &mut Criterion) {
    let payload = card(0);

    c.bench_function("intern_define_resolve_evict", |b| {
        b.iter(|| {
            let mut table = InternTable::new(64);
            for i in 0..256 {
                table.define(format!("k{i}"), payload.clone());
                black_box(table.resolve(&format!("k{}", i / 2)));
            }
            black_box(table.evictions())
        })
    });
}

criterion_group!(
    benches,
    bench_plain_decode,
    bench_compact_refs,
    bench_compressed_decode,
    bench_intern_churn,
);
criterion_main!(benches);
