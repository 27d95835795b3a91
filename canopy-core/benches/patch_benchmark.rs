use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use canopy_core::{apply, PatchOp, UiNode};
use serde_json::json;
use std::sync::Arc;

/// A page-like tree: `sections` columns of `per_section` text widgets.
fn build_page(sections: usize, per_section: usize) -> Arc<UiNode> {
    let columns = (0..sections)
        .map(|s| {
            let widgets = (0..per_section)
                .map(|w| {
                    UiNode::new("text", format!("s{s}w{w}"))
                        .with_prop("value", json!(w))
                        .into_shared()
                })
                .collect();
            UiNode::new("column", format!("s{s}"))
                .with_children(widgets)
                .into_shared()
        })
        .collect();
    UiNode::new("app", "root").with_children(columns).into_shared()
}

fn bench_update_props_deep(c: &mut Criterion) {
    let tree = build_page(50, 40);
    let ops = vec![PatchOp::UpdateProps {
        id: "s49w39".into(),
        props: json!({ "value": "changed" }).as_object().unwrap().clone(),
    }];

    c.bench_function("update_props_2k_nodes", |b| {
        b.iter(|| black_box(apply(black_box(&tree), black_box(&ops))))
    });
}

fn bench_mixed_batch(c: &mut Criterion) {
    let tree = build_page(50, 40);
    let mut ops = Vec::new();
    for s in 0..50 {
        ops.push(PatchOp::InsertChild {
            parent_id: format!("s{s}"),
            index: 0,
            node: UiNode::new("text", format!("new{s}")).into_shared(),
        });
        ops.push(PatchOp::Remove { id: format!("s{s}w5") });
    }

    c.bench_function("mixed_batch_100_ops", |b| {
        b.iter(|| black_box(apply(black_box(&tree), black_box(&ops))))
    });
}

fn bench_decode_ops(c: &mut Criterion) {
    let raw: Vec<serde_json::Value> = (0..100)
        .map(|i| json!({ "op": "updateProps", "id": format!("w{i}"), "props": { "value": i } }))
        .collect();
    let raw = serde_json::Value::Array(raw);

    c.bench_function("parse_100_ops", |b| {
        b.iter(|| {
            let ops: Vec<PatchOp> = serde_json::from_value(black_box(raw.clone())).unwrap();
            black_box(ops)
        })
    });
}

criterion_group!(benches, bench_update_props_deep, bench_mixed_batch, bench_decode_ops);
criterion_main!(benches);
