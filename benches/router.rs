//! Router lookup throughput, grounded on the routing table shapes exercised
//! by `src/router.rs`'s own scenario test (flat, nested, and default-miss
//! paths).

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fiberweb::router::Router;

fn build_router(routes: usize) -> Router {
    let mut router = Router::new();
    for i in 0..routes {
        router.add(&format!("/api/v1/resource-{i}"), format!("handler-{i}")).unwrap();
    }
    router.add("/", "root").unwrap();
    router
}

fn bench_router(c: &mut Criterion) {
    let router = build_router(256);

    c.bench_function("router_find_hit_shallow", |b| {
        b.iter(|| router.find(black_box("/api/v1/resource-1")));
    });

    c.bench_function("router_find_hit_nested", |b| {
        b.iter(|| router.find(black_box("/api/v1/resource-200/sub/path")));
    });

    c.bench_function("router_find_default_miss", |b| {
        b.iter(|| router.find(black_box("/does/not/exist")));
    });

    c.bench_function("router_add_single_route", |b| {
        b.iter(|| {
            let mut router = Router::new();
            router.add(black_box("/a/b/c"), "handler").unwrap();
        });
    });
}

criterion_group!(benches, bench_router);
criterion_main!(benches);
