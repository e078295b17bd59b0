use criterion::{Criterion, Throughput, criterion_group, criterion_main};

use std::net::Ipv4Addr;

use codec::ServiceId;
use svc_stack_service::routing::{RouteSpec, ServiceTable};

fn sid(a: u8, b: u8) -> ServiceId {
    let mut bytes = [0u8; 32];
    bytes[0] = a;
    bytes[1] = b;
    ServiceId::from_bytes(bytes)
}

fn populated_table() -> std::sync::Arc<ServiceTable> {
    let table = ServiceTable::new();

    // A spread of /8 and /16 prefixes with a few instances each.
    for a in 0..64u8 {
        table.add(
            &sid(a, 0),
            8,
            &RouteSpec::forward(Ipv4Addr::new(10, 0, 0, a), 1),
        );

        for b in 0..16u8 {
            let mut spec = RouteSpec::forward(Ipv4Addr::new(10, 0, b, a), 1);
            spec.weight = (b as u32 % 4) + 1;
            table.add(&sid(a, b), 16, &spec);
        }
    }

    table
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing");
    group.throughput(Throughput::Elements(1));

    group.bench_function("resolve_exact", |bencher| {
        let table = populated_table();
        let key = sid(17, 3);

        bencher.iter(|| {
            std::hint::black_box(table.resolve(&key).unwrap());
        });
    });

    group.bench_function("resolve_fallback_to_short_prefix", |bencher| {
        let table = populated_table();
        // Only the /8 matches.
        let mut key = sid(17, 200);
        let mut bytes = *key.as_bytes();
        bytes[31] = 0xFF;
        key = ServiceId::from_bytes(bytes);

        bencher.iter(|| {
            std::hint::black_box(table.resolve(&key).unwrap());
        });
    });

    group.bench_function("resolve_miss", |bencher| {
        let table = populated_table();
        let key = sid(200, 0);

        bencher.iter(|| {
            std::hint::black_box(table.resolve(&key).is_err());
        });
    });

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
