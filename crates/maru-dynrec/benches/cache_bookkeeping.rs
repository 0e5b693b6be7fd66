//! Cache bookkeeping costs: block lookup on the hot dispatch path, and the
//! insert/invalidate churn a self-modifying guest produces.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use maru_cpu_core::{CpuState, FlatTestBus, PAGE_SIZE};
use maru_dynrec::compile::compile_block;
use maru_dynrec::{CodeCache, DynrecConfig};

fn filled_cache(blocks: u32) -> CodeCache {
    let mut bus = FlatTestBus::new(1 << 20);
    let config = DynrecConfig::default();
    let mut cache = CodeCache::new();
    for i in 0..blocks {
        let eip = 0x1000 + i * 0x40;
        let mut code = vec![0x90u8; 8];
        code.push(0xC3);
        bus.load(eip, &code);
        let mut cpu = CpuState::reset();
        cpu.eip = eip;
        let block = compile_block(&bus, &cpu, &config).expect("nop run compiles");
        cache.insert(block);
    }
    cache
}

fn bench_find(c: &mut Criterion) {
    let cache = filled_cache(256);
    c.bench_function("find_hit", |b| {
        b.iter(|| cache.find(black_box(0x1000 + 128 * 0x40)))
    });
    c.bench_function("find_miss_cold_page", |b| {
        b.iter(|| cache.find(black_box(0x8_0000)))
    });
}

fn bench_churn(c: &mut Criterion) {
    let mut bus = FlatTestBus::new(1 << 20);
    bus.load(0x1000, &[0x90, 0x90, 0x90, 0xC3]);
    let mut cpu = CpuState::reset();
    cpu.eip = 0x1000;
    let config = DynrecConfig::default();

    c.bench_function("insert_invalidate_cycle", |b| {
        let mut cache = CodeCache::new();
        b.iter(|| {
            let block = compile_block(&bus, &cpu, &config).unwrap();
            let id = cache.insert(block);
            cache.invalidate_range(1, 0, PAGE_SIZE as u16);
            black_box(id)
        })
    });
}

criterion_group!(benches, bench_find, bench_churn);
criterion_main!(benches);
