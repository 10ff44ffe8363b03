//! HPTE 缓存基准测试

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use vm_hpte::testing::RecordingHal;
use vm_hpte::{EA_PAGE_MASK, GuestPte, HostPfn, HpteAllocator, HpteCache, HpteConfig};

fn populated(entries: u64) -> HpteCache {
    let config = HpteConfig::default().with_max_entries(entries as usize + 1);
    let allocator = HpteAllocator::sysinit(&config).unwrap();
    let hal: Arc<RecordingHal> = RecordingHal::new();
    let cache = HpteCache::init(0, allocator, hal, &config).unwrap();
    for page in 0..entries {
        let mut slot = cache.cache_next().unwrap();
        slot.pte = GuestPte {
            eaddr: page << 12,
            vpage: page << 12,
            raddr: page << 12,
            ..Default::default()
        };
        slot.pfn = HostPfn(page);
        cache.cache_map(slot);
    }
    cache
}

fn bench_map(c: &mut Criterion) {
    c.bench_function("hpte_map_flush_page", |b| {
        let cache = populated(1024);
        let mut page = 0u64;
        b.iter(|| {
            page = (page + 1) % 1024;
            cache.flush_addr(black_box(page << 12), EA_PAGE_MASK).unwrap();
            let mut slot = cache.cache_next().unwrap();
            slot.pte.eaddr = page << 12;
            slot.pte.vpage = page << 12;
            slot.pfn = HostPfn(page);
            cache.cache_map(slot);
        });
    });
}

fn bench_flush_all(c: &mut Criterion) {
    c.bench_function("hpte_flush_all_4096", |b| {
        b.iter_batched(
            || populated(4096),
            |cache| black_box(cache.flush_all()),
            BatchSize::LargeInput,
        );
    });
}

fn bench_phys_range(c: &mut Criterion) {
    c.bench_function("hpte_flush_phys_range_miss", |b| {
        let cache = populated(4096);
        b.iter(|| black_box(cache.flush_phys_range(u64::MAX - 1, u64::MAX)));
    });
}

criterion_group!(benches, bench_map, bench_flush_all, bench_phys_range);
criterion_main!(benches);
