//! 集成测试公共工具

#![allow(dead_code)]

use std::sync::Arc;

use vm_hpte::testing::RecordingHal;
use vm_hpte::{GuestPte, HostPfn, HpteAllocator, HpteCache, HpteConfig, HpteHandle};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Fixture {
    pub cache: HpteCache,
    pub hal: Arc<RecordingHal>,
    pub allocator: Arc<HpteAllocator>,
}

pub fn fixture(max_entries: usize) -> Fixture {
    fixture_with(HpteConfig::default().with_max_entries(max_entries))
}

pub fn fixture_with(config: HpteConfig) -> Fixture {
    init_logger();
    let allocator = HpteAllocator::sysinit(&config).expect("sysinit");
    let hal = RecordingHal::new();
    let cache = HpteCache::init(0, Arc::clone(&allocator), hal.clone(), &config).expect("init");
    Fixture {
        cache,
        hal,
        allocator,
    }
}

pub fn map(cache: &HpteCache, eaddr: u64, vpage: u64, raddr: u64) -> HpteHandle {
    map_with(cache, eaddr, vpage, raddr, false)
}

pub fn map_with(cache: &HpteCache, eaddr: u64, vpage: u64, raddr: u64, may_write: bool) -> HpteHandle {
    let mut slot = cache.cache_next().expect("cache_next");
    slot.pte = GuestPte {
        eaddr,
        vpage,
        raddr,
        may_read: true,
        may_write,
        may_execute: false,
    };
    slot.pfn = HostPfn(0x10_0000 + raddr);
    cache.cache_map(slot)
}
