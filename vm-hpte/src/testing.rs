//! 测试用 host MMU
//!
//! 记录每个页帧的 pin / release 次数，用于验证引用计数平衡。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::entry::HpteEntry;
use crate::frame::{HostMmuHal, HostPfn};

/// 记录页帧引用的 host MMU
#[derive(Debug, Default)]
pub struct RecordingHal {
    pins: AtomicU64,
    clean_releases: AtomicU64,
    dirty_releases: AtomicU64,
    host_invalidations: AtomicU64,
    /// 每个页帧当前持有的引用数
    refs: Mutex<HashMap<HostPfn, u64>>,
    /// 释放了未持有引用的页帧
    over_releases: AtomicU64,
}

impl RecordingHal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pins(&self) -> u64 {
        self.pins.load(Ordering::SeqCst)
    }

    pub fn clean_releases(&self) -> u64 {
        self.clean_releases.load(Ordering::SeqCst)
    }

    pub fn dirty_releases(&self) -> u64 {
        self.dirty_releases.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> u64 {
        self.clean_releases() + self.dirty_releases()
    }

    pub fn host_invalidations(&self) -> u64 {
        self.host_invalidations.load(Ordering::SeqCst)
    }

    pub fn over_releases(&self) -> u64 {
        self.over_releases.load(Ordering::SeqCst)
    }

    /// 某个页帧当前的引用数
    pub fn outstanding(&self, pfn: HostPfn) -> u64 {
        self.refs.lock().get(&pfn).copied().unwrap_or(0)
    }

    /// 所有页帧的引用总数
    pub fn total_outstanding(&self) -> u64 {
        self.refs.lock().values().sum()
    }

    fn release(&self, pfn: HostPfn) {
        let mut refs = self.refs.lock();
        match refs.get_mut(&pfn) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    refs.remove(&pfn);
                }
            }
            _ => {
                log::error!("pfn {:#x} released without a reference", pfn);
                self.over_releases.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

impl HostMmuHal for RecordingHal {
    fn pin_pfn(&self, pfn: HostPfn) {
        self.pins.fetch_add(1, Ordering::SeqCst);
        *self.refs.lock().entry(pfn).or_insert(0) += 1;
    }

    fn release_pfn_clean(&self, pfn: HostPfn) {
        self.clean_releases.fetch_add(1, Ordering::SeqCst);
        self.release(pfn);
    }

    fn release_pfn_dirty(&self, pfn: HostPfn) {
        self.dirty_releases.fetch_add(1, Ordering::SeqCst);
        self.release(pfn);
    }

    fn invalidate_host_pte(&self, _entry: &HpteEntry) {
        self.host_invalidations.fetch_add(1, Ordering::SeqCst);
    }
}
