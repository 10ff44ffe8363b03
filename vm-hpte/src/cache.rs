//! 每个 vCPU 的 shadow HPTE 缓存
//!
//! 一个条目同时挂在四张哈希表上，支持四种粒度的失效：
//! 按有效地址（页 / 块）、按虚拟页号（短 / 长），外加全量刷新
//! 和按 guest 实地址范围刷新。
//!
//! ## 并发
//! - 每个 vCPU 一把读写锁，插入和移除持写锁，保证"四张表全在或全不在"
//! - 失效分两阶段：读锁下收集候选，写锁下按句柄代数逐个摘除，
//!   重复或并发的失效因此是无操作
//! - 条目以 `Arc` 发布，读者持有的克隆在条目被移除后依然有效；
//!   页帧引用在移除时立即释放，不等待读者
//! - 页帧释放和 host HTAB 回调在锁外执行
//! - 上限按"存活条目 + 已发出未映射的槽位"计算，`cache_next` 预留名额，
//!   `cache_map` 把名额转为存活条目

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::config::HpteConfig;
use crate::entry::{HpteEntry, HpteSlot};
use crate::error::{HpteError, HpteResult};
use crate::flush::{EaFlushMask, FlushKind, VpFlushMask};
use crate::frame::{HostMmuHal, PinnedFrame};
use crate::slab::{EntrySlab, HpteAllocator, HpteHandle};
use crate::tables::{HpteTables, TableKind};

/// 缓存统计信息
#[derive(Debug, Default)]
pub struct HpteStats {
    /// 映射次数
    pub maps: AtomicU64,
    /// 被移除的条目数
    pub invalidations: AtomicU64,
    pub flush_page: AtomicU64,
    pub flush_block: AtomicU64,
    pub flush_all: AtomicU64,
    pub vflush_short: AtomicU64,
    pub vflush_long: AtomicU64,
    pub pflush: AtomicU64,
    /// 达到条目上限触发的全量刷新
    pub ceiling_flushes: AtomicU64,
    /// 非法掩码的刷新请求
    pub invalid_masks: AtomicU64,
    /// 存活条目峰值
    pub peak_entries: AtomicUsize,
}

impl HpteStats {
    fn counter(&self, kind: FlushKind) -> &AtomicU64 {
        match kind {
            FlushKind::Page => &self.flush_page,
            FlushKind::Block => &self.flush_block,
            FlushKind::All => &self.flush_all,
            FlushKind::VpageShort => &self.vflush_short,
            FlushKind::VpageLong => &self.vflush_long,
            FlushKind::PhysRange => &self.pflush,
        }
    }
}

/// 缓存统计信息快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HpteStatsSnapshot {
    pub vcpu_id: u32,
    pub maps: u64,
    pub invalidations: u64,
    pub flush_page: u64,
    pub flush_block: u64,
    pub flush_all: u64,
    pub vflush_short: u64,
    pub vflush_long: u64,
    pub pflush: u64,
    pub ceiling_flushes: u64,
    pub invalid_masks: u64,
    pub live_entries: usize,
    pub peak_entries: usize,
}

/// slab 中的一项：已发布的条目和它持有的页帧引用
#[derive(Debug)]
struct Mapped {
    entry: Arc<HpteEntry>,
    frame: PinnedFrame,
}

#[derive(Debug)]
struct HpteState {
    slab: EntrySlab<Mapped>,
    tables: HpteTables,
}

/// `cache_next` 预留的一个条目名额，drop 时归还
#[derive(Debug)]
pub(crate) struct SlotReservation {
    reserved: Arc<AtomicUsize>,
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        self.reserved.fetch_sub(1, Ordering::AcqRel);
    }
}

impl HpteState {
    /// 从 slab 和四张表中同时摘除
    fn unlink(&mut self, handle: HpteHandle) -> Option<Mapped> {
        let mapped = self.slab.remove(handle)?;
        self.tables.unlink(handle, &mapped.entry);
        Some(mapped)
    }
}

/// 单个 vCPU 的 shadow HPTE 缓存
pub struct HpteCache {
    vcpu_id: u32,
    /// 条目上限
    ceiling: usize,
    allocator: Arc<HpteAllocator>,
    hal: Arc<dyn HostMmuHal>,
    state: RwLock<HpteState>,
    /// 存活条目数，写锁下更新
    live: AtomicUsize,
    /// 已发出但尚未映射或归还的槽位数
    reserved: Arc<AtomicUsize>,
    /// 非法掩码直接 panic
    trap_invalid_masks: bool,
    stats: HpteStats,
}

impl HpteCache {
    /// 为 vCPU 创建空缓存
    pub fn init(
        vcpu_id: u32,
        allocator: Arc<HpteAllocator>,
        hal: Arc<dyn HostMmuHal>,
        config: &HpteConfig,
    ) -> HpteResult<Self> {
        config.validate()?;
        log::debug!(
            "hpte vcpu{}: init cache (ceiling {})",
            vcpu_id,
            config.max_entries_per_vcpu
        );

        Ok(Self {
            vcpu_id,
            ceiling: config.max_entries_per_vcpu,
            allocator,
            hal,
            state: RwLock::new(HpteState {
                slab: EntrySlab::new(),
                tables: HpteTables::new(),
            }),
            live: AtomicUsize::new(0),
            reserved: Arc::new(AtomicUsize::new(0)),
            trap_invalid_masks: config.trap_invalid_masks,
            stats: HpteStats::default(),
        })
    }

    /// 分配一个空槽位
    ///
    /// 存活条目加上已发出的槽位达到上限时先整体刷新，再分配。
    /// 上限因此是硬上限且通常自愈；只有调用方手里未映射的槽位
    /// 本身就占满上限时才返回 `AllocationFailed`。对象池耗尽同样返回
    /// `AllocationFailed`。
    pub fn cache_next(&self) -> HpteResult<HpteSlot> {
        let reservation = match self.reserve() {
            Some(reservation) => reservation,
            None => {
                log::debug!(
                    "hpte vcpu{}: {} entries + {} slots reached ceiling, flushing",
                    self.vcpu_id,
                    self.len(),
                    self.reserved()
                );
                self.stats.ceiling_flushes.fetch_add(1, Ordering::Relaxed);
                self.flush_all();
                self.reserve().ok_or_else(|| {
                    let err = HpteError::allocation(format!(
                        "vcpu{}: {} unmapped slots hold the whole ceiling",
                        self.vcpu_id,
                        self.reserved()
                    ));
                    log::debug!("hpte {}", err);
                    err
                })?
            }
        };

        let pool = self.allocator.alloc().inspect_err(|err| {
            log::debug!("hpte vcpu{}: {}", self.vcpu_id, err);
        })?;
        Ok(HpteSlot::new(pool, reservation))
    }

    /// 在上限内预留一个名额
    fn reserve(&self) -> Option<SlotReservation> {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |reserved| {
                (self.len() + reserved < self.ceiling).then_some(reserved + 1)
            })
            .ok()?;
        Some(SlotReservation {
            reserved: Arc::clone(&self.reserved),
        })
    }

    /// 发布一个填好的槽位
    ///
    /// pin 住 host 页帧，然后在一次写锁内挂到全部四张表上。
    pub fn cache_map(&self, slot: HpteSlot) -> HpteHandle {
        let frame = PinnedFrame::pin(Arc::clone(&self.hal), slot.pfn, slot.pte.may_write);
        let (entry, reservation) = slot.into_parts();
        let entry = Arc::new(entry);

        let handle = {
            let mut state = self.state.write();
            let handle = state.slab.insert(Mapped {
                entry: Arc::clone(&entry),
                frame,
            });
            state.tables.link(handle, &entry);

            let live = state.slab.len();
            self.live.store(live, Ordering::Release);
            self.stats.peak_entries.fetch_max(live, Ordering::Relaxed);
            handle
        };
        // 存活计数已包含该条目，名额可以归还
        drop(reservation);

        self.stats.maps.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "hpte vcpu{}: map ea={:#x} vp={:#x} ra={:#x} -> pfn {:#x}",
            self.vcpu_id,
            entry.eaddr(),
            entry.vpage(),
            entry.raddr(),
            entry.pfn()
        );
        handle
    }

    /// 归还一个不再映射的槽位
    pub fn cache_free(&self, slot: HpteSlot) {
        log::trace!("hpte vcpu{}: free unmapped slot", self.vcpu_id);
        drop(slot);
    }

    pub fn get(&self, handle: HpteHandle) -> Option<Arc<HpteEntry>> {
        let state = self.state.read();
        state.slab.get(handle).map(|mapped| Arc::clone(&mapped.entry))
    }

    /// 句柄对应的条目是否仍在缓存中
    pub fn contains(&self, handle: HpteHandle) -> bool {
        self.state.read().slab.get(handle).is_some()
    }

    /// 在一张表中按（掩码后的）键查找条目
    pub fn find(&self, kind: TableKind, key: u64) -> Option<Arc<HpteEntry>> {
        let key = key & kind.mask();
        let state = self.state.read();
        state
            .tables
            .bucket(kind, kind.bucket(key))
            .iter()
            .filter_map(|handle| state.slab.get(*handle))
            .find(|mapped| kind.key_of(&mapped.entry) == key)
            .map(|mapped| Arc::clone(&mapped.entry))
    }

    /// 遍历 vpte_long 表得到的全部存活条目
    pub fn entries(&self) -> Vec<Arc<HpteEntry>> {
        let state = self.state.read();
        state
            .tables
            .iter(TableKind::VpteLong)
            .filter_map(|handle| state.slab.get(handle))
            .map(|mapped| Arc::clone(&mapped.entry))
            .collect()
    }

    /// 某张表中挂着的句柄数
    pub fn table_len(&self, kind: TableKind) -> usize {
        self.state.read().tables.len(kind)
    }

    /// 存活条目数
    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// 已发出但尚未映射的槽位数
    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn vcpu_id(&self) -> u32 {
        self.vcpu_id
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn allocator(&self) -> &Arc<HpteAllocator> {
        &self.allocator
    }

    /// 使单个条目失效；条目已被移除时返回 false
    pub fn invalidate(&self, handle: HpteHandle) -> bool {
        let removed = {
            let mut state = self.state.write();
            let removed = state.unlink(handle);
            self.live.store(state.slab.len(), Ordering::Release);
            removed
        };
        match removed {
            Some(mapped) => self.release(vec![mapped]) == 1,
            None => false,
        }
    }

    /// 按有效地址刷新
    ///
    /// `ea_mask` 必须是 `EA_PAGE_MASK`、`EA_BLOCK_MASK` 或 `0`。其它值是调用方 bug：
    /// 记录错误日志，不刷新任何条目，返回 `InvalidEaMask`。
    pub fn flush_addr(&self, guest_ea: u64, ea_mask: u64) -> HpteResult<usize> {
        match EaFlushMask::try_from(ea_mask) {
            Ok(mask) => Ok(self.flush_ea(guest_ea, mask)),
            Err(err) => Err(self.reject(err)),
        }
    }

    /// 按虚拟页号刷新
    ///
    /// `vp_mask` 必须是 `VP_SHORT_MASK` 或 `VP_LONG_MASK`。
    pub fn flush_vpage(&self, guest_vp: u64, vp_mask: u64) -> HpteResult<usize> {
        match VpFlushMask::try_from(vp_mask) {
            Ok(mask) => Ok(self.flush_vp(guest_vp, mask)),
            Err(err) => Err(self.reject(err)),
        }
    }

    pub fn flush_ea(&self, guest_ea: u64, mask: EaFlushMask) -> usize {
        let guest_ea = guest_ea & mask.bits();
        let count = match mask {
            EaFlushMask::Page => self.flush_key(TableKind::Pte, guest_ea),
            EaFlushMask::Block => self.flush_key(TableKind::PteLong, guest_ea),
            EaFlushMask::All => return self.flush_all(),
        };
        self.record_flush(mask.into(), guest_ea, count);
        count
    }

    pub fn flush_vp(&self, guest_vp: u64, mask: VpFlushMask) -> usize {
        let guest_vp = guest_vp & mask.bits();
        let count = match mask {
            VpFlushMask::Short => self.flush_key(TableKind::Vpte, guest_vp),
            VpFlushMask::Long => self.flush_key(TableKind::VpteLong, guest_vp),
        };
        self.record_flush(mask.into(), guest_vp, count);
        count
    }

    /// 刷新 guest 实地址落在 `[pa_start, pa_end)` 内的条目
    pub fn flush_phys_range(&self, pa_start: u64, pa_end: u64) -> usize {
        let count = if pa_start < pa_end {
            self.invalidate_where(TableKind::VpteLong, None, |entry| {
                (pa_start..pa_end).contains(&entry.raddr())
            })
        } else {
            0
        };
        self.record_flush(FlushKind::PhysRange, pa_start, count);
        count
    }

    /// 刷新全部条目
    pub fn flush_all(&self) -> usize {
        let count = self.invalidate_where(TableKind::VpteLong, None, |_| true);
        self.record_flush(FlushKind::All, 0, count);
        count
    }

    /// vCPU 销毁时调用，等价于全量刷新
    pub fn destroy(&self) -> usize {
        log::debug!("hpte vcpu{}: destroy", self.vcpu_id);
        self.flush_all()
    }

    /// 获取统计信息快照
    pub fn stats(&self) -> HpteStatsSnapshot {
        let s = &self.stats;
        HpteStatsSnapshot {
            vcpu_id: self.vcpu_id,
            maps: s.maps.load(Ordering::Relaxed),
            invalidations: s.invalidations.load(Ordering::Relaxed),
            flush_page: s.flush_page.load(Ordering::Relaxed),
            flush_block: s.flush_block.load(Ordering::Relaxed),
            flush_all: s.flush_all.load(Ordering::Relaxed),
            vflush_short: s.vflush_short.load(Ordering::Relaxed),
            vflush_long: s.vflush_long.load(Ordering::Relaxed),
            pflush: s.pflush.load(Ordering::Relaxed),
            ceiling_flushes: s.ceiling_flushes.load(Ordering::Relaxed),
            invalid_masks: s.invalid_masks.load(Ordering::Relaxed),
            live_entries: self.len(),
            peak_entries: s.peak_entries.load(Ordering::Relaxed),
        }
    }

    /// 单桶刷新：键（已掩码）相等即匹配
    fn flush_key(&self, kind: TableKind, key: u64) -> usize {
        self.invalidate_where(kind, Some(kind.bucket(key)), |entry| {
            kind.key_of(entry) == key
        })
    }

    /// 遍历一张表（单个桶或全部桶），移除满足条件的条目
    fn invalidate_where<P>(&self, kind: TableKind, bucket: Option<usize>, pred: P) -> usize
    where
        P: Fn(&HpteEntry) -> bool,
    {
        let victims: Vec<HpteHandle> = {
            let state = self.state.read();
            let matches = |handle: &HpteHandle| {
                state
                    .slab
                    .get(*handle)
                    .is_some_and(|mapped| pred(&*mapped.entry))
            };
            match bucket {
                Some(index) => state
                    .tables
                    .bucket(kind, index)
                    .iter()
                    .copied()
                    .filter(|handle| matches(handle))
                    .collect::<Vec<_>>(),
                None => state
                    .tables
                    .iter(kind)
                    .filter(|handle| matches(handle))
                    .collect::<Vec<_>>(),
            }
        };

        if victims.is_empty() {
            return 0;
        }

        let removed: Vec<Mapped> = {
            let mut state = self.state.write();
            let removed: Vec<Mapped> = victims
                .into_iter()
                .filter_map(|handle| state.unlink(handle))
                .collect();
            self.live.store(state.slab.len(), Ordering::Release);
            removed
        };
        self.release(removed)
    }

    /// 锁外收尾：通知 host HTAB，释放页帧引用
    fn release(&self, removed: Vec<Mapped>) -> usize {
        let count = removed.len();
        for mapped in removed {
            self.hal.invalidate_host_pte(&mapped.entry);
            log::trace!(
                "hpte vcpu{}: invalidate ea={:#x} vp={:#x} pfn {:#x}{}",
                self.vcpu_id,
                mapped.entry.eaddr(),
                mapped.entry.vpage(),
                mapped.frame.pfn(),
                if mapped.frame.is_dirty() { " (dirty)" } else { "" }
            );
        }
        self.stats
            .invalidations
            .fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    fn record_flush(&self, kind: FlushKind, key: u64, count: usize) {
        self.stats.counter(kind).fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "hpte vcpu{}: flush {} key={:#x}: {} entries",
            self.vcpu_id,
            kind,
            key,
            count
        );
    }

    fn reject(&self, err: HpteError) -> HpteError {
        self.stats.invalid_masks.fetch_add(1, Ordering::Relaxed);
        log::error!("hpte vcpu{}: {}, flush skipped", self.vcpu_id, err);
        if self.trap_invalid_masks {
            panic!("hpte vcpu{}: {}", self.vcpu_id, err);
        }
        err
    }
}

impl Drop for HpteCache {
    fn drop(&mut self) {
        if !self.is_empty() {
            let count = self.flush_all();
            log::debug!(
                "hpte vcpu{}: dropped with {} live entries",
                self.vcpu_id,
                count
            );
        }
    }
}

impl fmt::Debug for HpteCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HpteCache")
            .field("vcpu_id", &self.vcpu_id)
            .field("ceiling", &self.ceiling)
            .field("live", &self.len())
            .field("reserved", &self.reserved())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::GuestPte;
    use crate::frame::HostPfn;
    use crate::testing::RecordingHal;

    fn cache_with(max_entries: usize) -> (HpteCache, Arc<RecordingHal>) {
        let config = HpteConfig::default()
            .with_max_entries(max_entries)
            .with_trap_invalid_masks(false);
        let allocator = HpteAllocator::sysinit(&config).unwrap();
        let hal = RecordingHal::new();
        let cache = HpteCache::init(0, allocator, hal.clone(), &config).unwrap();
        (cache, hal)
    }

    fn map(cache: &HpteCache, eaddr: u64, vpage: u64, raddr: u64) -> HpteHandle {
        let mut slot = cache.cache_next().unwrap();
        slot.pte = GuestPte {
            eaddr,
            vpage,
            raddr,
            may_read: true,
            may_write: false,
            may_execute: false,
        };
        slot.pfn = HostPfn(raddr >> 12);
        cache.cache_map(slot)
    }

    #[test]
    fn test_map_links_all_tables() {
        let (cache, hal) = cache_with(16);
        let handle = map(&cache, 0x1000, 0xaaa, 0x5000);

        assert_eq!(cache.len(), 1);
        for kind in TableKind::ALL {
            assert_eq!(cache.table_len(kind), 1);
        }
        assert!(cache.contains(handle));
        assert_eq!(hal.pins(), 1);
    }

    #[test]
    fn test_invalidate_unlinks_all_tables() {
        let (cache, hal) = cache_with(16);
        let handle = map(&cache, 0x1000, 0xaaa, 0x5000);

        assert!(cache.invalidate(handle));
        for kind in TableKind::ALL {
            assert_eq!(cache.table_len(kind), 0);
        }
        assert!(!cache.invalidate(handle));
        assert_eq!(hal.releases(), 1);
        assert_eq!(hal.host_invalidations(), 1);
    }

    #[test]
    fn test_find_uses_table_mask() {
        let (cache, _hal) = cache_with(16);
        map(&cache, 0x1234, 0x12_3456_7abc, 0);

        assert!(cache.find(TableKind::Pte, 0x1fff).is_some());
        assert!(cache.find(TableKind::Pte, 0x2000).is_none());
        assert!(cache.find(TableKind::PteLong, 0x1000).is_some());
        assert!(cache.find(TableKind::Vpte, 0x2_3456_7abc).is_some());
        assert!(cache.find(TableKind::VpteLong, 0x2_3456_7000).is_some());
    }

    #[test]
    fn test_invalid_mask_is_noop() {
        let (cache, hal) = cache_with(16);
        map(&cache, 0x1000, 0xaaa, 0);

        assert_eq!(
            cache.flush_addr(0x1000, 0xffff_ffff),
            Err(HpteError::InvalidEaMask(0xffff_ffff))
        );
        assert_eq!(
            cache.flush_vpage(0xaaa, 0xfff),
            Err(HpteError::InvalidVpMask(0xfff))
        );
        assert_eq!(cache.len(), 1);
        assert_eq!(hal.releases(), 0);
        assert_eq!(cache.stats().invalid_masks, 2);
    }

    #[test]
    fn test_cache_free_returns_quota() {
        let (cache, hal) = cache_with(16);
        let slot = cache.cache_next().unwrap();
        assert_eq!(cache.allocator().live(), 1);
        assert_eq!(cache.reserved(), 1);

        cache.cache_free(slot);
        assert_eq!(cache.allocator().live(), 0);
        assert_eq!(cache.reserved(), 0);
        assert_eq!(hal.pins(), 0);
    }

    #[test]
    fn test_map_moves_reservation_to_live() {
        let (cache, _hal) = cache_with(16);
        map(&cache, 0x1000, 0xaaa, 0);
        assert_eq!(cache.reserved(), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    #[should_panic(expected = "invalid")]
    fn test_invalid_mask_traps_when_enabled() {
        let config = HpteConfig::default().with_trap_invalid_masks(true);
        let allocator = HpteAllocator::sysinit(&config).unwrap();
        let cache = HpteCache::init(0, allocator, RecordingHal::new(), &config).unwrap();
        let _ = cache.flush_addr(0x1000, 0xffff_ffff);
    }

    #[test]
    fn test_drop_releases_frames() {
        let (cache, hal) = cache_with(16);
        map(&cache, 0x1000, 0xaaa, 0);
        map(&cache, 0x2000, 0xbbb, 0);

        drop(cache);
        assert_eq!(hal.pins(), 2);
        assert_eq!(hal.releases(), 2);
    }
}
