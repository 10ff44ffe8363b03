//! HPTE 条目分配器
//!
//! 两层结构：
//! - **HpteAllocator**: 进程级固定大小对象池，sysinit 时创建一次，
//!   由所有 vCPU 缓存共享。按对象计数限额，记录分配统计。
//! - **EntrySlab**: 每个 vCPU 私有的 slab 竞技场，按稳定句柄寻址，
//!   空闲槽位通过空闲链表复用。
//!
//! 句柄携带代数（generation），槽位被释放后代数递增，
//! 旧句柄因此永远不会解析到被复用的槽位。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::config::HpteConfig;
use crate::error::{HpteError, HpteResult};

/// 进程级 HPTE 对象池
#[derive(Debug)]
pub struct HpteAllocator {
    /// 对象池名称
    name: String,
    /// 最大对象数
    capacity: usize,
    /// 当前存活对象数
    live: AtomicUsize,
    /// sysexit 之后不再分配
    closed: AtomicBool,
    /// 统计信息
    stats: AllocatorStats,
}

/// 对象池统计信息
#[derive(Debug, Default)]
pub struct AllocatorStats {
    /// 分配次数
    pub allocs: AtomicU64,
    /// 释放次数
    pub frees: AtomicU64,
    /// 分配失败次数
    pub failures: AtomicU64,
    /// 存活对象峰值
    pub peak: AtomicUsize,
}

/// 对象池统计快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorSnapshot {
    pub allocs: u64,
    pub frees: u64,
    pub failures: u64,
    pub live: usize,
    pub peak: usize,
    pub capacity: usize,
}

impl HpteAllocator {
    /// 创建对象池
    ///
    /// 容量为 0 视为启动时内存不足，返回 `AllocationFailed`。
    pub fn sysinit(config: &HpteConfig) -> HpteResult<Arc<Self>> {
        config.validate()?;
        if config.pool_capacity == 0 {
            log::error!("hpte: cannot create object cache {}", config.pool_name);
            return Err(HpteError::allocation(format!(
                "cannot create object cache {}",
                config.pool_name
            )));
        }

        log::info!(
            "hpte: created object cache {} ({} objects)",
            config.pool_name,
            config.pool_capacity
        );

        Ok(Arc::new(Self {
            name: config.pool_name.clone(),
            capacity: config.pool_capacity,
            live: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            stats: AllocatorStats::default(),
        }))
    }

    /// 关闭对象池
    ///
    /// 仍有存活对象时只记录警告，这些对象在最后一个引用释放时归还。
    pub fn sysexit(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let live = self.live();
        if live != 0 {
            log::warn!(
                "hpte: object cache {} destroyed with {} objects still live",
                self.name,
                live
            );
        } else {
            log::info!("hpte: destroyed object cache {}", self.name);
        }
    }

    /// 分配一个对象
    pub(crate) fn alloc(self: &Arc<Self>) -> HpteResult<PoolObject> {
        if self.closed.load(Ordering::Acquire) {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            return Err(HpteError::allocation(format!(
                "object cache {} has been destroyed",
                self.name
            )));
        }

        let reserved = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.capacity).then_some(live + 1)
            });

        match reserved {
            Ok(previous) => {
                self.stats.allocs.fetch_add(1, Ordering::Relaxed);
                self.stats.peak.fetch_max(previous + 1, Ordering::Relaxed);
                Ok(PoolObject {
                    pool: Arc::clone(self),
                })
            }
            Err(_) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                Err(HpteError::allocation(format!(
                    "object cache {} exhausted ({} objects)",
                    self.name, self.capacity
                )))
            }
        }
    }

    fn free(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.stats.frees.fetch_add(1, Ordering::Relaxed);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前存活对象数
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 获取统计信息快照
    pub fn stats(&self) -> AllocatorSnapshot {
        AllocatorSnapshot {
            allocs: self.stats.allocs.load(Ordering::Relaxed),
            frees: self.stats.frees.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            live: self.live(),
            peak: self.stats.peak.load(Ordering::Relaxed),
            capacity: self.capacity,
        }
    }
}

/// 对象池中的一个对象，drop 时归还限额
#[derive(Debug)]
pub(crate) struct PoolObject {
    pool: Arc<HpteAllocator>,
}

impl Drop for PoolObject {
    fn drop(&mut self) {
        self.pool.free();
    }
}

/// 缓存条目的稳定句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HpteHandle {
    index: u32,
    generation: u32,
}

impl HpteHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Debug)]
struct SlabSlot<T> {
    generation: u32,
    value: Option<T>,
}

/// 按句柄寻址的 slab 竞技场
#[derive(Debug)]
pub(crate) struct EntrySlab<T> {
    slots: Vec<SlabSlot<T>>,
    /// 空闲槽位链表
    free_list: Vec<u32>,
    /// 已占用槽位数
    allocated: usize,
}

impl<T> EntrySlab<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            allocated: 0,
        }
    }

    /// 放入一个值，返回其句柄
    pub(crate) fn insert(&mut self, value: T) -> HpteHandle {
        self.allocated += 1;

        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return HpteHandle {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(SlabSlot {
            generation: 0,
            value: Some(value),
        });
        HpteHandle {
            index,
            generation: 0,
        }
    }

    pub(crate) fn get(&self, handle: HpteHandle) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    /// 取出句柄对应的值；句柄过期或已取出时返回 None
    pub(crate) fn remove(&mut self, handle: HpteHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free_list.push(handle.index);
        self.allocated -= 1;
        Some(value)
    }

    pub(crate) fn len(&self) -> usize {
        self.allocated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysinit_zero_capacity() {
        let config = HpteConfig::default().with_pool_capacity(0);
        let err = HpteAllocator::sysinit(&config).unwrap_err();
        assert!(matches!(err, HpteError::AllocationFailed { .. }));
    }

    #[test]
    fn test_alloc_free_accounting() {
        let pool = HpteAllocator::sysinit(&HpteConfig::default().with_pool_capacity(2)).unwrap();

        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_eq!(pool.live(), 2);

        // 容量耗尽
        assert!(pool.alloc().is_err());

        drop(a);
        assert_eq!(pool.live(), 1);
        let c = pool.alloc().unwrap();

        drop(b);
        drop(c);
        let stats = pool.stats();
        assert_eq!(stats.allocs, 3);
        assert_eq!(stats.frees, 3);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.peak, 2);
        assert_eq!(stats.live, 0);
    }

    #[test]
    fn test_alloc_after_sysexit() {
        let pool = HpteAllocator::sysinit(&HpteConfig::default()).unwrap();
        let held = pool.alloc().unwrap();
        pool.sysexit();
        assert!(pool.is_closed());
        assert!(pool.alloc().is_err());

        // 存活对象仍可正常归还
        drop(held);
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn test_slab_insert_remove() {
        let mut slab = EntrySlab::new();
        let a = slab.insert("a");
        let b = slab.insert("b");
        assert_eq!(slab.len(), 2);
        assert_eq!(slab.get(a), Some(&"a"));

        assert_eq!(slab.remove(a), Some("a"));
        assert_eq!(slab.remove(a), None);
        assert_eq!(slab.get(a), None);
        assert_eq!(slab.len(), 1);
        assert_eq!(slab.get(b), Some(&"b"));
    }

    #[test]
    fn test_slab_stale_handle_after_reuse() {
        let mut slab = EntrySlab::new();
        let old = slab.insert(1);
        slab.remove(old);

        // 槽位被复用，但旧句柄不应命中新值
        let new = slab.insert(2);
        assert_eq!(new.index(), old.index());
        assert_ne!(new.generation(), old.generation());
        assert_eq!(slab.get(old), None);
        assert_eq!(slab.remove(old), None);
        assert_eq!(slab.get(new), Some(&2));
    }
}
