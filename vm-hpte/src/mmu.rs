//! Shadow MMU 集成
//!
//! hypervisor 级别的入口：sysinit 时创建共享对象池，
//! 每个 vCPU 创建时登记一个 HPTE 缓存，销毁时全量刷新。
//! host 回收或迁移物理页时，通过 `flush_phys_range_all`
//! 对所有 vCPU 做反向映射失效。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cache::HpteCache;
use crate::config::HpteConfig;
use crate::error::{HpteError, HpteResult};
use crate::frame::HostMmuHal;
use crate::slab::HpteAllocator;

/// Shadow MMU：共享对象池 + 每个 vCPU 的缓存
pub struct ShadowMmu {
    config: HpteConfig,
    allocator: Arc<HpteAllocator>,
    hal: Arc<dyn HostMmuHal>,
    vcpus: RwLock<HashMap<u32, Arc<HpteCache>>>,
}

impl ShadowMmu {
    /// 进程级初始化
    pub fn sysinit(config: HpteConfig, hal: Arc<dyn HostMmuHal>) -> HpteResult<Self> {
        let allocator = HpteAllocator::sysinit(&config)?;
        Ok(Self {
            config,
            allocator,
            hal,
            vcpus: RwLock::new(HashMap::new()),
        })
    }

    /// 为新 vCPU 创建缓存
    pub fn vcpu_init(&self, vcpu_id: u32) -> HpteResult<Arc<HpteCache>> {
        let mut vcpus = self.vcpus.write();
        if vcpus.contains_key(&vcpu_id) {
            return Err(HpteError::VcpuExists(vcpu_id));
        }

        let cache = Arc::new(HpteCache::init(
            vcpu_id,
            Arc::clone(&self.allocator),
            Arc::clone(&self.hal),
            &self.config,
        )?);
        vcpus.insert(vcpu_id, Arc::clone(&cache));
        log::info!("hpte: vcpu{} cache created", vcpu_id);
        Ok(cache)
    }

    pub fn vcpu(&self, vcpu_id: u32) -> Option<Arc<HpteCache>> {
        self.vcpus.read().get(&vcpu_id).cloned()
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpus.read().len()
    }

    /// 注销 vCPU 并刷新其全部条目，返回刷新的条目数
    pub fn vcpu_destroy(&self, vcpu_id: u32) -> HpteResult<usize> {
        let cache = self
            .vcpus
            .write()
            .remove(&vcpu_id)
            .ok_or(HpteError::VcpuNotFound(vcpu_id))?;
        let count = cache.destroy();
        log::info!("hpte: vcpu{} cache destroyed ({} entries)", vcpu_id, count);
        Ok(count)
    }

    /// 在所有 vCPU 上刷新 guest 实地址落在 `[pa_start, pa_end)` 的条目
    pub fn flush_phys_range_all(&self, pa_start: u64, pa_end: u64) -> usize {
        let caches: Vec<Arc<HpteCache>> = self.vcpus.read().values().cloned().collect();
        caches
            .iter()
            .map(|cache| cache.flush_phys_range(pa_start, pa_end))
            .sum()
    }

    pub fn config(&self) -> &HpteConfig {
        &self.config
    }

    pub fn allocator(&self) -> &Arc<HpteAllocator> {
        &self.allocator
    }

    /// 进程级清理：销毁剩余 vCPU 缓存，然后关闭对象池
    pub fn sysexit(self) {
        let caches: Vec<(u32, Arc<HpteCache>)> = self.vcpus.write().drain().collect();
        for (vcpu_id, cache) in caches {
            let count = cache.destroy();
            log::debug!("hpte: vcpu{} flushed {} entries at sysexit", vcpu_id, count);
        }
        self.allocator.sysexit();
    }
}
