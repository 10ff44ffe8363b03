//! Host 页帧引用与 host MMU 接口

use std::fmt;
use std::sync::Arc;

use crate::entry::HpteEntry;

/// Host 页帧号
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostPfn(pub u64);

impl fmt::LowerHex for HostPfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// 宿主机（hypervisor）必须提供的接口
///
/// 页帧引用计数归宿主内存管理所有，缓存只借用一个引用单位：
/// 映射时 `pin_pfn`，失效时恰好释放一次。
pub trait HostMmuHal: Send + Sync {
    /// 为页帧增加一个引用，防止被回收
    fn pin_pfn(&self, pfn: HostPfn);
    /// 释放页帧引用，页面未被写过
    fn release_pfn_clean(&self, pfn: HostPfn);
    /// 释放页帧引用，并把页面标记为脏
    fn release_pfn_dirty(&self, pfn: HostPfn);
    /// 从真实的硬件哈希页表中移除对应的 shadow PTE
    fn invalidate_host_pte(&self, _entry: &HpteEntry) {}
}

/// 已 pin 的 host 页帧
///
/// drop 时释放引用；可写映射释放为脏页。所有权保证每个 pin 恰好释放一次。
pub struct PinnedFrame {
    pfn: HostPfn,
    dirty: bool,
    hal: Arc<dyn HostMmuHal>,
}

impl PinnedFrame {
    pub fn pin(hal: Arc<dyn HostMmuHal>, pfn: HostPfn, dirty: bool) -> Self {
        hal.pin_pfn(pfn);
        Self { pfn, dirty, hal }
    }

    pub fn pfn(&self) -> HostPfn {
        self.pfn
    }

    /// 释放时是否标记为脏页
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

impl Drop for PinnedFrame {
    fn drop(&mut self) {
        if self.dirty {
            self.hal.release_pfn_dirty(self.pfn);
        } else {
            self.hal.release_pfn_clean(self.pfn);
        }
    }
}

impl fmt::Debug for PinnedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedFrame")
            .field("pfn", &self.pfn)
            .field("dirty", &self.dirty)
            .finish()
    }
}
