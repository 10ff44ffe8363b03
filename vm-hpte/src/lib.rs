//! vm-hpte: Book3S shadow HPTE 缓存
//!
//! 为 guest MMU 模拟缓存 guest 有效地址 / 虚拟页到 host 页帧的翻译。
//! 每个 vCPU 一个缓存，条目同时挂在四张哈希表上，以支持四种粒度的失效，
//! 外加全量刷新和按 guest 实地址范围刷新。
//!
//! ## 结构
//! - [`hash`]: 哈希函数与掩码
//! - [`slab`]: 进程级对象池与每个 vCPU 的 slab 竞技场
//! - [`tables`]: 四张哈希表
//! - [`cache`]: 插入 / 查找 / 失效
//! - [`mmu`]: sysinit / sysexit 与 vCPU 登记
//!
//! ## 示例
//!
//! ```rust
//! use vm_hpte::testing::RecordingHal;
//! use vm_hpte::{EA_PAGE_MASK, GuestPte, HostPfn, HpteConfig, ShadowMmu};
//!
//! let hal = RecordingHal::new();
//! let mmu = ShadowMmu::sysinit(HpteConfig::default(), hal.clone()).unwrap();
//! let cache = mmu.vcpu_init(0).unwrap();
//!
//! let mut slot = cache.cache_next().unwrap();
//! slot.pte = GuestPte { eaddr: 0x1000, vpage: 0xaaa, raddr: 0x8000, ..Default::default() };
//! slot.pfn = HostPfn(0x8);
//! cache.cache_map(slot);
//!
//! assert_eq!(cache.flush_addr(0x1000, EA_PAGE_MASK), Ok(1));
//! assert_eq!(hal.pins(), hal.releases());
//! mmu.sysexit();
//! ```

pub mod cache;
pub mod config;
pub mod entry;
pub mod error;
pub mod flush;
pub mod frame;
pub mod hash;
pub mod mmu;
pub mod slab;
pub mod tables;
pub mod testing;

pub use cache::{HpteCache, HpteStats, HpteStatsSnapshot};
pub use config::{DEFAULT_POOL_CAPACITY, HPTEG_CACHE_NUM, HpteConfig};
pub use entry::{GuestPte, HpteEntry, HpteSlot};
pub use error::{HpteError, HpteResult};
pub use flush::{EaFlushMask, FlushKind, VpFlushMask};
pub use frame::{HostMmuHal, HostPfn, PinnedFrame};
pub use hash::{EA_ALL_MASK, EA_BLOCK_MASK, EA_PAGE_MASK, VP_LONG_MASK, VP_SHORT_MASK};
pub use mmu::ShadowMmu;
pub use slab::{AllocatorSnapshot, HpteAllocator, HpteHandle};
pub use tables::TableKind;
