//! Shadow HPTE 缓存条目

use crate::cache::SlotReservation;
use crate::frame::HostPfn;
use crate::slab::PoolObject;

/// Guest 翻译结果：一条 guest PTE 解码后的内容
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuestPte {
    /// Guest 有效地址
    pub eaddr: u64,
    /// Guest 虚拟页号（含段号）
    pub vpage: u64,
    /// Guest 实地址
    pub raddr: u64,
    pub may_read: bool,
    pub may_write: bool,
    pub may_execute: bool,
}

/// 由 `cache_next` 分配、调用方填写后交给 `cache_map` 的空槽位
///
/// 所有字段初始为零。槽位占用缓存的一个条目名额，映射后转为存活条目；
/// 未映射就丢弃时，名额和对象池限额一并归还。
#[derive(Debug)]
#[must_use = "an unmapped slot only holds pool quota"]
pub struct HpteSlot {
    /// Guest 翻译
    pub pte: GuestPte,
    /// Host 虚拟页号（host HTAB 中使用）
    pub host_vpn: u64,
    /// Host HTAB 槽位
    pub slot: u64,
    /// 支撑该映射的 host 页帧
    pub pfn: HostPfn,
    pool: PoolObject,
    reservation: SlotReservation,
}

impl HpteSlot {
    pub(crate) fn new(pool: PoolObject, reservation: SlotReservation) -> Self {
        Self {
            pte: GuestPte::default(),
            host_vpn: 0,
            slot: 0,
            pfn: HostPfn::default(),
            pool,
            reservation,
        }
    }

    /// 拆成待发布的条目和仍未归还的名额
    pub(crate) fn into_parts(self) -> (HpteEntry, SlotReservation) {
        let entry = HpteEntry {
            pte: self.pte,
            host_vpn: self.host_vpn,
            slot: self.slot,
            pfn: self.pfn,
            _pool: self.pool,
        };
        (entry, self.reservation)
    }
}

/// 已发布的 shadow HPTE
///
/// 插入后不可变；失效时从表中移除而不是修改。
#[derive(Debug)]
pub struct HpteEntry {
    pte: GuestPte,
    host_vpn: u64,
    slot: u64,
    pfn: HostPfn,
    _pool: PoolObject,
}

impl HpteEntry {
    pub fn pte(&self) -> &GuestPte {
        &self.pte
    }

    pub fn eaddr(&self) -> u64 {
        self.pte.eaddr
    }

    pub fn vpage(&self) -> u64 {
        self.pte.vpage
    }

    pub fn raddr(&self) -> u64 {
        self.pte.raddr
    }

    pub fn may_write(&self) -> bool {
        self.pte.may_write
    }

    pub fn host_vpn(&self) -> u64 {
        self.host_vpn
    }

    pub fn slot(&self) -> u64 {
        self.slot
    }

    pub fn pfn(&self) -> HostPfn {
        self.pfn
    }
}
