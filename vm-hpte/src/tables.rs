//! 每个 vCPU 的四张哈希表
//!
//! 同一个条目同时挂在四张表各自的一个桶里。表中只存句柄，
//! 条目本身存放在 vCPU 的 slab 中，因此"从四张表同时移除"
//! 只是从四个桶中删除同一个句柄。
//!
//! vpte_long 表掩码最粗，每个存活条目都能在它的某个桶中找到，
//! 全量刷新和物理地址范围刷新都遍历这张表。

use crate::entry::HpteEntry;
use crate::hash::{
    EA_BLOCK_MASK, EA_PAGE_MASK, HPTEG_HASH_NUM_PTE, HPTEG_HASH_NUM_PTE_LONG,
    HPTEG_HASH_NUM_VPTE, HPTEG_HASH_NUM_VPTE_LONG, VP_LONG_MASK, VP_SHORT_MASK, hash_pte,
    hash_pte_long, hash_vpte, hash_vpte_long,
};
use crate::slab::HpteHandle;

/// 哈希表种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    /// 有效地址，页粒度
    Pte,
    /// 有效地址，块粒度
    PteLong,
    /// 虚拟页号，短掩码
    Vpte,
    /// 虚拟页号，长掩码
    VpteLong,
}

impl TableKind {
    pub const ALL: [TableKind; 4] = [
        TableKind::Pte,
        TableKind::PteLong,
        TableKind::Vpte,
        TableKind::VpteLong,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        match self {
            TableKind::Pte => 0,
            TableKind::PteLong => 1,
            TableKind::Vpte => 2,
            TableKind::VpteLong => 3,
        }
    }

    /// 桶数量
    pub const fn buckets(self) -> usize {
        match self {
            TableKind::Pte => HPTEG_HASH_NUM_PTE,
            TableKind::PteLong => HPTEG_HASH_NUM_PTE_LONG,
            TableKind::Vpte => HPTEG_HASH_NUM_VPTE,
            TableKind::VpteLong => HPTEG_HASH_NUM_VPTE_LONG,
        }
    }

    /// 该表键的匹配掩码
    pub const fn mask(self) -> u64 {
        match self {
            TableKind::Pte => EA_PAGE_MASK,
            TableKind::PteLong => EA_BLOCK_MASK,
            TableKind::Vpte => VP_SHORT_MASK,
            TableKind::VpteLong => VP_LONG_MASK,
        }
    }

    /// 条目在该表中的（已掩码）键
    pub fn key_of(self, entry: &HpteEntry) -> u64 {
        match self {
            TableKind::Pte | TableKind::PteLong => entry.eaddr() & self.mask(),
            TableKind::Vpte | TableKind::VpteLong => entry.vpage() & self.mask(),
        }
    }

    /// 键所在的桶
    pub fn bucket(self, key: u64) -> usize {
        match self {
            TableKind::Pte => hash_pte(key),
            TableKind::PteLong => hash_pte_long(key),
            TableKind::Vpte => hash_vpte(key),
            TableKind::VpteLong => hash_vpte_long(key),
        }
    }

    /// 条目在该表中的桶
    pub fn bucket_of(self, entry: &HpteEntry) -> usize {
        self.bucket(self.key_of(entry))
    }
}

/// 四张哈希表
#[derive(Debug)]
pub(crate) struct HpteTables {
    buckets: [Vec<Vec<HpteHandle>>; 4],
}

impl HpteTables {
    pub(crate) fn new() -> Self {
        Self {
            buckets: TableKind::ALL.map(|kind| vec![Vec::new(); kind.buckets()]),
        }
    }

    /// 把句柄挂到四张表上
    pub(crate) fn link(&mut self, handle: HpteHandle, entry: &HpteEntry) {
        for kind in TableKind::ALL {
            let bucket = kind.bucket_of(entry);
            self.buckets[kind.index()][bucket].push(handle);
        }
    }

    /// 从四张表上摘下句柄，返回是否曾经挂着
    pub(crate) fn unlink(&mut self, handle: HpteHandle, entry: &HpteEntry) -> bool {
        let mut linked = false;
        for kind in TableKind::ALL {
            let bucket = &mut self.buckets[kind.index()][kind.bucket_of(entry)];
            if let Some(pos) = bucket.iter().position(|h| *h == handle) {
                bucket.swap_remove(pos);
                linked = true;
            }
        }
        linked
    }

    pub(crate) fn bucket(&self, kind: TableKind, index: usize) -> &[HpteHandle] {
        &self.buckets[kind.index()][index]
    }

    /// 整张表的所有句柄
    pub(crate) fn iter(&self, kind: TableKind) -> impl Iterator<Item = HpteHandle> + '_ {
        self.buckets[kind.index()].iter().flatten().copied()
    }

    pub(crate) fn len(&self, kind: TableKind) -> usize {
        self.buckets[kind.index()].iter().map(Vec::len).sum()
    }
}
