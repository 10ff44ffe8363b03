//! HPTE 哈希函数与掩码常量
//!
//! 四个哈希表各自按不同粒度索引同一批条目：
//! - **pte**: 有效地址，页粒度
//! - **pte_long**: 有效地址，段内 16 位页号窗口
//! - **vpte**: 虚拟页号，36 位
//! - **vpte_long**: 虚拟页号，去掉低 12 位后的粗粒度窗口
//!
//! 掩码决定了每种刷新操作的匹配粒度，哈希函数必须与掩码保持一致：
//! 同一个掩码后的键总是落在同一个桶里。

/// 页偏移位数
pub const PTE_SIZE: u32 = 12;

/// 有效地址按页刷新的掩码
pub const EA_PAGE_MASK: u64 = !0xfff;
/// 有效地址按块刷新的掩码（段内页号）
pub const EA_BLOCK_MASK: u64 = 0x0fff_f000;
/// 有效地址全部刷新的掩码
pub const EA_ALL_MASK: u64 = 0;
/// 虚拟页号短掩码（36 位）
pub const VP_SHORT_MASK: u64 = 0xf_ffff_ffff;
/// 虚拟页号长掩码
pub const VP_LONG_MASK: u64 = 0xf_ffff_f000;

pub const HPTEG_HASH_BITS_PTE: u32 = 13;
pub const HPTEG_HASH_BITS_PTE_LONG: u32 = 12;
pub const HPTEG_HASH_BITS_VPTE: u32 = 13;
pub const HPTEG_HASH_BITS_VPTE_LONG: u32 = 5;

pub const HPTEG_HASH_NUM_PTE: usize = 1 << HPTEG_HASH_BITS_PTE;
pub const HPTEG_HASH_NUM_PTE_LONG: usize = 1 << HPTEG_HASH_BITS_PTE_LONG;
pub const HPTEG_HASH_NUM_VPTE: usize = 1 << HPTEG_HASH_BITS_VPTE;
pub const HPTEG_HASH_NUM_VPTE_LONG: usize = 1 << HPTEG_HASH_BITS_VPTE_LONG;

const GOLDEN_RATIO_64: u64 = 0x61c8_8646_80b5_83eb;

/// Fibonacci 乘法哈希，取高 `bits` 位
#[inline]
pub const fn hash_64(val: u64, bits: u32) -> u64 {
    val.wrapping_mul(GOLDEN_RATIO_64) >> (64 - bits)
}

#[inline]
pub const fn hash_pte(eaddr: u64) -> usize {
    hash_64(eaddr >> PTE_SIZE, HPTEG_HASH_BITS_PTE) as usize
}

#[inline]
pub const fn hash_pte_long(eaddr: u64) -> usize {
    hash_64((eaddr & EA_BLOCK_MASK) >> PTE_SIZE, HPTEG_HASH_BITS_PTE_LONG) as usize
}

#[inline]
pub const fn hash_vpte(vpage: u64) -> usize {
    hash_64(vpage & VP_SHORT_MASK, HPTEG_HASH_BITS_VPTE) as usize
}

#[inline]
pub const fn hash_vpte_long(vpage: u64) -> usize {
    hash_64((vpage & VP_LONG_MASK) >> PTE_SIZE, HPTEG_HASH_BITS_VPTE_LONG) as usize
}
