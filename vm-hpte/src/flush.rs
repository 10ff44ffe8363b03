//! 刷新请求的掩码
//!
//! 调用方（guest MMU 模拟）以原始掩码值发起刷新。掩码必须精确等于
//! 约定值之一，否则属于 host 侧 bug：guest 内存隔离依赖精确匹配。

use std::fmt;

use crate::error::HpteError;
use crate::hash::{EA_ALL_MASK, EA_BLOCK_MASK, EA_PAGE_MASK, VP_LONG_MASK, VP_SHORT_MASK};

/// 有效地址刷新掩码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EaFlushMask {
    /// 单页（`!0xfff`）
    Page,
    /// 段内页号块（`0x0ffff000`）
    Block,
    /// 全部（`0`）
    All,
}

impl EaFlushMask {
    pub const fn bits(self) -> u64 {
        match self {
            EaFlushMask::Page => EA_PAGE_MASK,
            EaFlushMask::Block => EA_BLOCK_MASK,
            EaFlushMask::All => EA_ALL_MASK,
        }
    }
}

impl TryFrom<u64> for EaFlushMask {
    type Error = HpteError;

    fn try_from(mask: u64) -> Result<Self, Self::Error> {
        match mask {
            EA_PAGE_MASK => Ok(EaFlushMask::Page),
            EA_BLOCK_MASK => Ok(EaFlushMask::Block),
            EA_ALL_MASK => Ok(EaFlushMask::All),
            _ => Err(HpteError::InvalidEaMask(mask)),
        }
    }
}

/// 虚拟页号刷新掩码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VpFlushMask {
    /// `0xfffffffff`
    Short,
    /// `0xffffff000`
    Long,
}

impl VpFlushMask {
    pub const fn bits(self) -> u64 {
        match self {
            VpFlushMask::Short => VP_SHORT_MASK,
            VpFlushMask::Long => VP_LONG_MASK,
        }
    }
}

impl TryFrom<u64> for VpFlushMask {
    type Error = HpteError;

    fn try_from(mask: u64) -> Result<Self, Self::Error> {
        match mask {
            VP_SHORT_MASK => Ok(VpFlushMask::Short),
            VP_LONG_MASK => Ok(VpFlushMask::Long),
            _ => Err(HpteError::InvalidVpMask(mask)),
        }
    }
}

/// 刷新种类，用于日志和统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushKind {
    Page,
    Block,
    All,
    VpageShort,
    VpageLong,
    PhysRange,
}

impl fmt::Display for FlushKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlushKind::Page => "page",
            FlushKind::Block => "block",
            FlushKind::All => "all",
            FlushKind::VpageShort => "vpage-short",
            FlushKind::VpageLong => "vpage-long",
            FlushKind::PhysRange => "phys-range",
        };
        f.write_str(name)
    }
}

impl From<EaFlushMask> for FlushKind {
    fn from(mask: EaFlushMask) -> Self {
        match mask {
            EaFlushMask::Page => FlushKind::Page,
            EaFlushMask::Block => FlushKind::Block,
            EaFlushMask::All => FlushKind::All,
        }
    }
}

impl From<VpFlushMask> for FlushKind {
    fn from(mask: VpFlushMask) -> Self {
        match mask {
            VpFlushMask::Short => FlushKind::VpageShort,
            VpFlushMask::Long => FlushKind::VpageLong,
        }
    }
}
