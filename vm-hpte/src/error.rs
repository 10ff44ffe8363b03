//! HPTE 缓存错误类型

use thiserror::Error;

/// HPTE 缓存错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HpteError {
    /// 对象池无法提供新条目，或 sysinit 时无法创建对象池
    #[error("HPTE allocation failed: {message}")]
    AllocationFailed {
        /// 错误描述
        message: String,
    },

    /// 有效地址刷新掩码不在 {page, block, 0} 之内
    #[error("invalid effective-address flush mask {0:#x}")]
    InvalidEaMask(u64),

    /// 虚拟页刷新掩码不在 {short, long} 之内
    #[error("invalid virtual-page flush mask {0:#x}")]
    InvalidVpMask(u64),

    /// 配置无效
    #[error("invalid HPTE configuration: {0}")]
    Config(String),

    /// vCPU 已存在缓存
    #[error("vCPU {0} already has an HPTE cache")]
    VcpuExists(u32),

    /// vCPU 不存在
    #[error("vCPU {0} has no HPTE cache")]
    VcpuNotFound(u32),
}

impl HpteError {
    pub(crate) fn allocation(message: impl Into<String>) -> Self {
        HpteError::AllocationFailed {
            message: message.into(),
        }
    }

    /// 是否为调用方违反掩码约定（host 侧 bug）
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, HpteError::InvalidEaMask(_) | HpteError::InvalidVpMask(_))
    }
}

/// HPTE 结果类型
pub type HpteResult<T> = Result<T, HpteError>;
