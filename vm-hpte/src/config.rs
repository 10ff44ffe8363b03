//! HPTE 缓存配置
//!
//! 配置可以直接构造，也可以从 TOML 加载：
//!
//! ```rust
//! use vm_hpte::HpteConfig;
//!
//! let config = HpteConfig::from_toml(
//!     r#"
//!     max_entries_per_vcpu = 1024
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(config.max_entries_per_vcpu, 1024);
//! assert_eq!(config.pool_name, "kvm-spt");
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{HpteError, HpteResult};

/// 每个 vCPU 的默认条目上限
pub const HPTEG_CACHE_NUM: usize = 4096;

/// 全局对象池的默认容量
pub const DEFAULT_POOL_CAPACITY: usize = 1 << 20;

/// HPTE 缓存配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HpteConfig {
    /// 每个 vCPU 的条目上限，达到后下一次分配前整体刷新
    pub max_entries_per_vcpu: usize,
    /// 全局对象池容量（所有 vCPU 共享）
    pub pool_capacity: usize,
    /// 对象池名称
    pub pool_name: String,
    /// 非法刷新掩码直接 panic 而不是返回错误，debug 构建下默认开启
    pub trap_invalid_masks: bool,
}

impl Default for HpteConfig {
    fn default() -> Self {
        Self {
            max_entries_per_vcpu: HPTEG_CACHE_NUM,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            pool_name: "kvm-spt".to_string(),
            trap_invalid_masks: cfg!(debug_assertions),
        }
    }
}

impl HpteConfig {
    /// 验证配置的有效性
    ///
    /// 对象池容量为 0 不在这里拒绝，它在 sysinit 时表现为分配失败。
    pub fn validate(&self) -> HpteResult<()> {
        if self.max_entries_per_vcpu == 0 {
            return Err(HpteError::Config(
                "max_entries_per_vcpu must be non-zero".to_string(),
            ));
        }
        if self.pool_name.is_empty() {
            return Err(HpteError::Config("pool_name must not be empty".to_string()));
        }
        Ok(())
    }

    /// 从 TOML 字符串加载并验证配置
    pub fn from_toml(toml: &str) -> HpteResult<Self> {
        let config: Self = toml::from_str(toml)
            .map_err(|e| HpteError::Config(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 序列化为 TOML
    pub fn to_toml(&self) -> HpteResult<String> {
        toml::to_string(self).map_err(|e| HpteError::Config(format!("TOML encode error: {}", e)))
    }

    /// 设置每个 vCPU 的条目上限
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries_per_vcpu = max_entries;
        self
    }

    /// 设置非法掩码是否 panic
    pub fn with_trap_invalid_masks(mut self, trap: bool) -> Self {
        self.trap_invalid_masks = trap;
        self
    }

    /// 设置对象池容量
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }
}
