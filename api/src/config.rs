//! 驱动配置

/// 默认完成轮询次数上限
pub const DEFAULT_POLL_LIMIT: u32 = 10_000_000;

/// 默认安全内存命令轮询次数上限
pub const DEFAULT_SECMEM_POLL_LIMIT: u32 = 1_000_000;

/// 默认重试间隔 (spin 次数)
pub const DEFAULT_RETRY_BACKOFF_SPINS: u32 = 1000;

/// TRNG 振荡器分频
pub const RNG_TRIM_OSC_DIV: u32 = 0;

/// TRNG 熵采样延迟
pub const RNG_TRIM_ENT_DLY: u32 = 3200;

/// TRNG 每次采样数
pub const RNG_TRIM_SAMP_SIZE: u32 = 0x09C4;

/// TRNG 调校参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RngTrim {
    pub osc_div: u32,
    pub ent_dly: u32,
    pub samp_size: u32,
}

impl RngTrim {
    /// RTSDCTL 寄存器值
    pub fn sdctl(&self) -> u32 {
        (self.ent_dly << 16) | (self.samp_size & 0xFFFF)
    }

    /// RTFRQMIN 寄存器值
    pub fn frq_min(&self) -> u32 {
        self.ent_dly >> 1
    }

    /// RTFRQMAX 寄存器值
    pub fn frq_max(&self) -> u32 {
        self.ent_dly << 4
    }
}

impl Default for RngTrim {
    fn default() -> Self {
        Self {
            osc_div: RNG_TRIM_OSC_DIV,
            ent_dly: RNG_TRIM_ENT_DLY,
            samp_size: RNG_TRIM_SAMP_SIZE,
        }
    }
}

/// CAAM 设备配置
#[derive(Debug, Clone, Copy)]
pub struct CaamConfig {
    /// 等待作业完成时最多轮询 ORSFR 的次数
    pub poll_limit: u32,
    /// 等待安全内存命令完成时最多轮询的次数
    pub secmem_poll_limit: u32,
    /// 加速器报告错误后重新提交的次数，0 表示不重试
    pub fault_retries: u8,
    /// 每次重试前的等待，按重试次数成倍增加
    pub retry_backoff_spins: u32,
    pub rng: RngTrim,
}

impl Default for CaamConfig {
    fn default() -> Self {
        Self {
            poll_limit: DEFAULT_POLL_LIMIT,
            secmem_poll_limit: DEFAULT_SECMEM_POLL_LIMIT,
            fault_retries: 0,
            retry_backoff_spins: DEFAULT_RETRY_BACKOFF_SPINS,
            rng: RngTrim::default(),
        }
    }
}
