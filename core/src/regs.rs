//! CAAM 寄存器定义和操作

use core::ptr::{read_volatile, write_volatile};

use bitflags::bitflags;

/// 作业环条目数 (单条目环)
pub const JOB_RING_ENTRIES: u32 = 1;

// ============ 作业环 0 寄存器偏移 ============

/// 输入环基地址 (低 32 位)
pub const CAAM_IRBAR0: usize = 0x1004;
/// 输入环大小
pub const CAAM_IRSR0: usize = 0x100C;
/// 输入环已添加作业数 (写入递增)
pub const CAAM_IRJAR0: usize = 0x101C;
/// 输出环基地址 (低 32 位)
pub const CAAM_ORBAR0: usize = 0x1024;
/// 输出环大小
pub const CAAM_ORSR0: usize = 0x102C;
/// 输出环已移除作业数 (写入递增)
pub const CAAM_ORJRR0: usize = 0x1034;
/// 输出环已填充槽位数 (只读)
pub const CAAM_ORSFR0: usize = 0x103C;
/// 作业环配置寄存器 (低 32 位)
pub const CAAM_JRCFGR0_LS: usize = 0x1054;

// ============ 安全内存寄存器偏移 ============

/// 安全内存命令寄存器
pub const CAAM_SMCJR0: usize = 0x10F4;
/// 安全内存命令状态寄存器
pub const CAAM_SMCSJR0: usize = 0x10FC;

// ============ RNG 寄存器偏移 ============

/// TRNG 其他控制寄存器
pub const CAAM_RTMCTL: usize = 0x0600;
/// TRNG 采样延迟控制
pub const CAAM_RTSDCTL: usize = 0x0610;
/// TRNG 频率计数最小值
pub const CAAM_RTFRQMIN: usize = 0x0618;
/// TRNG 频率计数最大值
pub const CAAM_RTFRQMAX: usize = 0x061C;
/// TRNG 状态
pub const CAAM_RTSTATUS: usize = 0x063C;
/// RNG DRNG 状态
pub const CAAM_RDSTA: usize = 0x06C0;

// ============ CCM 寄存器偏移 ============

/// 时钟门控寄存器 0
pub const CCM_CCGR0: usize = 0x68;

/// 输出环状态字中的错误位
pub const JOB_RING_STS: u32 = 0xF << 28;

/// 安全内存命令仍在执行
pub const SMCS_CMD_COMPLETE: u32 = 0x3 << 14;

/// RTMCTL 中 OSC_DIV 字段偏移
pub const RTMCTL_OSC_DIV_SHIFT: u32 = 2;

bitflags! {
    /// TRNG 其他控制寄存器位
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RtmCtl: u32 {
        /// 写 1 清除 TRNG 错误
        const ERR = 1 << 12;
        /// 编程模式
        const PGM = 1 << 16;
    }
}

bitflags! {
    /// RNG DRNG 状态位
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RdSta: u32 {
        /// 状态句柄 0 已实例化
        const IF0 = 1 << 0;
        /// 密钥已生成
        const SKVN = 1 << 30;
    }
}

bitflags! {
    /// 作业环配置 (低 32 位)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct JrCfgLs: u32 {
        /// 屏蔽作业环中断
        const IMSK = 1 << 0;
    }
}

bitflags! {
    /// CCGR0 中与 CAAM 相关的时钟门控
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ccgr0: u32 {
        const CAAM_SECURE_MEM = 0x3 << 8;
        const CAAM_WRAPPER_ACLK = 0x3 << 10;
        const CAAM_WRAPPER_IPG = 0x3 << 12;
    }
}

/// 32 位寄存器块访问
///
/// 生产环境下由 [`MmioRegs`] 以 volatile 方式访问映射后的寄存器，
/// 测试时可以换成内存中的寄存器模拟。
pub trait RegisterAccess {
    /// 读取寄存器
    fn read(&self, offset: usize) -> u32;

    /// 写入寄存器
    fn write(&self, offset: usize, value: u32);

    /// 读-改-写
    #[inline]
    fn modify(&self, offset: usize, f: impl FnOnce(u32) -> u32) {
        let value = self.read(offset);
        self.write(offset, f(value));
    }
}

/// 内存映射寄存器块
pub struct MmioRegs {
    base: *mut u8,
}

// SAFETY: 寄存器访问是通过内存映射进行的，可以安全地在线程间移动
// 多线程访问需要在更高层进行同步
unsafe impl Send for MmioRegs {}

impl MmioRegs {
    /// 创建寄存器操作实例
    ///
    /// # Safety
    /// 调用者必须确保 base 指向有效的寄存器映射地址
    pub const unsafe fn new(base: *mut u8) -> Self {
        Self { base }
    }

    /// 获取基地址
    pub fn base(&self) -> *mut u8 {
        self.base
    }
}

impl RegisterAccess for MmioRegs {
    #[inline]
    fn read(&self, offset: usize) -> u32 {
        unsafe { read_volatile(self.base.add(offset) as *const u32) }
    }

    #[inline]
    fn write(&self, offset: usize, value: u32) {
        unsafe { write_volatile(self.base.add(offset) as *mut u32, value) }
    }
}
