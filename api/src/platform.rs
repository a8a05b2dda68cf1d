//! CAAM 平台操作
//!
//! 时钟、RNG 实例化与安全内存命令。

use caam_core::{
    cache::DmaOps,
    desc::Descriptor,
    error::{JobError, JobResult},
    regs::*,
};

use crate::{config::RngTrim, ring::JobRing};

/// RNG 初始化结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RngState {
    /// 之前的启动阶段已经实例化，跳过
    AlreadyInstantiated,
    /// 本次实例化成功
    Instantiated,
    /// 实例化失败，设备仍可使用但没有硬件熵源
    Degraded(RngFault),
}

/// RNG 实例化失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RngFault {
    /// 实例化作业本身失败
    Job(JobError),
    /// 作业完成但 RDSTA 不是预期值
    Status(u32),
}

/// 打开 CAAM 的时钟
pub fn enable_clocks(ccm: &impl RegisterAccess) {
    ccm.modify(CCM_CCGR0, |v| v | Ccgr0::all().bits());
}

/// 设置 TRNG 并实例化 RNG
///
/// 失败只记录日志，不返回错误。
pub fn instantiate_rng<R: RegisterAccess, D: DmaOps>(
    ring: &mut JobRing<R, D>,
    trim: &RngTrim,
) -> RngState {
    let regs = ring.regs();
    if RdSta::from_bits_retain(regs.read(CAAM_RDSTA)).contains(RdSta::IF0) {
        info!("RNG already instantiated");
        return RngState::AlreadyInstantiated;
    }

    // 进入 TRNG 编程模式
    regs.write(CAAM_RTMCTL, RtmCtl::PGM.bits());
    regs.modify(CAAM_RTMCTL, |v| v | (trim.osc_div << RTMCTL_OSC_DIV_SHIFT));

    regs.write(CAAM_RTSDCTL, trim.sdctl());
    regs.write(CAAM_RTFRQMIN, trim.frq_min());
    regs.write(CAAM_RTFRQMAX, trim.frq_max());

    // 恢复运行模式
    regs.modify(CAAM_RTMCTL, |v| v & !RtmCtl::PGM.bits());

    // RNG 时钟不在系统时钟的 1/2x ~ 8x 范围内时会置 ERR，
    // 前一阶段没有及时初始化 PLL 就可能出现
    regs.modify(CAAM_RTMCTL, |v| v | RtmCtl::ERR.bits());

    let job = ring.submit_and_wait(&Descriptor::InstantiateRng);
    let regs = ring.regs();
    if let Err(e) = job {
        warn!("RNG instantiation job failed: {}", e);
        warn!("RTMCTL 0x{:X}", regs.read(CAAM_RTMCTL));
        warn!("RTSTATUS 0x{:X}", regs.read(CAAM_RTSTATUS));
        warn!("RDSTA 0x{:X}", regs.read(CAAM_RDSTA));
    }

    let rdsta = regs.read(CAAM_RDSTA);
    if rdsta != (RdSta::IF0 | RdSta::SKVN).bits() {
        warn!("RNG instantiation failed 0x{:X}", rdsta);
        return RngState::Degraded(RngFault::Status(rdsta));
    }
    match job {
        Ok(()) => {
            info!("RNG instantiated");
            RngState::Instantiated
        }
        Err(e) => RngState::Degraded(RngFault::Job(e)),
    }
}

/// 执行一条安全内存命令
///
/// 轮询 SMCSJR0 直到命令进行位清零，返回最终状态。
pub fn secmem_command(regs: &impl RegisterAccess, cmd: u32, poll_limit: u32) -> JobResult<u32> {
    regs.write(CAAM_SMCJR0, cmd);
    for _ in 0..poll_limit {
        let status = regs.read(CAAM_SMCSJR0);
        if status & SMCS_CMD_COMPLETE == 0 {
            return Ok(status);
        }
        core::hint::spin_loop();
    }
    error!("Secure memory command 0x{:X} did not complete", cmd);
    Err(JobError::Timeout)
}
