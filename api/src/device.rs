//! CAAM 设备抽象
//!
//! 提供高层 API 供 bootloader/操作系统调用

use caam_core::{
    CAAM_PHYS_BASE, CCM_PHYS_BASE,
    cache::{CpuDma, DmaOps},
    desc::{BlobOp, KEY_MODIFIER_LEN, blob_size},
    error::{JobError, JobResult},
    regs::{MmioRegs, RegisterAccess},
};
use spin::Mutex;

use crate::{
    config::CaamConfig,
    platform::{self, RngState},
    ring::JobRing,
};

/// CAAM 设备状态
///
/// 作业在持有设备锁期间同步执行，因此外部只能观察到作业之间的状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaamState {
    /// 未打开
    Closed,
    /// 空闲
    Idle,
    /// 有作业超时未完成
    Stalled,
}

/// CAAM 设备内部状态
struct CaamDeviceInner<R, D> {
    state: CaamState,
    /// CCM 寄存器
    ccm: R,
    ring: JobRing<R, D>,
    config: CaamConfig,
}

impl<R: RegisterAccess, D: DmaOps> CaamDeviceInner<R, D> {
    fn check_open(&self) -> JobResult<()> {
        match self.state {
            CaamState::Closed => Err(JobError::NotInitialized),
            _ => Ok(()),
        }
    }

    fn update_state(&mut self) {
        self.state = if self.ring.is_stalled() {
            CaamState::Stalled
        } else {
            CaamState::Idle
        };
    }

    /// 执行 blob 作业，加速器报告错误时按配置重试
    fn run_blob(
        &mut self,
        op: BlobOp,
        input: &[u8],
        output: &mut [u8],
        key_modifier: &[u8; KEY_MODIFIER_LEN],
    ) -> JobResult<()> {
        let mut attempt = 0;
        let result = loop {
            match self.ring.run_blob(op, input, output, key_modifier) {
                Err(e) if e.is_retryable() && attempt < self.config.fault_retries => {
                    attempt += 1;
                    warn!(
                        "{:?} job failed ({}), retry {}/{}",
                        op, e, attempt, self.config.fault_retries
                    );
                    for _ in 0..self.config.retry_backoff_spins.saturating_mul(attempt as u32) {
                        core::hint::spin_loop();
                    }
                }
                other => break other,
            }
        };

        self.update_state();
        result
    }
}

/// CAAM 设备
pub struct CaamDevice<R, D> {
    /// 内部状态 (使用 Mutex 保护)
    inner: Mutex<CaamDeviceInner<R, D>>,
}

impl CaamDevice<MmioRegs, CpuDma> {
    /// 使用默认物理地址创建 CAAM 设备
    ///
    /// # Safety
    /// 调用者必须确保 `virt_offset` 加上物理地址后是有效的寄存器映射，
    /// 并且 DMA 内存是物理地址恒等映射
    pub unsafe fn from_phys(virt_offset: usize, config: CaamConfig) -> JobResult<Self> {
        let caam = unsafe { MmioRegs::new((CAAM_PHYS_BASE + virt_offset) as *mut u8) };
        let ccm = unsafe { MmioRegs::new((CCM_PHYS_BASE + virt_offset) as *mut u8) };
        Self::new(caam, ccm, CpuDma, config)
    }
}

impl<R: RegisterAccess, D: DmaOps> CaamDevice<R, D> {
    /// 创建未打开的 CAAM 设备，分配作业环内存
    pub fn new(caam: R, ccm: R, dma: D, config: CaamConfig) -> JobResult<Self> {
        let ring = JobRing::new(caam, dma, config.poll_limit)?;
        Ok(Self {
            inner: Mutex::new(CaamDeviceInner {
                state: CaamState::Closed,
                ccm,
                ring,
                config,
            }),
        })
    }

    /// 初始化 CAAM：打开时钟、设置作业环、实例化 RNG
    ///
    /// 只能调用一次。RNG 实例化失败不会导致错误，结果通过返回值报告。
    pub fn open_device(&self) -> JobResult<RngState> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.state != CaamState::Closed {
            return Err(JobError::AlreadyOpen);
        }

        platform::enable_clocks(&inner.ccm);

        // 前一阶段可能已经拆除作业环，这里总是重新设置
        inner.ring.program();

        let rng = platform::instantiate_rng(&mut inner.ring, &inner.config.rng);
        inner.update_state();

        info!("CAAM device opened, RNG: {:?}", rng);
        Ok(rng)
    }

    /// 获取设备状态
    pub fn state(&self) -> CaamState {
        self.inner.lock().state
    }

    /// 检查设备是否就绪
    pub fn is_ready(&self) -> bool {
        self.inner.lock().state == CaamState::Idle
    }

    /// 将明文封装成 blob
    ///
    /// `blob` 至少需要 `blob_size(plaintext.len())` 字节，多余部分不会被改写。
    /// 加速器只访问驱动自己的中转缓冲区，调用者的缓冲区没有对齐要求；
    /// 失败时 `blob` 保持不变。
    pub fn generate_blob(
        &self,
        plaintext: &[u8],
        blob: &mut [u8],
        key_modifier: &[u8; KEY_MODIFIER_LEN],
    ) -> JobResult<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;

        let data_size = plaintext.len();
        let size = blob_size(data_size);
        if blob.len() < size {
            return Err(JobError::BufferTooSmall {
                needed: size,
                actual: blob.len(),
            });
        }

        let result = inner.run_blob(BlobOp::Encap, plaintext, &mut blob[..size], key_modifier);
        if let Err(e) = result {
            error!("Error: blob encap of {} bytes failed: {}", data_size, e);
        }
        result
    }

    /// 将 blob 解封装为明文
    ///
    /// 明文长度由 `plaintext.len()` 决定，`blob` 至少需要 `blob_size(plaintext.len())` 字节。
    /// 只有成功时才写 `plaintext`。
    pub fn decode_blob(
        &self,
        plaintext: &mut [u8],
        blob: &[u8],
        key_modifier: &[u8; KEY_MODIFIER_LEN],
    ) -> JobResult<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;

        let data_size = plaintext.len();
        let size = blob_size(data_size);
        if blob.len() < size {
            return Err(JobError::BufferTooSmall {
                needed: size,
                actual: blob.len(),
            });
        }

        let result = inner.run_blob(BlobOp::Decap, &blob[..size], plaintext, key_modifier);
        if let Err(e) = result {
            error!("Error: blob decap of {} bytes failed: {}", data_size, e);
        }
        result
    }

    /// 执行一条安全内存命令，返回命令状态寄存器
    pub fn secmem_command(&self, cmd: u32) -> JobResult<u32> {
        let inner = self.inner.lock();
        inner.check_open()?;
        platform::secmem_command(inner.ring.regs(), cmd, inner.config.secmem_poll_limit)
    }
}
