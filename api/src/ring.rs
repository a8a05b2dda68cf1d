//! 作业环 (Job Ring) 引擎
//!
//! 输入环和输出环都只有一个条目，同一时刻最多只有一个作业在执行。
//! 提交顺序：写描述符 -> 写输入环 -> 刷缓存 -> 递增 IRJAR -> 轮询 ORSFR
//! -> 无效化输出环 -> 读取结果 -> 递增 ORJRR 释放槽位。
//!
//! blob 作业的操作数全部经过环内部的中转缓冲区，加速器只会访问
//! [`JobRing`] 自己的内存。超时的作业即使之后才完成，也不会写到调用者
//! 已经收回的缓冲区里。

use alloc::boxed::Box;
use core::{
    mem::size_of,
    ptr::{self, NonNull, addr_of_mut, read_volatile, write_volatile},
    sync::atomic::{Ordering, fence},
};

use caam_core::{
    cache::{DMA_MINALIGN, DmaOps, align_up},
    desc::{
        BlobDescriptor, BlobOp, DESC_WORDS, Descriptor, KEY_MODIFIER_LEN, MAX_OPERAND_LEN,
        RNG_INST_DESC,
    },
    error::{JobError, JobResult},
    regs::*,
};
use memory_addr::VirtAddr;

const RING_SLOTS: usize = JOB_RING_ENTRIES as usize;

/// 中转缓冲区大小，可以容纳任意 16 位长度的操作数
pub const BOUNCE_LEN: usize = align_up(MAX_OPERAND_LEN);

/// 独占一个 cache line 的字数组
#[repr(C, align(64))]
struct DmaLine<const N: usize>([u32; N]);

/// 按 cache line 对齐的字节缓冲区
#[repr(C, align(64))]
struct DmaBytes<const N: usize>([u8; N]);

const _: () = assert!(core::mem::align_of::<DmaLine<1>>() == DMA_MINALIGN);
const _: () = assert!(core::mem::align_of::<DmaBytes<1>>() == DMA_MINALIGN);

/// 与加速器共享的内存
#[repr(C)]
struct RingMemory {
    /// 输入环：描述符地址
    input: DmaLine<RING_SLOTS>,
    /// 输出环：回显的描述符地址 + 状态字
    output: DmaLine<{ 2 * RING_SLOTS }>,
    /// blob 描述符，每次提交时原地改写
    blob_desc: DmaLine<DESC_WORDS>,
    /// RNG 实例化描述符
    rng_desc: DmaLine<DESC_WORDS>,
    key_modifier: DmaBytes<KEY_MODIFIER_LEN>,
    /// 加速器读取的操作数
    src: DmaBytes<BOUNCE_LEN>,
    /// 加速器写出的操作数
    dst: DmaBytes<BOUNCE_LEN>,
}

/// 共享内存各部分的总线地址
#[derive(Debug, Clone, Copy, Default)]
struct RingBus {
    input: u32,
    output: u32,
    blob_desc: u32,
    rng_desc: u32,
    key_modifier: u32,
    src: u32,
    dst: u32,
}

/// 检查输出环中的结果
///
/// 回显地址不一致说明环失步；状态字中任一错误位为 1 说明加速器报告失败。
pub fn check_output(expected: u32, found: u32, status: u32) -> JobResult<()> {
    if found != expected {
        return Err(JobError::DescriptorMismatch { expected, found });
    }
    if status & JOB_RING_STS != 0 {
        return Err(JobError::AcceleratorFault(status));
    }
    Ok(())
}

/// 单条目作业环
pub struct JobRing<R, D> {
    regs: R,
    dma: D,
    mem: NonNull<RingMemory>,
    bus: RingBus,
    poll_limit: u32,
    /// 超时后仍在硬件中的描述符地址
    stalled: Option<u32>,
}

// SAFETY: 共享内存由 JobRing 独占，随 JobRing 一起移动
unsafe impl<R: Send, D: Send> Send for JobRing<R, D> {}

impl<R: RegisterAccess, D: DmaOps> JobRing<R, D> {
    /// 分配环内存并解析各部分的总线地址
    pub fn new(regs: R, dma: D, poll_limit: u32) -> JobResult<Self> {
        // 中转缓冲区较大，直接在堆上清零分配
        // SAFETY: RingMemory 只包含整数数组，全零是合法值
        let mut mem = unsafe { Box::<RingMemory>::new_zeroed().assume_init() };
        mem.rng_desc.0 = RNG_INST_DESC;
        let mem = NonNull::from(Box::leak(mem));

        let mut ring = Self {
            regs,
            dma,
            mem,
            bus: RingBus::default(),
            poll_limit,
            stalled: None,
        };
        ring.bus = RingBus {
            input: ring.bus_of(ring.input_ptr().cast(), RING_SLOTS * size_of::<u32>())?,
            output: ring.bus_of(ring.output_ptr().cast(), 2 * RING_SLOTS * size_of::<u32>())?,
            blob_desc: ring.bus_of(ring.blob_desc_ptr().cast(), DESC_WORDS * size_of::<u32>())?,
            rng_desc: ring.bus_of(ring.rng_desc_ptr().cast(), DESC_WORDS * size_of::<u32>())?,
            key_modifier: ring.bus_of(ring.key_modifier_ptr(), KEY_MODIFIER_LEN)?,
            src: ring.bus_of(ring.src_ptr(), BOUNCE_LEN)?,
            dst: ring.bus_of(ring.dst_ptr(), BOUNCE_LEN)?,
        };
        debug!(
            "Job ring memory: input=0x{:08x}, output=0x{:08x}",
            ring.bus.input, ring.bus.output
        );
        Ok(ring)
    }

    /// 寄存器块
    pub fn regs(&self) -> &R {
        &self.regs
    }

    /// 缓存与地址转换操作
    pub fn dma(&self) -> &D {
        &self.dma
    }

    /// 是否有超时后尚未回收的作业
    pub fn is_stalled(&self) -> bool {
        self.stalled.is_some()
    }

    /// 设置环基地址与大小，并屏蔽作业环中断 (仅使用轮询)
    pub fn program(&self) {
        self.regs.write(CAAM_IRBAR0, self.bus.input);
        self.regs.write(CAAM_ORBAR0, self.bus.output);

        self.regs.write(CAAM_IRSR0, JOB_RING_ENTRIES);
        self.regs.write(CAAM_ORSR0, JOB_RING_ENTRIES);

        self.regs
            .modify(CAAM_JRCFGR0_LS, |v| v | JrCfgLs::IMSK.bits());
    }

    /// 执行一个 blob 作业
    ///
    /// `input` 与 `key_modifier` 先复制到中转缓冲区，作业成功后才把结果复制到
    /// `output`。长度必须与 `blob_size` 的约定一致：封装时
    /// `output.len() == blob_size(input.len())`，解封装时反之。
    pub fn run_blob(
        &mut self,
        op: BlobOp,
        input: &[u8],
        output: &mut [u8],
        key_modifier: &[u8; KEY_MODIFIER_LEN],
    ) -> JobResult<()> {
        // 超时作业可能仍在读写中转缓冲区
        self.recover_stalled()?;

        let desc = match op {
            BlobOp::Encap => BlobDescriptor::encap(
                self.bus.src,
                self.bus.dst,
                self.bus.key_modifier,
                input.len(),
            )?,
            BlobOp::Decap => BlobDescriptor::decap(
                self.bus.dst,
                self.bus.src,
                self.bus.key_modifier,
                output.len(),
            )?,
        };
        if usize::from(desc.input.len) != input.len() {
            return Err(JobError::InvalidLength(input.len()));
        }
        if usize::from(desc.output.len) != output.len() {
            return Err(JobError::InvalidLength(output.len()));
        }

        let (src, dst, key) = (self.src_ptr(), self.dst_ptr(), self.key_modifier_ptr());
        unsafe {
            ptr::copy_nonoverlapping(input.as_ptr(), src, input.len());
            ptr::copy_nonoverlapping(key_modifier.as_ptr(), key, KEY_MODIFIER_LEN);
            ptr::write_bytes(dst, 0, output.len());
        }
        self.dma.flush_buf(src, input.len());
        self.dma.flush_buf(key, KEY_MODIFIER_LEN);
        self.dma.flush_buf(dst, output.len());

        let result = self.submit_and_wait(&Descriptor::Blob(desc));
        if self.is_stalled() {
            // 中转缓冲区仍归硬件所有
            return result;
        }

        if result.is_ok() {
            self.dma.invalidate_buf(dst, output.len());
            unsafe { ptr::copy_nonoverlapping(dst, output.as_mut_ptr(), output.len()) };
        }
        self.scrub(input.len(), output.len());
        result
    }

    /// 提交描述符并等待完成
    ///
    /// 只要作业完成，无论成功与否都会释放输出环槽位。
    pub(crate) fn submit_and_wait(&mut self, desc: &Descriptor) -> JobResult<()> {
        self.recover_stalled()?;

        let (slot, desc_bus) = match desc {
            Descriptor::Blob(_) => (self.blob_desc_ptr(), self.bus.blob_desc),
            Descriptor::InstantiateRng => (self.rng_desc_ptr(), self.bus.rng_desc),
        };

        let mut words = [0u32; DESC_WORDS];
        desc.emit(&mut words);
        for (i, word) in words.iter().enumerate() {
            unsafe { write_volatile(slot.add(i), *word) };
        }
        unsafe { write_volatile(self.input_ptr(), desc_bus) };

        self.dma
            .flush_buf(slot as *const u8, DESC_WORDS * size_of::<u32>());
        self.dma
            .flush_buf(self.input_ptr() as *const u8, RING_SLOTS * size_of::<u32>());
        fence(Ordering::SeqCst);

        debug!("Submitting {} job, descriptor at 0x{:08x}", desc.name(), desc_bus);
        self.regs.write(CAAM_IRJAR0, 1);

        if let Err(e) = self.wait_done() {
            warn!("{} job did not complete, job ring stalled", desc.name());
            self.stalled = Some(desc_bus);
            return Err(e);
        }

        let result = self.collect(desc_bus);
        match result {
            Ok(()) => debug!("{} job completed", desc.name()),
            Err(e) => error!("Error: {} job: {}", desc.name(), e),
        }
        result
    }

    /// 等待 ORSFR 报告一个已完成作业
    fn wait_done(&self) -> JobResult<()> {
        for _ in 0..self.poll_limit {
            if self.regs.read(CAAM_ORSFR0) == JOB_RING_ENTRIES {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        Err(JobError::Timeout)
    }

    /// 读取输出环并释放槽位
    fn collect(&mut self, expected: u32) -> JobResult<()> {
        fence(Ordering::SeqCst);
        self.dma
            .invalidate_buf(self.output_ptr() as *const u8, 2 * RING_SLOTS * size_of::<u32>());

        let (found, status) = unsafe {
            (
                read_volatile(self.output_ptr()),
                read_volatile(self.output_ptr().add(1)),
            )
        };

        // 从输出队列移除作业
        self.regs.write(CAAM_ORJRR0, 1);

        check_output(expected, found, status)
    }

    /// 回收超时后才完成的作业
    ///
    /// 迟到作业的输出留在中转缓冲区中，直接清除，不交给任何调用者。
    fn recover_stalled(&mut self) -> JobResult<()> {
        let Some(expected) = self.stalled else {
            return Ok(());
        };
        if self.regs.read(CAAM_ORSFR0) != JOB_RING_ENTRIES {
            return Err(JobError::Busy);
        }
        self.stalled = None;
        let late = self.collect(expected);
        self.scrub(BOUNCE_LEN, BOUNCE_LEN);
        warn!("Drained late job 0x{:08x}: {:?}", expected, late);
        Ok(())
    }

    /// 清除中转缓冲区中残留的明文
    fn scrub(&mut self, src_len: usize, dst_len: usize) {
        unsafe {
            ptr::write_bytes(self.src_ptr(), 0, src_len);
            ptr::write_bytes(self.dst_ptr(), 0, dst_len);
        }
    }

    fn bus_of(&self, ptr: *mut u8, len: usize) -> JobResult<u32> {
        self.dma.bus_addr(VirtAddr::from(ptr as usize), len)
    }

    fn input_ptr(&self) -> *mut u32 {
        unsafe { addr_of_mut!((*self.mem.as_ptr()).input.0) as *mut u32 }
    }

    fn output_ptr(&self) -> *mut u32 {
        unsafe { addr_of_mut!((*self.mem.as_ptr()).output.0) as *mut u32 }
    }

    fn blob_desc_ptr(&self) -> *mut u32 {
        unsafe { addr_of_mut!((*self.mem.as_ptr()).blob_desc.0) as *mut u32 }
    }

    fn rng_desc_ptr(&self) -> *mut u32 {
        unsafe { addr_of_mut!((*self.mem.as_ptr()).rng_desc.0) as *mut u32 }
    }

    fn key_modifier_ptr(&self) -> *mut u8 {
        unsafe { addr_of_mut!((*self.mem.as_ptr()).key_modifier.0) as *mut u8 }
    }

    fn src_ptr(&self) -> *mut u8 {
        unsafe { addr_of_mut!((*self.mem.as_ptr()).src.0) as *mut u8 }
    }

    fn dst_ptr(&self) -> *mut u8 {
        unsafe { addr_of_mut!((*self.mem.as_ptr()).dst.0) as *mut u8 }
    }
}

impl<R, D> Drop for JobRing<R, D> {
    fn drop(&mut self) {
        if let Some(desc_bus) = self.stalled {
            // 硬件仍可能写输出环和中转缓冲区，只能泄漏
            warn!(
                "Leaking job ring memory, job 0x{:08x} still outstanding",
                desc_bus
            );
            return;
        }
        drop(unsafe { Box::from_raw(self.mem.as_ptr()) });
    }
}
