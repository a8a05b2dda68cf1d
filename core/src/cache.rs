//! CPU 缓存与加速器之间的一致性维护

use memory_addr::{VirtAddr, VirtAddrRange};

use crate::error::{JobError, JobResult};

/// 平台 DMA 对齐粒度 (cache line)
pub const DMA_MINALIGN: usize = 64;

/// 向下对齐到 DMA 粒度
#[inline]
pub const fn align_down(addr: usize) -> usize {
    memory_addr::align_down(addr, DMA_MINALIGN)
}

/// 向上对齐到 DMA 粒度
#[inline]
pub const fn align_up(addr: usize) -> usize {
    memory_addr::align_up(addr, DMA_MINALIGN)
}

/// 覆盖 `[start, start + len)` 的 DMA 对齐区间
///
/// 两端向外扩展到 cache line 边界，因此可能波及相邻数据。
pub fn dma_range(start: usize, len: usize) -> VirtAddrRange {
    let end = start.saturating_add(len);
    VirtAddrRange::new(
        VirtAddr::from(align_down(start)),
        VirtAddr::from(align_up(end)),
    )
}

/// CPU 与加速器共享内存的操作
pub trait DmaOps {
    /// 获取加速器访问 `[vaddr, vaddr + len)` 时使用的总线地址
    fn bus_addr(&self, vaddr: VirtAddr, len: usize) -> JobResult<u32>;

    /// 写回 (clean) 区间内的 cache line，使设备能看到 CPU 的写入
    fn flush(&self, range: VirtAddrRange);

    /// 丢弃区间内的 cache line，使 CPU 随后的读取能看到设备的写入
    ///
    /// 区间两端的 cache line 可能与其他数据共享，实现必须先写回再丢弃，
    /// 不能直接丢掉 CPU 的脏数据。
    fn invalidate(&self, range: VirtAddrRange);

    /// 按 DMA 粒度写回一个缓冲区
    fn flush_buf(&self, ptr: *const u8, len: usize) {
        if len != 0 {
            self.flush(dma_range(ptr as usize, len));
        }
    }

    /// 按 DMA 粒度无效化一个缓冲区
    fn invalidate_buf(&self, ptr: *const u8, len: usize) {
        if len != 0 {
            self.invalidate(dma_range(ptr as usize, len));
        }
    }
}

/// 物理地址与虚拟地址恒等映射时的缓存操作
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuDma;

impl DmaOps for CpuDma {
    fn bus_addr(&self, vaddr: VirtAddr, len: usize) -> JobResult<u32> {
        let start = vaddr.as_usize();
        let last = start.saturating_add(len.saturating_sub(1));
        if u32::try_from(last).is_err() {
            return Err(JobError::AddressOutOfRange(start));
        }
        u32::try_from(start).map_err(|_| JobError::AddressOutOfRange(start))
    }

    fn flush(&self, range: VirtAddrRange) {
        arch::clean_dcache_range(range.start.as_usize(), range.end.as_usize());
    }

    fn invalidate(&self, range: VirtAddrRange) {
        arch::invalidate_dcache_range(range.start.as_usize(), range.end.as_usize());
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        mod arch {
            use super::DMA_MINALIGN;
            use core::arch::asm;

            pub fn clean_dcache_range(start: usize, end: usize) {
                for line in (start..end).step_by(DMA_MINALIGN) {
                    unsafe { asm!("dc cvac, {0}", in(reg) line) };
                }
                unsafe { asm!("dsb sy") };
            }

            // civac 而不是 ivac：同一 cache line 上的脏数据先写回
            pub fn invalidate_dcache_range(start: usize, end: usize) {
                for line in (start..end).step_by(DMA_MINALIGN) {
                    unsafe { asm!("dc civac, {0}", in(reg) line) };
                }
                unsafe { asm!("dsb sy") };
            }
        }
    } else if #[cfg(target_arch = "riscv64")] {
        mod arch {
            // 使用 fence 指令确保内存一致性
            pub fn clean_dcache_range(_start: usize, _end: usize) {
                unsafe { core::arch::asm!("fence iorw, iorw") };
            }

            pub fn invalidate_dcache_range(_start: usize, _end: usize) {
                unsafe { core::arch::asm!("fence iorw, iorw") };
            }
        }
    } else {
        mod arch {
            use core::sync::atomic::{Ordering, fence};

            pub fn clean_dcache_range(_start: usize, _end: usize) {
                fence(Ordering::SeqCst);
            }

            pub fn invalidate_dcache_range(_start: usize, _end: usize) {
                fence(Ordering::SeqCst);
            }
        }
    }
}
