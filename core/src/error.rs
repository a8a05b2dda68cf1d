//! CAAM 错误类型定义

use core::fmt;

/// 作业环操作错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobError {
    /// 输出环回显的描述符地址与提交的不一致
    DescriptorMismatch {
        /// 提交的描述符总线地址
        expected: u32,
        /// 硬件回显的地址
        found: u32,
    },
    /// 硬件在状态字中报告错误
    AcceleratorFault(u32),
    /// 轮询超时
    Timeout,
    /// 仍有作业未完成
    Busy,
    /// 设备未初始化
    NotInitialized,
    /// 设备已经打开
    AlreadyOpen,
    /// 长度超出描述符 16 位长度字段
    InvalidLength(usize),
    /// 调用者提供的缓冲区太小
    BufferTooSmall { needed: usize, actual: usize },
    /// 缓冲区不在 32 位设备地址空间内
    AddressOutOfRange(usize),
}

impl JobError {
    /// 获取错误码 (兼容 Linux errno 风格)
    pub fn as_errno(&self) -> i32 {
        match self {
            JobError::DescriptorMismatch { .. } => -5, // EIO
            JobError::AcceleratorFault(_) => -5,
            JobError::Timeout => -110,        // ETIMEDOUT
            JobError::Busy => -16,            // EBUSY
            JobError::NotInitialized => -19,  // ENODEV
            JobError::AlreadyOpen => -114,    // EALREADY
            JobError::InvalidLength(_) => -22, // EINVAL
            JobError::BufferTooSmall { .. } => -22,
            JobError::AddressOutOfRange(_) => -14, // EFAULT
        }
    }

    /// 重新提交相同作业是否可能成功
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::AcceleratorFault(_))
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DescriptorMismatch { expected, found } => write!(
                f,
                "Output ring descriptor address mismatch: expected 0x{expected:08x}, found 0x{found:08x}"
            ),
            Self::AcceleratorFault(status) => {
                write!(f, "Job completed with errors 0x{status:08x}")
            }
            Self::Timeout => write!(f, "Timed out waiting for the job ring"),
            Self::Busy => write!(f, "Job ring still has an outstanding job"),
            Self::NotInitialized => write!(f, "Device not opened"),
            Self::AlreadyOpen => write!(f, "Device already opened"),
            Self::InvalidLength(len) => write!(f, "Operand length {len} exceeds 0xffff"),
            Self::BufferTooSmall { needed, actual } => {
                write!(f, "Buffer too small: need {needed} bytes, got {actual}")
            }
            Self::AddressOutOfRange(addr) => {
                write!(f, "Address 0x{addr:x} not reachable by the accelerator")
            }
        }
    }
}

pub type JobResult<T> = Result<T, JobError>;
