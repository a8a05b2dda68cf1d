//! Hardware-facing building blocks for the Freescale/NXP CAAM job ring.
//!
//! This crate has no notion of a device lifecycle: it only knows the register
//! map, how to keep CPU caches coherent with the accelerator, and how to encode
//! command descriptors. `caam-api` drives these pieces.

#![cfg_attr(not(test), no_std)]

pub mod cache;
pub mod desc;
pub mod error;
pub mod regs;

pub use cache::{CpuDma, DmaOps};
pub use desc::{BlobDescriptor, BlobOp, Descriptor, Operand, blob_size};
pub use error::{JobError, JobResult};
pub use regs::{MmioRegs, RegisterAccess};

/// CAAM 物理基地址
pub const CAAM_PHYS_BASE: usize = 0x0210_0000;

/// CCM (时钟控制模块) 物理基地址
pub const CCM_PHYS_BASE: usize = 0x020C_4000;
