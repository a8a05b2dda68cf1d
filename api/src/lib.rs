//! CAAM (Cryptographic Acceleration and Assurance Module) job ring driver.
//!
//! This is a no_std driver for the single-entry job ring interface, used to
//! encapsulate/decapsulate secret blobs and to instantiate the hardware RNG.
//! All jobs are submitted synchronously and polled to completion.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate log;
extern crate alloc;

pub mod config;
pub mod device;
pub mod platform;
pub mod ring;

#[cfg(test)]
mod sim;

pub use caam_core::{JobError, JobResult, blob_size, desc::KEY_MODIFIER_LEN};
pub use config::{CaamConfig, RngTrim};
pub use device::{CaamDevice, CaamState};
pub use platform::{RngFault, RngState};
pub use ring::JobRing;
