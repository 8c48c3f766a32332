//! CPU primitives the mapping layer relies on: the page size, masking interrupts around
//! address-space bookkeeping, and cache maintenance for non-snooping devices.
//!
//! Real x86_64 targets get the privileged instructions. Tests and the
//! `software-emulation` feature get host-safe stand-ins with the same signatures.

// Always compiled on x86_64 so the hardware path is type-checked by every test run.
#[cfg(target_arch = "x86_64")]
#[cfg_attr(any(test, feature = "software-emulation"), allow(dead_code))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use self::x86_64::*;

#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;
