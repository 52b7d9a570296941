#![forbid(unsafe_code)]

//! Capability contracts shared across cryptdrive.
//!
//! The orchestration crate only talks to the host through these traits so the
//! vault lifecycle can be driven against fakes in tests and against
//! `cryptsetup`/`losetup`/`mount` on a real system.

pub mod block;
pub mod crypto;

pub use block::{BlockDevice, LoopDevice};
pub use crypto::{Credential, CryptoVolume, LuksState};
