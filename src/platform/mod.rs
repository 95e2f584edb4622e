//! Platform probing
//!
//! Detects the SoC, the available hardware encoder elements and the capture
//! device capabilities. Everything else in the system is codec-agnostic and
//! consumes [`EncoderProfile`]s resolved here.

pub mod capture;
pub mod probe;

pub use capture::{probe_capture, sample_source, wait_device_released, CaptureCaps};
pub use probe::{EncoderProfile, PlatformProbe, SocFamily};
