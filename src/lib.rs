//! stagebox - on-device multi-camera capture, mixing and recording
//!
//! This crate is the media-pipeline supervisor of an appliance built around
//! a small ARM SoC with hardware video encoders: it builds, launches,
//! health-checks, adapts and tears down ingest, recording and mixer
//! pipelines, reconciles them with the embedded stream server, and
//! arbitrates the two mutually exclusive operating modes that compete for
//! the capture devices.

pub mod arbiter;
pub mod config;
pub mod error;
pub mod events;
pub mod ingest;
pub mod mixer;
pub mod pipeline;
pub mod platform;
pub mod recording;
pub mod registry;
pub mod state;
pub mod utils;
pub mod web;

pub use error::{AppError, Result};
