//! Capture device interrogation (V4L2)
//!
//! Three bounded operations against a capture node: capability probing,
//! current-source sampling and a busy probe. All of them open the device
//! briefly and close it again; none of them keeps buffers queued. The
//! blocking ioctls run on the blocking pool.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use tokio::time::Instant;
use v4l::video::Capture;

use crate::config::Resolution;
use crate::error::{AppError, Result};

/// Capabilities reported by a capture device
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureCaps {
    pub native_resolutions: Vec<Resolution>,
    pub framerates: Vec<u32>,
    pub pixel_formats: Vec<String>,
}

impl CaptureCaps {
    pub fn is_empty(&self) -> bool {
        self.native_resolutions.is_empty() && self.pixel_formats.is_empty()
    }
}

/// Probe a capture device's formats, frame sizes and frame rates.
///
/// A disconnected or missing device yields empty capabilities, not an error.
pub async fn probe_capture(device: impl AsRef<Path>) -> CaptureCaps {
    let path = device.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || probe_capture_blocking(&path))
        .await
        .unwrap_or_default()
}

fn probe_capture_blocking(path: &Path) -> CaptureCaps {
    let dev = match v4l::Device::with_path(path) {
        Ok(dev) => dev,
        Err(_) => return CaptureCaps::default(),
    };

    let mut caps = CaptureCaps::default();
    let mut resolutions = BTreeSet::new();
    let mut framerates = BTreeSet::new();

    let formats = dev.enum_formats().unwrap_or_default();
    for desc in &formats {
        caps.pixel_formats.push(desc.fourcc.to_string());

        for size in dev.enum_framesizes(desc.fourcc).unwrap_or_default() {
            match size.size {
                v4l::framesize::FrameSizeEnum::Discrete(discrete) => {
                    resolutions.insert((discrete.width, discrete.height));
                    let intervals = dev
                        .enum_frameintervals(desc.fourcc, discrete.width, discrete.height)
                        .unwrap_or_default();
                    for interval in intervals {
                        if let v4l::frameinterval::FrameIntervalEnum::Discrete(frac) =
                            interval.interval
                        {
                            if frac.numerator > 0 {
                                framerates.insert(frac.denominator / frac.numerator);
                            }
                        }
                    }
                }
                v4l::framesize::FrameSizeEnum::Stepwise(step) => {
                    // HDMI bridges report stepwise, keep the common modes
                    for (w, h) in [(1280, 720), (1920, 1080), (3840, 2160)] {
                        if w >= step.min_width
                            && w <= step.max_width
                            && h >= step.min_height
                            && h <= step.max_height
                        {
                            resolutions.insert((w, h));
                        }
                    }
                }
            }
        }
    }

    caps.native_resolutions = resolutions
        .into_iter()
        .map(|(w, h)| Resolution::new(w, h))
        .collect();
    caps.framerates = framerates.into_iter().collect();
    caps
}

/// Sample the source resolution currently seen by the device.
///
/// `None` means no signal: the device is missing, refuses to open, or
/// reports an empty active format (HDMI bridges do exactly that when the
/// cable is unplugged).
pub async fn sample_source(device: impl AsRef<Path>) -> Option<Resolution> {
    let path = device.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || sample_source_blocking(&path))
        .await
        .ok()
        .flatten()
}

fn sample_source_blocking(path: &Path) -> Option<Resolution> {
    let dev = v4l::Device::with_path(path).ok()?;
    let fmt = dev.format().ok()?;
    if fmt.width == 0 || fmt.height == 0 {
        return None;
    }
    Some(Resolution::new(fmt.width, fmt.height))
}

/// Check whether anything is currently streaming from the device.
///
/// Requesting a single mmap buffer fails with EBUSY while another process
/// holds the queue; the buffer is released again on drop. A missing device
/// counts as free.
pub async fn device_is_free(device: impl AsRef<Path>) -> bool {
    let path = device.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || device_is_free_blocking(&path))
        .await
        .unwrap_or(true)
}

fn device_is_free_blocking(path: &Path) -> bool {
    let dev = match v4l::Device::with_path(path) {
        Ok(dev) => dev,
        Err(_) => return true,
    };
    match v4l::io::mmap::Stream::with_buffers(&dev, v4l::buffer::Type::VideoCapture, 1) {
        Ok(_) => true,
        Err(e) => e.raw_os_error() != Some(nix::errno::Errno::EBUSY as i32),
    }
}

/// Wait until the device is released, bounded by `deadline`.
pub async fn wait_device_released(device: impl AsRef<Path>, deadline: Duration) -> Result<()> {
    let path = device.as_ref().to_path_buf();
    let until = Instant::now() + deadline;
    loop {
        if device_is_free(&path).await {
            return Ok(());
        }
        if Instant::now() >= until {
            return Err(AppError::DeviceBusy(path.display().to_string()));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_device_has_empty_caps() {
        let caps = probe_capture("/dev/video-does-not-exist").await;
        assert!(caps.is_empty());
    }

    #[tokio::test]
    async fn test_missing_device_has_no_signal() {
        assert_eq!(sample_source("/dev/video-does-not-exist").await, None);
    }

    #[tokio::test]
    async fn test_missing_device_counts_as_free() {
        assert!(device_is_free("/dev/video-does-not-exist").await);
        wait_device_released("/dev/video-does-not-exist", Duration::from_millis(200))
            .await
            .unwrap();
    }
}
