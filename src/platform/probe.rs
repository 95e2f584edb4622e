//! Encoder probing
//!
//! Resolves an [`EncoderProfile`] per requested codec: a hardware element
//! when the platform has one, otherwise a software fallback tuned for low
//! latency. Encoder choice materially affects CPU load and stability, so it
//! is isolated here and nothing else hard-codes element names.

use gstreamer as gst;

use crate::config::Codec;
use crate::error::{AppError, Result};
use crate::pipeline::description::PropertyValue;

/// Detected SoC family, drives the hardware encoder preference order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocFamily {
    /// RK3588 / RK3588S, both MPP encoder paths are solid
    Rk3588,
    /// RK3566 / RK3568, the MPP H.264 path is known to wedge under load
    Rk356x,
    Unknown,
}

impl SocFamily {
    /// Parse from the flattened device-tree compatible string
    fn from_compatible(compatible: &str) -> Self {
        if compatible.contains("rk3588") {
            SocFamily::Rk3588
        } else if compatible.contains("rk3566") || compatible.contains("rk3568") {
            SocFamily::Rk356x
        } else {
            SocFamily::Unknown
        }
    }

    fn detect() -> Self {
        match std::fs::read("/proc/device-tree/compatible") {
            Ok(raw) => Self::from_compatible(&String::from_utf8_lossy(&raw)),
            Err(_) => SocFamily::Unknown,
        }
    }
}

/// Resolved encoder: element name plus the properties the builder applies
#[derive(Debug, Clone)]
pub struct EncoderProfile {
    pub codec: Codec,
    /// Encoder element factory name
    pub element: String,
    pub properties: Vec<(String, PropertyValue)>,
    /// Stream parser placed after the encoder
    pub parser: &'static str,
    pub is_hardware: bool,
}

/// Platform probe, created once at startup
pub struct PlatformProbe {
    soc: SocFamily,
    is_available: Box<dyn Fn(&str) -> bool + Send + Sync>,
}

impl PlatformProbe {
    /// Probe the running system. GStreamer must be initialized.
    pub fn detect() -> Self {
        let soc = SocFamily::detect();
        tracing::info!(?soc, "Platform probe");
        Self {
            soc,
            is_available: Box::new(|name| gst::ElementFactory::find(name).is_some()),
        }
    }

    /// Probe with an injected element lookup (tests)
    pub fn with_lookup(
        soc: SocFamily,
        is_available: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            soc,
            is_available: Box::new(is_available),
        }
    }

    pub fn soc(&self) -> SocFamily {
        self.soc
    }

    /// Hardware encoder candidates in preference order for this SoC
    fn hardware_candidates(&self, codec: Codec) -> &'static [&'static str] {
        match (codec, self.soc) {
            // MPP H.264 wedges on RK356x, go through the V4L2 stateful path
            (Codec::H264, SocFamily::Rk356x) => &["v4l2h264enc"],
            (Codec::H264, _) => &["mpph264enc", "v4l2h264enc"],
            (Codec::H265, _) => &["mpph265enc", "v4l2h265enc"],
        }
    }

    /// Resolve an encoder profile
    ///
    /// Rate control is CBR at the configured bit rate, the GOP is one second
    /// (one key frame per `framerate` frames) and B-frames are disabled so
    /// recordings fragment cleanly and subscribers join fast.
    pub fn resolve(
        &self,
        codec: Codec,
        is_4k_source: bool,
        bitrate_kbps: u32,
        framerate: u32,
    ) -> Result<EncoderProfile> {
        for candidate in self.hardware_candidates(codec) {
            if (self.is_available)(candidate) {
                return Ok(self.hardware_profile(codec, candidate, bitrate_kbps, framerate));
            }
        }

        let software = match codec {
            Codec::H264 => "x264enc",
            Codec::H265 => "x265enc",
        };
        if (self.is_available)(software) {
            return Ok(Self::software_profile(
                codec,
                software,
                is_4k_source,
                bitrate_kbps,
                framerate,
            ));
        }

        Err(AppError::NoEncoder(codec.to_string()))
    }

    /// Decoder element for mixer branches, hardware first
    pub fn resolve_decoder(&self, codec: Codec) -> Result<String> {
        if (self.is_available)("mppvideodec") {
            return Ok("mppvideodec".to_string());
        }
        let software = match codec {
            Codec::H264 => "avdec_h264",
            Codec::H265 => "avdec_h265",
        };
        if (self.is_available)(software) {
            return Ok(software.to_string());
        }
        Err(AppError::NoEncoder(format!("{} decoder", codec)))
    }

    fn hardware_profile(
        &self,
        codec: Codec,
        element: &str,
        bitrate_kbps: u32,
        framerate: u32,
    ) -> EncoderProfile {
        let properties = if element.starts_with("mpp") {
            vec![
                ("rc-mode".to_string(), PropertyValue::from_str_value("cbr")),
                (
                    "bps".to_string(),
                    PropertyValue::Int(bitrate_kbps as i64 * 1000),
                ),
                ("gop".to_string(), PropertyValue::Int(framerate as i64)),
            ]
        } else {
            // v4l2 stateful encoders take everything through extra-controls
            vec![(
                "extra-controls".to_string(),
                PropertyValue::from_str_value(format!(
                    "controls,video_bitrate={},video_gop_size={},video_b_frames=0",
                    bitrate_kbps as u64 * 1000,
                    framerate
                )),
            )]
        };

        EncoderProfile {
            codec,
            element: element.to_string(),
            properties,
            parser: Self::parser(codec),
            is_hardware: true,
        }
    }

    fn software_profile(
        codec: Codec,
        element: &str,
        is_4k_source: bool,
        bitrate_kbps: u32,
        framerate: u32,
    ) -> EncoderProfile {
        let preset = if is_4k_source { "ultrafast" } else { "veryfast" };
        let threads: u64 = if is_4k_source { 8 } else { 4 };

        let mut properties = vec![
            ("tune".to_string(), PropertyValue::from_str_value("zerolatency")),
            (
                "speed-preset".to_string(),
                PropertyValue::from_str_value(preset),
            ),
            (
                "bitrate".to_string(),
                PropertyValue::UInt(bitrate_kbps as u64),
            ),
            (
                "key-int-max".to_string(),
                PropertyValue::Int(framerate as i64),
            ),
        ];
        if codec == Codec::H264 {
            properties.push(("bframes".to_string(), PropertyValue::UInt(0)));
            properties.push(("sliced-threads".to_string(), PropertyValue::Bool(true)));
            properties.push(("threads".to_string(), PropertyValue::UInt(threads)));
        }

        EncoderProfile {
            codec,
            element: element.to_string(),
            properties,
            parser: Self::parser(codec),
            is_hardware: false,
        }
    }

    fn parser(codec: Codec) -> &'static str {
        match codec {
            Codec::H264 => "h264parse",
            Codec::H265 => "h265parse",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soc_from_compatible() {
        assert_eq!(
            SocFamily::from_compatible("radxa,rock-5b\0rockchip,rk3588"),
            SocFamily::Rk3588
        );
        assert_eq!(
            SocFamily::from_compatible("pine64,quartz64-a\0rockchip,rk3566"),
            SocFamily::Rk356x
        );
        assert_eq!(SocFamily::from_compatible("raspberrypi,4"), SocFamily::Unknown);
    }

    #[test]
    fn test_hardware_preferred() {
        let probe = PlatformProbe::with_lookup(SocFamily::Rk3588, |name| {
            name == "mpph264enc" || name == "x264enc"
        });
        let profile = probe.resolve(Codec::H264, false, 4000, 30).unwrap();
        assert_eq!(profile.element, "mpph264enc");
        assert!(profile.is_hardware);
        assert_eq!(profile.parser, "h264parse");
    }

    #[test]
    fn test_rk356x_skips_mpp_h264() {
        let probe = PlatformProbe::with_lookup(SocFamily::Rk356x, |name| {
            name == "mpph264enc" || name == "x264enc"
        });
        // mpph264enc is present but blacklisted on this SoC
        let profile = probe.resolve(Codec::H264, false, 4000, 30).unwrap();
        assert_eq!(profile.element, "x264enc");
        assert!(!profile.is_hardware);
    }

    #[test]
    fn test_software_fallback_is_low_latency() {
        let probe = PlatformProbe::with_lookup(SocFamily::Unknown, |name| name == "x264enc");
        let profile = probe.resolve(Codec::H264, false, 2500, 25).unwrap();
        assert_eq!(profile.element, "x264enc");
        assert!(profile
            .properties
            .iter()
            .any(|(k, v)| k == "tune" && matches!(v, PropertyValue::FromStr(s) if s == "zerolatency")));
        assert!(profile
            .properties
            .iter()
            .any(|(k, v)| k == "key-int-max" && matches!(v, PropertyValue::Int(25))));
    }

    #[test]
    fn test_4k_uses_faster_preset() {
        let probe = PlatformProbe::with_lookup(SocFamily::Unknown, |name| name == "x264enc");
        let profile = probe.resolve(Codec::H264, true, 8000, 30).unwrap();
        assert!(profile
            .properties
            .iter()
            .any(|(k, v)| k == "speed-preset" && matches!(v, PropertyValue::FromStr(s) if s == "ultrafast")));
    }

    #[test]
    fn test_no_encoder_at_all() {
        let probe = PlatformProbe::with_lookup(SocFamily::Unknown, |_| false);
        assert!(matches!(
            probe.resolve(Codec::H265, false, 4000, 30),
            Err(AppError::NoEncoder(_))
        ));
    }
}
