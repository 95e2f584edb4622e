use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const HD1080: Resolution = Resolution {
        width: 1920,
        height: 1080,
    };
    pub const UHD4K: Resolution = Resolution {
        width: 3840,
        height: 2160,
    };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Source counts as 4K from 2160p upward
    pub fn is_4k(&self) -> bool {
        self.height >= 2160
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| AppError::ConfigInvalid(format!("invalid resolution '{}'", s)))?;
        let width = w
            .trim()
            .parse()
            .map_err(|_| AppError::ConfigInvalid(format!("invalid resolution width '{}'", w)))?;
        let height = h
            .trim()
            .parse()
            .map_err(|_| AppError::ConfigInvalid(format!("invalid resolution height '{}'", h)))?;
        Ok(Self { width, height })
    }
}

impl Serialize for Resolution {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Resolution {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Video codec selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    H265,
}

impl Codec {
    /// Container extension for recordings; H.265 goes into Matroska
    /// because fragmented MP4 support for HEVC is uneven across players.
    pub fn recording_extension(&self) -> &'static str {
        match self {
            Codec::H264 => "mp4",
            Codec::H265 => "mkv",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::H264 => write!(f, "h264"),
            Codec::H265 => write!(f, "h265"),
        }
    }
}

/// Per-camera configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CameraConfig {
    /// Stable camera identity, unique in configuration
    pub id: String,
    /// Capture device path (e.g., /dev/video0)
    pub device: String,
    /// Whether to run an ingest supervisor for this camera
    pub enabled: bool,
    /// Desired output resolution
    pub resolution: Resolution,
    /// Desired framerate
    pub framerate: u32,
    /// Encoder bit rate in kbps
    pub bitrate: u32,
    /// Encoder codec
    pub codec: Codec,
    /// ALSA audio capture device (e.g., "hw:1,0")
    pub audio_device: Option<String>,
    /// Include an audio branch in the ingest pipeline
    pub audio_enabled: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            device: String::new(),
            enabled: false,
            resolution: Resolution::HD1080,
            framerate: 30,
            bitrate: 4000,
            codec: Codec::H264,
            audio_device: None,
            audio_enabled: false,
        }
    }
}

/// Recording configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecordingConfig {
    /// Recordings root directory
    pub base_path: PathBuf,
    /// Free-space gate for new sessions (GiB)
    pub min_free_gb_start: f64,
    /// Free-space floor that auto-stops an active session (GiB)
    pub min_free_gb_stop: f64,
    /// Fragment cadence in seconds
    pub segment_seconds: u32,
    /// Disk watchdog sample interval in seconds
    pub disk_watchdog_secs: u64,
    /// Stall watchdog sample interval in seconds
    pub stall_watchdog_secs: u64,
    /// Per-pipeline deadline when stopping a session, in seconds
    pub stop_deadline_secs: u64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("recordings"),
            min_free_gb_start: 10.0,
            min_free_gb_stop: 5.0,
            segment_seconds: 1,
            disk_watchdog_secs: 5,
            stall_watchdog_secs: 10,
            stop_deadline_secs: 30,
        }
    }
}

/// Mixer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MixerConfig {
    /// Program output resolution
    pub output_resolution: Resolution,
    /// Program output bit rate in kbps
    pub output_bitrate: u32,
    /// Program output codec
    pub output_codec: Codec,
    /// Program output framerate
    pub output_framerate: u32,
    /// Scenes directory
    pub scenes_path: PathBuf,
    /// Bulk audio delay applied to every input, in milliseconds
    pub audio_delay_ms: u32,
    /// Poll cadence for placeholder slots waiting on a source, in seconds
    pub placeholder_poll_secs: u64,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            output_resolution: Resolution::HD1080,
            output_bitrate: 6000,
            output_codec: Codec::H264,
            output_framerate: 30,
            scenes_path: PathBuf::from("scenes"),
            audio_delay_ms: 0,
            placeholder_poll_secs: 1,
        }
    }
}

/// Operating mode selection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModeConfig {
    /// Initial mode when no persisted state exists
    pub default: String,
    /// Whether to persist the chosen mode across restarts
    pub persist_state: bool,
    /// State file location
    pub state_path: PathBuf,
    /// Command line for the peer WebRTC stack, first element is the binary
    pub peer_command: Vec<String>,
    /// Per-service stop deadline during a switch, in seconds
    pub stop_deadline_secs: u64,
    /// Per-service start deadline during a switch, in seconds
    pub start_deadline_secs: u64,
    /// How long to wait for capture devices to be released, in seconds
    pub device_release_secs: u64,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            default: "recorder".to_string(),
            persist_state: true,
            state_path: PathBuf::from("mode_state.json"),
            peer_command: Vec::new(),
            stop_deadline_secs: 5,
            start_deadline_secs: 10,
            device_release_secs: 3,
        }
    }
}

/// Ingest supervisor tuning
///
/// The defaults were tuned on RK3588 hardware; they are exposed here so a
/// deployment can adapt to slower HDMI bridges without a rebuild.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IngestConfig {
    /// Source signal sample cadence in seconds
    pub sample_interval_secs: u64,
    /// Debounce before restarting on the first resolution change, in ms
    pub debounce_ms: u64,
    /// Debounce ceiling when the source keeps flapping, in ms
    pub debounce_max_ms: u64,
    /// Window in which repeated changes escalate the debounce, in seconds
    pub debounce_window_secs: u64,
    /// Publication gate deadline, in seconds
    pub publish_timeout_secs: u64,
    /// Pipeline start deadline, in seconds
    pub start_timeout_secs: u64,
    /// Restart backoff schedule in seconds, last entry is the cap
    pub restart_backoff_secs: Vec<u64>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 2,
            debounce_ms: 1000,
            debounce_max_ms: 5000,
            debounce_window_secs: 30,
            publish_timeout_secs: 15,
            start_timeout_secs: 10,
            restart_backoff_secs: vec![1, 2, 5, 10, 30],
        }
    }
}

/// Embedded stream server endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamServerConfig {
    /// Control API base (path listing, dynamic path creation)
    pub api_url: String,
    /// RTSP base used by publishers and subscribers
    pub rtsp_url: String,
    /// HTTP base for WHEP playback / WHIP ingestion
    pub webrtc_url: String,
}

impl Default for StreamServerConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:9997".to_string(),
            rtsp_url: "rtsp://127.0.0.1:8554".to_string(),
            webrtc_url: "http://127.0.0.1:8889".to_string(),
        }
    }
}

/// Web server settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub cameras: Vec<CameraConfig>,
    pub recording: RecordingConfig,
    pub mixer: MixerConfig,
    pub mode: ModeConfig,
    pub ingest: IngestConfig,
    pub stream_server: StreamServerConfig,
    pub web: WebConfig,
    /// Sessions metadata directory
    pub sessions_path: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cameras: Vec::new(),
            recording: RecordingConfig::default(),
            mixer: MixerConfig::default(),
            mode: ModeConfig::default(),
            ingest: IngestConfig::default(),
            stream_server: StreamServerConfig::default(),
            web: WebConfig::default(),
            sessions_path: PathBuf::from("sessions"),
        }
    }
}

impl AppConfig {
    /// Validate invariants that serde cannot express
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for cam in &self.cameras {
            if cam.id.is_empty() {
                return Err(AppError::ConfigInvalid("camera with empty id".into()));
            }
            if !cam
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(AppError::ConfigInvalid(format!(
                    "camera id '{}' contains characters unsafe for stream paths",
                    cam.id
                )));
            }
            if !seen.insert(cam.id.as_str()) {
                return Err(AppError::ConfigInvalid(format!(
                    "duplicate camera id '{}'",
                    cam.id
                )));
            }
            if cam.device.is_empty() {
                return Err(AppError::ConfigInvalid(format!(
                    "camera '{}' has no capture device",
                    cam.id
                )));
            }
            if cam.framerate == 0 || cam.bitrate == 0 {
                return Err(AppError::ConfigInvalid(format!(
                    "camera '{}' has zero framerate or bitrate",
                    cam.id
                )));
            }
            if cam.resolution.width == 0 || cam.resolution.height == 0 {
                return Err(AppError::ConfigInvalid(format!(
                    "camera '{}' has an empty resolution",
                    cam.id
                )));
            }
        }

        if self.recording.min_free_gb_stop >= self.recording.min_free_gb_start {
            return Err(AppError::ConfigInvalid(
                "recording.min_free_gb_stop must be below min_free_gb_start".into(),
            ));
        }
        if self.recording.segment_seconds == 0 {
            return Err(AppError::ConfigInvalid(
                "recording.segment_seconds must be at least 1".into(),
            ));
        }

        match self.mode.default.as_str() {
            "recorder" | "peer_webrtc" => {}
            other => {
                return Err(AppError::ConfigInvalid(format!(
                    "mode.default '{}' is not one of recorder, peer_webrtc",
                    other
                )))
            }
        }

        if self.ingest.restart_backoff_secs.is_empty() {
            return Err(AppError::ConfigInvalid(
                "ingest.restart_backoff_secs must not be empty".into(),
            ));
        }

        Ok(())
    }

    /// Find a configured camera by id
    pub fn camera(&self, id: &str) -> Option<&CameraConfig> {
        self.cameras.iter().find(|c| c.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_camera(id: &str) -> CameraConfig {
        CameraConfig {
            id: id.to_string(),
            device: "/dev/video0".to_string(),
            enabled: true,
            ..CameraConfig::default()
        }
    }

    #[test]
    fn test_resolution_parse() {
        let r: Resolution = "1920x1080".parse().unwrap();
        assert_eq!(r, Resolution::HD1080);
        assert!(!r.is_4k());
        assert!("3840x2160".parse::<Resolution>().unwrap().is_4k());
        assert!("1920".parse::<Resolution>().is_err());
        assert!("axb".parse::<Resolution>().is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
cameras:
  - id: cam0
    device: /dev/video0
    enabled: true
    resolution: 1920x1080
    framerate: 30
    bitrate: 4000
    codec: h264
recording:
  min_free_gb_start: 12
mode:
  default: recorder
"#;
        let cfg: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.cameras.len(), 1);
        assert_eq!(cfg.cameras[0].id, "cam0");
        assert_eq!(cfg.cameras[0].codec, Codec::H264);
        assert_eq!(cfg.recording.min_free_gb_start, 12.0);
        // untouched keys keep their defaults
        assert_eq!(cfg.recording.min_free_gb_stop, 5.0);
        assert_eq!(cfg.ingest.sample_interval_secs, 2);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_duplicate_camera_id_rejected() {
        let cfg = AppConfig {
            cameras: vec![valid_camera("cam0"), valid_camera("cam0")],
            ..AppConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(AppError::ConfigInvalid(_))));
    }

    #[test]
    fn test_disk_floors_ordering_enforced() {
        let mut cfg = AppConfig::default();
        cfg.recording.min_free_gb_start = 5.0;
        cfg.recording.min_free_gb_stop = 5.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_unsafe_camera_id_rejected() {
        let cfg = AppConfig {
            cameras: vec![valid_camera("cam/0")],
            ..AppConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_codec_recording_extension() {
        assert_eq!(Codec::H264.recording_extension(), "mp4");
        assert_eq!(Codec::H265.recording_extension(), "mkv");
    }
}
