pub mod schema;
pub mod store;

pub use schema::{
    AppConfig, CameraConfig, Codec, IngestConfig, MixerConfig, ModeConfig, RecordingConfig,
    Resolution, StreamServerConfig, WebConfig,
};
pub use store::ConfigStore;
