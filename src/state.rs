use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::arbiter::ModeArbiter;
use crate::config::ConfigStore;
use crate::events::{ComponentError, EventBus};
use crate::ingest::CameraRuntimeState;
use crate::mixer::{MixerState, SceneStore};
use crate::platform::PlatformProbe;
use crate::recording::RecordingStatus;
use crate::registry::RegistryClient;

/// Application-wide state shared across handlers
///
/// The control plane holds the arbiter; the arbiter holds the supervisors.
/// Handlers never reach around the arbiter to mutate supervisor state.
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub arbiter: Arc<ModeArbiter>,
    pub registry: Arc<RegistryClient>,
    pub scenes: Arc<SceneStore>,
    pub probe: Arc<PlatformProbe>,
    pub events: Arc<EventBus>,
    pub shutdown_tx: broadcast::Sender<()>,
    started_at: Instant,
}

/// One camera in the aggregate status, enriched with its playback URL
#[derive(Serialize)]
pub struct CameraStatusView {
    #[serde(flatten)]
    pub state: CameraRuntimeState,
    pub whep_url: String,
}

#[derive(Serialize)]
pub struct RegistryHealth {
    pub healthy: bool,
    pub error: Option<ComponentError>,
}

/// Aggregate status: per-component snapshots taken independently and
/// stitched together. Eventually consistent by design; no supervisor lock
/// is held while assembling it.
#[derive(Serialize)]
pub struct AggregateStatus {
    pub mode: Option<String>,
    pub switching: bool,
    pub cameras: BTreeMap<String, CameraStatusView>,
    pub recording: RecordingStatus,
    pub mixer: MixerState,
    pub registry: RegistryHealth,
    pub uptime_secs: u64,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ConfigStore>,
        arbiter: Arc<ModeArbiter>,
        registry: Arc<RegistryClient>,
        scenes: Arc<SceneStore>,
        probe: Arc<PlatformProbe>,
        events: Arc<EventBus>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            arbiter,
            registry,
            scenes,
            probe,
            events,
            shutdown_tx,
            started_at: Instant::now(),
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Subscribe to the shutdown signal
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Assemble the aggregate status from independent snapshots
    pub async fn aggregate_status(&self) -> AggregateStatus {
        let mode = self.arbiter.current_mode().await;
        let cameras = self
            .arbiter
            .ingest()
            .snapshot_all()
            .await
            .into_iter()
            .map(|state| {
                let whep_url = self.registry.whep_url(&state.camera_id);
                (state.camera_id.clone(), CameraStatusView { state, whep_url })
            })
            .collect();
        let recording = self.arbiter.recording().status().await;
        let mixer = self.arbiter.mixer().snapshot();

        let healthy = self.registry.healthy().await;
        let registry = RegistryHealth {
            healthy,
            error: (!healthy)
                .then(|| ComponentError::now("registry_unavailable", "stream registry unreachable")),
        };

        AggregateStatus {
            mode: mode.map(|m| m.as_str().to_string()),
            switching: self.arbiter.is_switching(),
            cameras,
            recording,
            mixer,
            registry,
            uptime_secs: self.uptime_secs(),
        }
    }
}
