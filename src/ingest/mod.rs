//! Camera ingest
//!
//! One supervisor per enabled camera plus the [`IngestSet`] that owns them.
//! The set is mutated only by the mode arbiter; recording and mixer hold it
//! read-only and reference cameras by id.

pub mod supervisor;

pub use supervisor::{CameraRuntimeState, CameraStatus, IngestSupervisor};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{CameraConfig, IngestConfig};
use crate::events::EventBus;
use crate::platform::PlatformProbe;
use crate::registry::RegistryClient;

/// The set of running ingest supervisors
pub struct IngestSet {
    supervisors: RwLock<HashMap<String, IngestSupervisor>>,
    tuning: RwLock<IngestConfig>,
    probe: Arc<PlatformProbe>,
    registry: Arc<RegistryClient>,
    events: Arc<EventBus>,
}

impl IngestSet {
    pub fn new(
        tuning: IngestConfig,
        probe: Arc<PlatformProbe>,
        registry: Arc<RegistryClient>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            supervisors: RwLock::new(HashMap::new()),
            tuning: RwLock::new(tuning),
            probe,
            registry,
            events,
        })
    }

    /// Spawn (if needed) and enable the supervisor for a camera
    pub async fn ensure_camera(&self, camera: &CameraConfig) {
        let tuning = self.tuning.read().await.clone();
        let supervisor = {
            let mut map = self.supervisors.write().await;
            map.entry(camera.id.clone())
                .or_insert_with(|| {
                    info!(camera = %camera.id, "Spawning ingest supervisor");
                    IngestSupervisor::spawn(
                        camera.clone(),
                        tuning,
                        self.probe.clone(),
                        self.registry.clone(),
                        self.events.clone(),
                    )
                })
                .clone()
        };
        supervisor.ensure_running().await;
    }

    /// Enable every camera marked enabled in configuration
    pub async fn ensure_all(&self, cameras: &[CameraConfig]) {
        for camera in cameras.iter().filter(|c| c.enabled) {
            self.ensure_camera(camera).await;
        }
    }

    pub async fn get(&self, camera_id: &str) -> Option<IngestSupervisor> {
        self.supervisors.read().await.get(camera_id).cloned()
    }

    /// Snapshot of every supervised camera
    pub async fn snapshot_all(&self) -> Vec<CameraRuntimeState> {
        let map = self.supervisors.read().await;
        let mut states: Vec<_> = map.values().map(|s| s.snapshot()).collect();
        states.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        states
    }

    /// Capture devices of every supervised camera (arbiter release probes)
    pub async fn devices(&self) -> Vec<String> {
        self.supervisors
            .read()
            .await
            .values()
            .map(|s| s.device().to_string())
            .collect()
    }

    pub async fn is_streaming(&self, camera_id: &str) -> bool {
        match self.get(camera_id).await {
            Some(s) => s.is_streaming(),
            None => false,
        }
    }

    /// Stop every supervisor in parallel, each bounded by `deadline`.
    /// Supervisors that miss the deadline are logged; their tasks keep
    /// draining in the background and the devices are probed afterwards.
    pub async fn stop_all(&self, deadline: Duration) {
        let supervisors: Vec<_> = {
            let map = self.supervisors.read().await;
            map.values().cloned().collect()
        };

        let mut stops: FuturesUnordered<_> = supervisors
            .iter()
            .map(|s| {
                let s = s.clone();
                async move {
                    let id = s.camera_id().to_string();
                    let timed_out = tokio::time::timeout(deadline, s.stop()).await.is_err();
                    (id, timed_out)
                }
            })
            .collect();

        while let Some((id, timed_out)) = stops.next().await {
            if timed_out {
                warn!(camera = %id, "Ingest stop exceeded deadline");
            }
        }
    }

    /// Stop and discard every supervisor (mode switch away from recorder)
    pub async fn shutdown_all(&self, deadline: Duration) {
        self.stop_all(deadline).await;
        let drained: Vec<_> = {
            let mut map = self.supervisors.write().await;
            map.drain().map(|(_, s)| s).collect()
        };
        for supervisor in drained {
            supervisor.shutdown().await;
        }
    }

    /// Replace tuning and reconcile the set against a new camera list:
    /// missing cameras are spawned, removed cameras are shut down, changed
    /// cameras are restarted with their new configuration.
    pub async fn reconcile(&self, cameras: &[CameraConfig], tuning: IngestConfig) {
        *self.tuning.write().await = tuning;

        let existing: Vec<String> = {
            self.supervisors.read().await.keys().cloned().collect()
        };
        for id in existing {
            if !cameras.iter().any(|c| c.id == id && c.enabled) {
                if let Some(supervisor) = self.supervisors.write().await.remove(&id) {
                    info!(camera = %id, "Camera removed from configuration");
                    supervisor.shutdown().await;
                }
            }
        }

        // respawn changed cameras so the new config takes effect
        for camera in cameras.iter().filter(|c| c.enabled) {
            let device_changed = match self.get(&camera.id).await {
                Some(existing) => existing.device() != camera.device,
                None => false,
            };
            if device_changed {
                if let Some(supervisor) = self.supervisors.write().await.remove(&camera.id) {
                    supervisor.shutdown().await;
                }
            }
            self.ensure_camera(camera).await;
        }
    }
}
