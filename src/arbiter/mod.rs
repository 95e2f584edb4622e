//! Mode arbiter
//!
//! Enforces that only one of the two operating regimes — `recorder` or
//! `peer_webrtc` — holds the capture devices at any time. A switch is a
//! single serialized operation: stop the old mode's services with bounded
//! deadlines, verify every device is released, start the new mode, persist.
//! If the new mode cannot start and the old one cannot be restored either,
//! the arbiter degrades: `current_mode()` reports none and only another
//! switch is valid.

pub mod peer;

pub use peer::PeerStack;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::ConfigStore;
use crate::error::{AppError, Result};
use crate::events::{EventBus, SystemEvent};
use crate::ingest::{CameraStatus, IngestSet};
use crate::mixer::MixerEngine;
use crate::platform;
use crate::recording::RecordingSupervisor;

/// Operating mode over the shared capture devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Recorder,
    PeerWebrtc,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recorder => "recorder",
            Self::PeerWebrtc => "peer_webrtc",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "recorder" => Ok(Self::Recorder),
            "peer_webrtc" => Ok(Self::PeerWebrtc),
            other => Err(AppError::NotFound(format!("mode {}", other))),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ModeStateFile {
    mode: Mode,
}

/// Releases the switching flag when a switch ends, whatever the outcome
struct SwitchGuard<'a>(&'a AtomicBool);

impl Drop for SwitchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ModeArbiter {
    config: Arc<ConfigStore>,
    ingest: Arc<IngestSet>,
    recording: Arc<RecordingSupervisor>,
    mixer: Arc<MixerEngine>,
    peer: PeerStack,
    events: Arc<EventBus>,
    /// `None` is the degraded state
    mode: RwLock<Option<Mode>>,
    switching: AtomicBool,
}

impl ModeArbiter {
    pub fn new(
        config: Arc<ConfigStore>,
        ingest: Arc<IngestSet>,
        recording: Arc<RecordingSupervisor>,
        mixer: Arc<MixerEngine>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let peer = PeerStack::new(config.get().mode.peer_command.clone());
        Arc::new(Self {
            config,
            ingest,
            recording,
            mixer,
            peer,
            events,
            mode: RwLock::new(None),
            switching: AtomicBool::new(false),
        })
    }

    pub fn ingest(&self) -> &Arc<IngestSet> {
        &self.ingest
    }

    pub fn recording(&self) -> &Arc<RecordingSupervisor> {
        &self.recording
    }

    pub fn mixer(&self) -> &Arc<MixerEngine> {
        &self.mixer
    }

    /// Current mode; `None` while degraded
    pub async fn current_mode(&self) -> Option<Mode> {
        *self.mode.read().await
    }

    pub fn is_switching(&self) -> bool {
        self.switching.load(Ordering::SeqCst)
    }

    /// Resolve the boot mode (persisted state wins over the config default)
    /// and start its services.
    pub async fn startup(self: &Arc<Self>) -> Result<Mode> {
        let cfg = self.config.get();
        let persisted = if cfg.mode.persist_state {
            Self::read_state_file(&cfg.mode.state_path)
        } else {
            None
        };
        let mode = match persisted {
            Some(mode) => {
                info!(mode = mode.as_str(), "Restoring persisted mode");
                mode
            }
            None => Mode::parse(&cfg.mode.default)?,
        };

        if let Err(e) = self.start_mode(mode).await {
            error!(mode = mode.as_str(), "Boot mode failed to start: {}", e);
            self.publish_mode(None, false).await;
            return Err(e);
        }
        *self.mode.write().await = Some(mode);
        self.persist_mode(mode);
        self.publish_mode(Some(mode), false).await;
        Ok(mode)
    }

    /// Switch modes. Serialized: a second call while one is in flight
    /// fails fast with `Busy`.
    pub async fn switch_to(self: &Arc<Self>, target: Mode) -> Result<Mode> {
        if self.current_mode().await == Some(target) {
            return Ok(target);
        }

        if self
            .switching
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::Busy("a mode switch is already in progress".into()));
        }
        let _guard = SwitchGuard(&self.switching);

        let previous = self.current_mode().await;
        info!(
            from = previous.map(|m| m.as_str()).unwrap_or("degraded"),
            to = target.as_str(),
            "Mode switch"
        );
        self.publish_mode(previous, true).await;

        // 1. stop whatever is running
        self.stop_mode(previous).await;

        // 2. devices must actually be free before the new owner starts
        if let Err(e) = self.verify_devices_released().await {
            warn!("Capture devices still busy, retaining previous mode: {}", e);
            if let Some(prev) = previous {
                if let Err(restore) = self.start_mode(prev).await {
                    error!("Failed to restore previous mode: {}", restore);
                    self.enter_degraded().await;
                    return Err(e);
                }
            }
            self.publish_mode(previous, false).await;
            return Err(e);
        }

        // 3. start the target mode; on failure fall back, then degrade
        if let Err(e) = self.start_mode(target).await {
            error!(mode = target.as_str(), "Target mode failed to start: {}", e);
            self.stop_mode(Some(target)).await;
            match previous {
                Some(prev) if self.start_mode(prev).await.is_ok() => {
                    warn!(mode = prev.as_str(), "Returned to previous mode");
                    self.publish_mode(Some(prev), false).await;
                }
                _ => self.enter_degraded().await,
            }
            return Err(e);
        }

        *self.mode.write().await = Some(target);
        self.persist_mode(target);
        self.publish_mode(Some(target), false).await;
        Ok(target)
    }

    /// Stop the active mode's services (process shutdown)
    pub async fn shutdown(self: &Arc<Self>) {
        let current = self.current_mode().await;
        info!("Arbiter shutdown");
        self.stop_mode(current).await;
    }

    /// Configuration reload: reconcile the running mode's services
    pub async fn reconcile_config(self: &Arc<Self>) {
        let cfg = self.config.get();
        if self.current_mode().await == Some(Mode::Recorder) {
            self.ingest
                .reconcile(&cfg.cameras, cfg.ingest.clone())
                .await;
        }
    }

    async fn stop_mode(&self, mode: Option<Mode>) {
        let cfg = self.config.get();
        let deadline = Duration::from_secs(cfg.mode.stop_deadline_secs);
        match mode {
            Some(Mode::Recorder) => {
                if self.recording.is_active().await {
                    if let Err(e) = self.recording.stop().await {
                        warn!("Recording stop during mode switch: {}", e);
                    }
                }
                if let Err(e) = self.mixer.stop().await {
                    warn!("Mixer stop during mode switch: {}", e);
                }
                self.ingest.shutdown_all(deadline).await;
            }
            Some(Mode::PeerWebrtc) => {
                self.peer.stop(deadline).await;
            }
            None => {
                // degraded: make sure neither side holds anything
                if self.recording.is_active().await {
                    let _ = self.recording.stop().await;
                }
                let _ = self.mixer.stop().await;
                self.ingest.shutdown_all(deadline).await;
                self.peer.stop(deadline).await;
            }
        }
    }

    async fn start_mode(&self, mode: Mode) -> Result<()> {
        let cfg = self.config.get();
        let deadline = Duration::from_secs(cfg.mode.start_deadline_secs);
        match mode {
            Mode::Recorder => {
                self.ingest.ensure_all(&cfg.cameras).await;
                self.wait_ingest_ready(deadline).await
            }
            Mode::PeerWebrtc => {
                self.peer.start().await?;
                self.peer.wait_ready(deadline).await
            }
        }
    }

    /// Ready signal for the recorder mode: every enabled camera's
    /// supervisor has finished its first reconciliation (any state but
    /// `starting`; a camera without signal is ready, not failed).
    async fn wait_ingest_ready(&self, deadline: Duration) -> Result<()> {
        let until = Instant::now() + deadline;
        loop {
            let pending: Vec<String> = self
                .ingest
                .snapshot_all()
                .await
                .into_iter()
                .filter(|s| s.status == CameraStatus::Starting)
                .map(|s| s.camera_id)
                .collect();
            if pending.is_empty() {
                return Ok(());
            }
            if Instant::now() >= until {
                return Err(AppError::StartTimeout {
                    what: format!("ingest ({})", pending.join(", ")),
                    deadline_secs: deadline.as_secs(),
                });
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// Probe every configured capture device with a bounded open
    async fn verify_devices_released(&self) -> Result<()> {
        let cfg = self.config.get();
        let deadline = Duration::from_secs(cfg.mode.device_release_secs);
        for camera in cfg.cameras.iter().filter(|c| c.enabled) {
            platform::wait_device_released(&camera.device, deadline).await?;
        }
        Ok(())
    }

    async fn enter_degraded(&self) {
        error!("Neither mode could start, arbiter is degraded");
        *self.mode.write().await = None;
        self.publish_mode(None, false).await;
    }

    fn persist_mode(&self, mode: Mode) {
        let cfg = self.config.get();
        if !cfg.mode.persist_state {
            return;
        }
        let state = ModeStateFile { mode };
        let write = || -> Result<()> {
            if let Some(parent) = cfg.mode.state_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let tmp = cfg.mode.state_path.with_extension("json.tmp");
            std::fs::write(&tmp, serde_json::to_vec(&state)?)?;
            std::fs::rename(&tmp, &cfg.mode.state_path)?;
            Ok(())
        };
        if let Err(e) = write() {
            warn!("Failed to persist mode state: {}", e);
        }
    }

    fn read_state_file(path: &Path) -> Option<Mode> {
        let raw = std::fs::read(path).ok()?;
        match serde_json::from_slice::<ModeStateFile>(&raw) {
            Ok(state) => Some(state.mode),
            Err(e) => {
                warn!(file = %path.display(), "Ignoring unreadable mode state: {}", e);
                None
            }
        }
    }

    async fn publish_mode(&self, mode: Option<Mode>, switching: bool) {
        self.events.publish(SystemEvent::Mode {
            mode: mode.map(|m| m.as_str().to_string()),
            switching,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{PlatformProbe, SocFamily};
    use crate::registry::RegistryClient;

    fn test_arbiter(state_dir: &Path) -> Arc<ModeArbiter> {
        let store = ConfigStore::load(state_dir.join("config.yaml")).unwrap();
        let mut cfg = (*store.get()).clone();
        cfg.mode.state_path = state_dir.join("mode_state.json");
        cfg.sessions_path = state_dir.join("sessions");
        cfg.recording.base_path = state_dir.join("recordings");
        store.set(cfg);
        let config = Arc::new(store);

        let probe = Arc::new(PlatformProbe::with_lookup(SocFamily::Unknown, |_| false));
        let registry = Arc::new(RegistryClient::new(&config.get().stream_server));
        let events = Arc::new(EventBus::new());
        let ingest = IngestSet::new(
            config.get().ingest.clone(),
            probe.clone(),
            registry.clone(),
            events.clone(),
        );
        let recording = RecordingSupervisor::new(
            config.clone(),
            ingest.clone(),
            registry.clone(),
            events.clone(),
        );
        let scenes = Arc::new(crate::mixer::SceneStore::new(state_dir.join("scenes")));
        let mixer = MixerEngine::new(
            config.clone(),
            scenes,
            probe.clone(),
            registry.clone(),
            events.clone(),
        );
        ModeArbiter::new(config, ingest, recording, mixer, events)
    }

    #[test]
    fn test_mode_serde() {
        assert_eq!(Mode::parse("recorder").unwrap(), Mode::Recorder);
        assert_eq!(Mode::parse("peer_webrtc").unwrap(), Mode::PeerWebrtc);
        assert!(Mode::parse("vhs").is_err());
        assert_eq!(
            serde_json::to_string(&Mode::PeerWebrtc).unwrap(),
            "\"peer_webrtc\""
        );
    }

    #[tokio::test]
    async fn test_startup_uses_config_default() {
        let dir = tempfile::tempdir().unwrap();
        let arbiter = test_arbiter(dir.path());
        assert_eq!(arbiter.current_mode().await, None);
        let mode = arbiter.startup().await.unwrap();
        assert_eq!(mode, Mode::Recorder);
        assert_eq!(arbiter.current_mode().await, Some(Mode::Recorder));
        // state persisted
        assert!(dir.path().join("mode_state.json").exists());
    }

    #[tokio::test]
    async fn test_switch_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let arbiter = test_arbiter(dir.path());
        arbiter.startup().await.unwrap();
        // same target: immediate success, no churn
        assert_eq!(arbiter.switch_to(Mode::Recorder).await.unwrap(), Mode::Recorder);
    }

    #[tokio::test]
    async fn test_switch_to_peer_and_back() {
        let dir = tempfile::tempdir().unwrap();
        let arbiter = test_arbiter(dir.path());
        arbiter.startup().await.unwrap();

        assert_eq!(
            arbiter.switch_to(Mode::PeerWebrtc).await.unwrap(),
            Mode::PeerWebrtc
        );
        let raw = std::fs::read(dir.path().join("mode_state.json")).unwrap();
        let state: ModeStateFile = serde_json::from_slice(&raw).unwrap();
        assert_eq!(state.mode, Mode::PeerWebrtc);

        assert_eq!(arbiter.switch_to(Mode::Recorder).await.unwrap(), Mode::Recorder);
    }

    #[tokio::test]
    async fn test_persisted_mode_wins_over_default() {
        let dir = tempfile::tempdir().unwrap();
        {
            let arbiter = test_arbiter(dir.path());
            arbiter.startup().await.unwrap();
            arbiter.switch_to(Mode::PeerWebrtc).await.unwrap();
        }
        // a fresh arbiter restores peer_webrtc even though the default is
        // recorder
        let arbiter = test_arbiter(dir.path());
        let mode = arbiter.startup().await.unwrap();
        assert_eq!(mode, Mode::PeerWebrtc);
    }
}
