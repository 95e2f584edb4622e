//! Recording supervisor
//!
//! Session-scoped, multi-camera recording with disk-space guards and a
//! stall watchdog. At most one session is active process-wide. Recording
//! pipelines subscribe to the cameras' stream paths on the local stream
//! server; they never open capture devices and never re-encode.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Codec, ConfigStore};
use crate::error::{AppError, Result};
use crate::events::{ComponentError, EventBus, SystemEvent};
use crate::ingest::IngestSet;
use crate::pipeline::runtime::{self, PipelineHandle};
use crate::pipeline::{builder, PipelineSnapshot};
use crate::registry::RegistryClient;

use super::disk::DiskMonitor;
use super::session::{recording_file_name, Session, SessionStatus};

/// Stream path of the mixer program output, recordable like a camera
pub const MIXER_PROGRAM_PATH: &str = "mixer_program";

const PIPELINE_START_DEADLINE: Duration = Duration::from_secs(10);

/// Aggregate recording status for the control plane
#[derive(Debug, Clone, Serialize)]
pub struct RecordingStatus {
    pub active: bool,
    pub session: Option<Session>,
    pub disk_free_gb: Option<f64>,
    pub per_camera: BTreeMap<String, PipelineSnapshot>,
    pub last_error: Option<ComponentError>,
}

struct RecordingPipeline {
    handle: PipelineHandle,
    codec: Codec,
    last_bytes: u64,
    stagnant_samples: u8,
}

struct Watchdog {
    cancel: CancellationToken,
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Default)]
struct Inner {
    session: Option<Session>,
    pipelines: HashMap<String, RecordingPipeline>,
    watchdog: Option<Watchdog>,
    last_completed: Option<Session>,
    last_error: Option<ComponentError>,
}

pub struct RecordingSupervisor {
    config: Arc<ConfigStore>,
    ingest: Arc<IngestSet>,
    registry: Arc<RegistryClient>,
    events: Arc<EventBus>,
    inner: RwLock<Inner>,
}

impl RecordingSupervisor {
    pub fn new(
        config: Arc<ConfigStore>,
        ingest: Arc<IngestSet>,
        registry: Arc<RegistryClient>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            ingest,
            registry,
            events,
            inner: RwLock::new(Inner::default()),
        })
    }

    /// Begin a session over the requested cameras.
    ///
    /// Preconditions, in order: no active session, free space above the
    /// start gate, at least one requested camera currently publishing.
    /// The session record is persisted before this returns.
    pub async fn start(self: &Arc<Self>, cameras: Vec<String>) -> Result<Session> {
        let cfg = self.config.get();
        let mut inner = self.inner.write().await;

        if inner.session.is_some() {
            return Err(AppError::Busy("a recording session is already active".into()));
        }

        let monitor = DiskMonitor::new(&cfg.recording.base_path);
        let free_gb = monitor.free_gb()?;
        if free_gb <= cfg.recording.min_free_gb_start {
            return Err(AppError::InsufficientDisk {
                free_gb,
                required_gb: cfg.recording.min_free_gb_start,
            });
        }

        // resolve publishers among the requested set
        let mut publishers: Vec<(String, Codec)> = Vec::new();
        for id in &cameras {
            if let Some(camera) = cfg.camera(id) {
                if self.ingest.is_streaming(id).await {
                    publishers.push((id.clone(), camera.codec));
                }
            } else if id == MIXER_PROGRAM_PATH && self.registry.is_ready(id).await {
                publishers.push((id.clone(), cfg.mixer.output_codec));
            }
        }
        if publishers.is_empty() {
            return Err(AppError::NoPublishers(cameras.join(", ")));
        }

        let mut session = Session::new(publishers.iter().map(|(id, _)| id.clone()).collect());
        info!(session = %session.session_id, cameras = ?session.cameras, "Starting recording session");

        let mut started: HashMap<String, RecordingPipeline> = HashMap::new();
        for (id, codec) in &publishers {
            match self.start_pipeline(&cfg.recording.base_path, id, *codec, cfg.recording.segment_seconds).await {
                Ok((handle, file)) => {
                    session.add_file(id, &file);
                    started.insert(
                        id.clone(),
                        RecordingPipeline {
                            handle,
                            codec: *codec,
                            last_bytes: 0,
                            stagnant_samples: 0,
                        },
                    );
                }
                Err(e) => {
                    warn!(session = %session.session_id, camera = %id, "Recording pipeline failed to start: {}", e);
                    session.annotate(format!("start_failed:{}", id));
                }
            }
        }

        if started.is_empty() {
            return Err(AppError::PipelineFatal {
                pipeline: "recording".into(),
                reason: "no recording pipeline came up".into(),
            });
        }

        // metadata on disk before the client sees success
        if let Err(e) = session.persist(&cfg.sessions_path) {
            for (_, pipeline) in started.drain() {
                pipeline.handle.stop().await;
            }
            return Err(e);
        }

        for id in started.keys() {
            if let Some(supervisor) = self.ingest.get(id).await {
                supervisor.set_recording(true).await;
            }
        }

        self.publish_session_event(&session);
        inner.pipelines = started;
        inner.session = Some(session.clone());
        inner.last_error = None;
        inner.watchdog = Some(self.spawn_watchdog());
        Ok(session)
    }

    async fn start_pipeline(
        &self,
        base_path: &std::path::Path,
        path_name: &str,
        codec: Codec,
        segment_seconds: u32,
    ) -> Result<(PipelineHandle, PathBuf)> {
        let dir = base_path.join(path_name);
        tokio::fs::create_dir_all(&dir).await?;
        let file = dir.join(recording_file_name(codec));

        let desc = builder::recording(
            path_name,
            codec,
            &self.registry.read_url(path_name),
            &file,
            segment_seconds,
        );
        let handle = runtime::spawn(&desc)?;
        handle
            .start(PIPELINE_START_DEADLINE, CancellationToken::new())
            .await?;
        Ok((handle, file))
    }

    /// Complete the active session. Idempotent after completion: a second
    /// stop returns the last completed session.
    pub async fn stop(self: &Arc<Self>) -> Result<Session> {
        self.finish(None).await
    }

    /// Watchdog-initiated stop with an annotation (`disk_low`)
    async fn auto_stop(self: &Arc<Self>, annotation: &str) {
        if let Err(e) = self.finish(Some(annotation)).await {
            warn!("Auto-stop failed: {}", e);
        }
    }

    async fn finish(self: &Arc<Self>, annotation: Option<&str>) -> Result<Session> {
        let cfg = self.config.get();
        let mut inner = self.inner.write().await;

        let Some(mut session) = inner.session.take() else {
            // idempotent after completion
            return match &inner.last_completed {
                Some(last) => Ok(last.clone()),
                None => Err(AppError::Busy("no recording session is active".into())),
            };
        };

        inner.watchdog = None; // drop cancels the task
        if let Some(note) = annotation {
            session.annotate(note);
        }
        info!(session = %session.session_id, "Stopping recording session");

        let deadline = Duration::from_secs(cfg.recording.stop_deadline_secs);
        let pipelines: Vec<(String, PipelineHandle)> = inner
            .pipelines
            .drain()
            .map(|(id, p)| (id, p.handle))
            .collect();

        let mut stops: FuturesUnordered<_> = pipelines
            .into_iter()
            .map(|(id, handle)| async move {
                let clean = tokio::time::timeout(deadline, handle.stop()).await.is_ok();
                (id, clean)
            })
            .collect();
        while let Some((id, clean)) = stops.next().await {
            if !clean {
                // forced to null by dropping the handle; noted, not fatal
                warn!(camera = %id, "Recording pipeline did not stop cleanly");
                session.annotate(format!("unclean:{}", id));
            }
            if let Some(supervisor) = self.ingest.get(&id).await {
                supervisor.set_recording(false).await;
            }
        }

        // every listed file must exist on disk at stop time
        for (camera, files) in session.files.clone() {
            for file in files {
                if !std::path::Path::new(&file).exists() {
                    warn!(camera = %camera, file = %file, "Listed recording file missing on disk");
                    session.annotate(format!("missing:{}", file));
                    if let Some(list) = session.files.get_mut(&camera) {
                        list.retain(|f| f != &file);
                    }
                }
            }
        }
        session.files.retain(|_, files| !files.is_empty());

        session.status = SessionStatus::Completed;
        session.persist(&cfg.sessions_path)?;

        self.publish_session_event(&session);
        inner.last_completed = Some(session.clone());
        Ok(session)
    }

    /// Aggregate status snapshot
    pub async fn status(&self) -> RecordingStatus {
        let cfg = self.config.get();
        let inner = self.inner.read().await;
        let per_camera = inner
            .pipelines
            .iter()
            .map(|(id, p)| (id.clone(), p.handle.state()))
            .collect();
        RecordingStatus {
            active: inner.session.is_some(),
            session: inner.session.clone().or_else(|| inner.last_completed.clone()),
            disk_free_gb: DiskMonitor::new(&cfg.recording.base_path).free_gb().ok(),
            per_camera,
            last_error: inner.last_error.clone(),
        }
    }

    pub async fn is_active(&self) -> bool {
        self.inner.read().await.session.is_some()
    }

    /// Sessions directory listing, newest first
    pub fn list_sessions(&self) -> Result<Vec<Session>> {
        Session::load_all(&self.config.get().sessions_path)
    }

    fn spawn_watchdog(self: &Arc<Self>) -> Watchdog {
        let supervisor = self.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let cfg = self.config.get().recording.clone();

        tokio::spawn(async move {
            let mut disk_tick =
                tokio::time::interval(Duration::from_secs(cfg.disk_watchdog_secs.max(1)));
            let mut stall_tick =
                tokio::time::interval(Duration::from_secs(cfg.stall_watchdog_secs.max(1)));
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = disk_tick.tick() => {
                        if supervisor.disk_check().await {
                            return;
                        }
                    }
                    _ = stall_tick.tick() => supervisor.stall_check().await,
                }
            }
        });

        Watchdog { cancel }
    }

    /// Returns true when the session was auto-stopped
    async fn disk_check(self: &Arc<Self>) -> bool {
        let cfg = self.config.get().recording.clone();
        let monitor = DiskMonitor::new(&cfg.base_path);
        let free_gb = match monitor.free_gb() {
            Ok(free) => free,
            Err(e) => {
                warn!("Disk watchdog failed to sample free space: {}", e);
                return false;
            }
        };

        let low = free_gb < cfg.min_free_gb_stop;
        self.events.publish(SystemEvent::Disk { free_gb, low });

        if low {
            warn!(
                free_gb,
                floor_gb = cfg.min_free_gb_stop,
                "Free space under stop floor, completing session"
            );
            self.auto_stop("disk_low").await;
            return true;
        }
        false
    }

    /// A produced-bytes counter that does not advance across two
    /// consecutive samples marks the pipeline stalled; only that pipeline
    /// is restarted, into a fresh segment file.
    async fn stall_check(self: &Arc<Self>) {
        let cfg = self.config.get();
        let mut guard = self.inner.write().await;
        let Inner {
            session,
            pipelines,
            last_error,
            ..
        } = &mut *guard;
        let Some(session) = session.as_mut() else {
            return;
        };
        let mut session_dirty = false;

        let ids: Vec<String> = pipelines.keys().cloned().collect();
        for id in ids {
            let stalled = {
                let pipeline = pipelines.get_mut(&id).expect("key from map");
                let bytes = pipeline.handle.state().bytes_produced.unwrap_or(0);
                if bytes == pipeline.last_bytes {
                    pipeline.stagnant_samples += 1;
                } else {
                    pipeline.last_bytes = bytes;
                    pipeline.stagnant_samples = 0;
                }
                pipeline.stagnant_samples >= 2
            };
            if !stalled {
                continue;
            }

            warn!(camera = %id, "Recording pipeline stalled, restarting into a new segment");
            let old = pipelines.remove(&id).expect("key from map");
            old.handle.stop().await;

            match self
                .start_pipeline(&cfg.recording.base_path, &id, old.codec, cfg.recording.segment_seconds)
                .await
            {
                Ok((handle, file)) => {
                    session.add_file(&id, &file);
                    session_dirty = true;
                    pipelines.insert(
                        id.clone(),
                        RecordingPipeline {
                            handle,
                            codec: old.codec,
                            last_bytes: 0,
                            stagnant_samples: 0,
                        },
                    );
                }
                Err(e) => {
                    warn!(camera = %id, "Stalled pipeline could not be restarted: {}", e);
                    session.annotate(format!("stalled:{}", id));
                    session_dirty = true;
                    *last_error = Some(ComponentError::now("pipeline_fatal", e.to_string()));
                }
            }
        }

        if session_dirty {
            if let Err(e) = session.persist(&cfg.sessions_path) {
                warn!("Failed to persist session after stall restart: {}", e);
            }
        }
    }

    fn publish_session_event(&self, session: &Session) {
        self.events.publish(SystemEvent::Session {
            session_id: session.session_id.clone(),
            status: session.status.as_str().to_string(),
            annotations: session.annotations.clone(),
        });
    }
}
