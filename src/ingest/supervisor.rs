//! Per-camera ingest supervisor
//!
//! Keeps exactly one healthy ingest pipeline running per enabled camera.
//! The supervisor's task is the only mutator of the camera's runtime state;
//! everyone else reads snapshots or listens on the notify channel. It never
//! gives up on a configured camera: fatal errors restart with backoff,
//! signal loss parks the pipeline and keeps sampling.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CameraConfig, IngestConfig, Resolution};
use crate::events::{ComponentError, EventBus, SystemEvent};
use crate::pipeline::runtime::{self, PipelineEvent, PipelineHandle};
use crate::pipeline::{builder, PipelineState};
use crate::platform::{self, PlatformProbe};
use crate::registry::{PathKind, RegistryClient};
use crate::utils::LogThrottler;

/// Camera ingest status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraStatus {
    Idle,
    Starting,
    Streaming,
    Recording,
    Error,
    NoSignal,
}

impl CameraStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Streaming => "streaming",
            Self::Recording => "recording",
            Self::Error => "error",
            Self::NoSignal => "no_signal",
        }
    }
}

/// Snapshot of one camera's runtime state
#[derive(Debug, Clone, Serialize)]
pub struct CameraRuntimeState {
    pub camera_id: String,
    pub status: CameraStatus,
    pub actual_resolution: Option<Resolution>,
    pub has_signal: bool,
    pub last_error: Option<ComponentError>,
    pub restart_count: u64,
}

impl CameraRuntimeState {
    fn new(camera_id: &str) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            status: CameraStatus::Idle,
            actual_resolution: None,
            has_signal: false,
            last_error: None,
            restart_count: 0,
        }
    }
}

/// Restart backoff over a configured schedule; the last entry is the cap
#[derive(Debug)]
pub(crate) struct Backoff {
    schedule: Vec<u64>,
    index: usize,
}

impl Backoff {
    pub(crate) fn new(schedule: &[u64]) -> Self {
        let schedule = if schedule.is_empty() {
            vec![1]
        } else {
            schedule.to_vec()
        };
        Self { schedule, index: 0 }
    }

    /// Next delay, advancing towards the cap
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.schedule[self.index.min(self.schedule.len() - 1)];
        self.index = (self.index + 1).min(self.schedule.len() - 1);
        Duration::from_secs(delay)
    }

    pub(crate) fn reset(&mut self) {
        self.index = 0;
    }
}

/// Exponentially dampened debounce for source resolution changes.
///
/// The first change inside a quiet window restarts after the base debounce;
/// every further change within the window waits longer, up to the ceiling,
/// so a source flicking through modes causes at most one restart per wave.
#[derive(Debug)]
pub(crate) struct ChangeDebouncer {
    base: Duration,
    max: Duration,
    window: Duration,
    changes: VecDeque<Instant>,
}

impl ChangeDebouncer {
    pub(crate) fn new(base_ms: u64, max_ms: u64, window_secs: u64) -> Self {
        Self {
            base: Duration::from_millis(base_ms),
            max: Duration::from_millis(max_ms),
            window: Duration::from_secs(window_secs),
            changes: VecDeque::new(),
        }
    }

    /// Record a change at `now` and return the debounce delay to apply
    pub(crate) fn delay_for_change(&mut self, now: Instant) -> Duration {
        while let Some(front) = self.changes.front() {
            if now.duration_since(*front) > self.window {
                self.changes.pop_front();
            } else {
                break;
            }
        }
        self.changes.push_back(now);
        let factor = self.changes.len() as u32;
        (self.base * factor).min(self.max)
    }

    pub(crate) fn reset(&mut self) {
        self.changes.clear();
    }
}

enum Cmd {
    EnsureRunning,
    Stop(oneshot::Sender<()>),
    SetRecording(bool),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to one camera's supervisor task
#[derive(Clone)]
pub struct IngestSupervisor {
    camera_id: String,
    device: String,
    cmd_tx: mpsc::Sender<Cmd>,
    snapshot: Arc<ArcSwap<CameraRuntimeState>>,
    notify: broadcast::Sender<CameraRuntimeState>,
}

impl IngestSupervisor {
    /// Spawn a supervisor for one camera
    pub fn spawn(
        camera: CameraConfig,
        tuning: IngestConfig,
        probe: Arc<PlatformProbe>,
        registry: Arc<RegistryClient>,
        events: Arc<EventBus>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (notify, _) = broadcast::channel(16);
        let snapshot = Arc::new(ArcSwap::from_pointee(CameraRuntimeState::new(&camera.id)));

        let handle = Self {
            camera_id: camera.id.clone(),
            device: camera.device.clone(),
            cmd_tx,
            snapshot: snapshot.clone(),
            notify: notify.clone(),
        };

        let task = SupervisorTask {
            backoff: Backoff::new(&tuning.restart_backoff_secs),
            debouncer: ChangeDebouncer::new(
                tuning.debounce_ms,
                tuning.debounce_max_ms,
                tuning.debounce_window_secs,
            ),
            camera,
            tuning,
            probe,
            registry,
            events,
            snapshot,
            notify,
            running: false,
            recording_marker: false,
            ever_started: false,
            pipeline: None,
            negotiated: None,
            last_seen: None,
            sample_failures: 0,
            pending_restart: None,
            retry_at: None,
            publish_deadline: None,
            shutdown: CancellationToken::new(),
            state: CameraRuntimeState::new(&handle.camera_id),
            throttler: LogThrottler::default(),
        };
        tokio::spawn(task.run(cmd_rx));
        handle
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Idempotent: transitions toward a running pipeline
    pub async fn ensure_running(&self) {
        let _ = self.cmd_tx.send(Cmd::EnsureRunning).await;
    }

    /// Stop the pipeline and go idle; sampling pauses until the next ensure
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Stop(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Stop and end the supervisor task (mode switches, config removal)
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Mark the camera as being recorded (set by the recording supervisor,
    /// applied by the owning task)
    pub async fn set_recording(&self, recording: bool) {
        let _ = self.cmd_tx.send(Cmd::SetRecording(recording)).await;
    }

    /// Value-copy snapshot
    pub fn snapshot(&self) -> CameraRuntimeState {
        self.snapshot.load().as_ref().clone()
    }

    pub fn is_streaming(&self) -> bool {
        matches!(
            self.snapshot().status,
            CameraStatus::Streaming | CameraStatus::Recording
        )
    }

    /// Subscribe to state-change notifications (exactly one per change)
    pub fn subscribe(&self) -> broadcast::Receiver<CameraRuntimeState> {
        self.notify.subscribe()
    }
}

struct SupervisorTask {
    camera: CameraConfig,
    tuning: IngestConfig,
    probe: Arc<PlatformProbe>,
    registry: Arc<RegistryClient>,
    events: Arc<EventBus>,
    snapshot: Arc<ArcSwap<CameraRuntimeState>>,
    notify: broadcast::Sender<CameraRuntimeState>,

    /// Intent: whether a pipeline should be running
    running: bool,
    recording_marker: bool,
    /// Whether a pipeline was ever started during this enable; restarts
    /// after this point bump `restart_count`
    ever_started: bool,
    pipeline: Option<PipelineHandle>,
    /// Source resolution the current pipeline was built for
    negotiated: Option<Resolution>,
    /// Most recent successful sample
    last_seen: Option<Resolution>,
    sample_failures: u32,
    /// Debounced restart: due time plus the resolution to rebuild with
    pending_restart: Option<(Instant, Resolution)>,
    /// Backoff restart after a fatal error
    retry_at: Option<Instant>,
    /// Publication gate deadline while starting
    publish_deadline: Option<Instant>,

    backoff: Backoff,
    debouncer: ChangeDebouncer,
    shutdown: CancellationToken,
    /// Local working copy, published on change
    state: CameraRuntimeState,
    throttler: LogThrottler,
}

impl SupervisorTask {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Cmd>) {
        let mut sample_tick =
            tokio::time::interval(Duration::from_secs(self.tuning.sample_interval_secs.max(1)));
        sample_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut drive_tick = tokio::time::interval(Duration::from_millis(500));
        drive_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Cmd::EnsureRunning) => self.handle_ensure().await,
                    Some(Cmd::Stop(reply)) => {
                        self.handle_stop().await;
                        let _ = reply.send(());
                    }
                    Some(Cmd::SetRecording(on)) => self.handle_recording_marker(on),
                    Some(Cmd::Shutdown(reply)) => {
                        self.handle_stop().await;
                        self.shutdown.cancel();
                        let _ = reply.send(());
                        return;
                    }
                    None => {
                        self.handle_stop().await;
                        return;
                    }
                },
                _ = sample_tick.tick() => {
                    if self.running {
                        self.sample().await;
                    }
                }
                _ = drive_tick.tick() => {
                    if self.running {
                        self.drive().await;
                    }
                }
            }
        }
    }

    async fn handle_ensure(&mut self) {
        if self.running {
            return;
        }
        info!(camera = %self.camera.id, "Ingest enabled");
        self.running = true;
        self.ever_started = false;
        self.backoff.reset();
        self.debouncer.reset();
        // sample immediately rather than waiting a full tick; the sample
        // brings the pipeline up when the device has signal
        self.sample().await;
        if self.pipeline.is_none() && self.state.status == CameraStatus::Idle {
            self.mutate(|s| {
                s.status = CameraStatus::NoSignal;
                s.has_signal = false;
            });
        }
    }

    async fn handle_stop(&mut self) {
        if !self.running && self.pipeline.is_none() {
            return;
        }
        info!(camera = %self.camera.id, "Ingest disabled");
        self.running = false;
        self.teardown_pipeline().await;
        self.pending_restart = None;
        self.retry_at = None;
        self.publish_deadline = None;
        self.mutate(|s| {
            s.status = CameraStatus::Idle;
            s.last_error = None;
        });
    }

    fn handle_recording_marker(&mut self, on: bool) {
        self.recording_marker = on;
        self.mutate(|s| {
            s.status = match (s.status, on) {
                (CameraStatus::Streaming, true) => CameraStatus::Recording,
                (CameraStatus::Recording, false) => CameraStatus::Streaming,
                (other, _) => other,
            };
        });
    }

    /// One signal sample: queries the device's current source resolution
    async fn sample(&mut self) {
        let sample = platform::sample_source(&self.camera.device).await;
        match sample {
            None => {
                self.sample_failures += 1;
                if self.sample_failures >= 2 && self.state.has_signal {
                    // two consecutive misses: the source is gone, release
                    // the encoder and keep sampling
                    if self.throttler.should_log("signal_lost") {
                        warn!(camera = %self.camera.id, "Signal lost");
                    }
                    self.teardown_pipeline().await;
                    self.pending_restart = None;
                    self.retry_at = None;
                    self.publish_deadline = None;
                    self.mutate(|s| {
                        s.status = CameraStatus::NoSignal;
                        s.has_signal = false;
                        s.actual_resolution = None;
                    });
                }
                if self.sample_failures >= 2 {
                    self.last_seen = None;
                }
            }
            Some(res) => {
                self.sample_failures = 0;
                self.throttler.clear("signal_lost");
                self.last_seen = Some(res);

                let nothing_running = self.pipeline.is_none()
                    && self.retry_at.is_none()
                    && self.pending_restart.is_none();
                if nothing_running {
                    // signal (re)appeared: bring the pipeline up with the
                    // observed resolution
                    info!(camera = %self.camera.id, resolution = %res, "Signal present");
                    self.restart_pipeline(res).await;
                } else if self.pipeline.is_some() {
                    if let Some(negotiated) = self.negotiated {
                        if negotiated != res {
                            self.schedule_debounced_restart(res);
                        }
                    }
                }
            }
        }
    }

    fn schedule_debounced_restart(&mut self, res: Resolution) {
        let now = Instant::now();
        let delay = self.debouncer.delay_for_change(now);
        debug!(
            camera = %self.camera.id,
            resolution = %res,
            delay_ms = delay.as_millis() as u64,
            "Source resolution changed, restart scheduled"
        );
        self.pending_restart = Some((now + delay, res));
    }

    /// Periodic drive: due restarts, pipeline health, publication gate
    async fn drive(&mut self) {
        let now = Instant::now();

        if let Some((due, res)) = self.pending_restart {
            if now >= due {
                self.pending_restart = None;
                info!(camera = %self.camera.id, resolution = %res, "Restarting for new source resolution");
                self.restart_pipeline(res).await;
                return;
            }
        }

        if let Some(due) = self.retry_at {
            if now >= due {
                self.retry_at = None;
                if let Some(res) = self.last_seen.or(self.negotiated) {
                    self.restart_pipeline(res).await;
                }
                return;
            }
        }

        // pipeline health
        let mut fatal: Option<String> = None;
        if let Some(pipeline) = &self.pipeline {
            for event in pipeline.drain_events() {
                if let PipelineEvent::FatalError { message, .. } = event {
                    fatal = Some(message);
                }
            }
            if pipeline.state().state == PipelineState::Error && fatal.is_none() {
                fatal = Some("pipeline entered error state".into());
            }
        }
        if let Some(message) = fatal {
            self.on_fatal(message).await;
            return;
        }

        // publication gate: streaming only once the path reports ready
        if let Some(deadline) = self.publish_deadline {
            if self.registry.is_ready(&self.camera.id).await {
                self.publish_deadline = None;
                self.backoff.reset();
                info!(camera = %self.camera.id, "Publishing");
                let recording = self.recording_marker;
                self.mutate(|s| {
                    s.status = if recording {
                        CameraStatus::Recording
                    } else {
                        CameraStatus::Streaming
                    };
                    s.last_error = None;
                });
            } else if now >= deadline {
                self.publish_deadline = None;
                warn!(camera = %self.camera.id, "Stream path never became ready, restarting");
                self.on_fatal("publication gate timeout".into()).await;
            }
        }
    }

    async fn on_fatal(&mut self, message: String) {
        self.teardown_pipeline().await;
        let delay = self.backoff.next_delay();
        self.retry_at = Some(Instant::now() + delay);
        self.publish_deadline = None;
        warn!(
            camera = %self.camera.id,
            error = %message,
            retry_in_secs = delay.as_secs(),
            "Ingest pipeline failed"
        );
        self.mutate(|s| {
            s.status = CameraStatus::Error;
            s.last_error = Some(ComponentError::now("pipeline_fatal", &message));
        });
    }

    /// Stop the current instance (if any) and start a fresh one. Counts as
    /// a restart whenever a pipeline was ever started during this enable.
    async fn restart_pipeline(&mut self, res: Resolution) {
        self.teardown_pipeline().await;
        if self.ever_started {
            self.mutate(|s| s.restart_count += 1);
        }
        self.start_pipeline(res).await;
    }

    async fn start_pipeline(&mut self, source_res: Resolution) {
        self.ever_started = true;
        self.mutate(|s| {
            s.status = CameraStatus::Starting;
            s.has_signal = true;
        });

        // best effort: the server may auto-create paths on publish
        if let Err(e) = self
            .registry
            .ensure_path(&self.camera.id, PathKind::Publisher)
            .await
        {
            if self.throttler.should_log("ensure_path") {
                warn!(camera = %self.camera.id, "ensure_path failed: {}", e);
            }
        }

        let profile = match self.probe.resolve(
            self.camera.codec,
            source_res.is_4k(),
            self.camera.bitrate,
            self.camera.framerate,
        ) {
            Ok(p) => p,
            Err(e) => {
                self.fail_start(e.to_string()).await;
                return;
            }
        };

        if self.camera.resolution.pixels() > source_res.pixels() {
            info!(
                camera = %self.camera.id,
                configured = %self.camera.resolution,
                source = %source_res,
                "Configured resolution exceeds source, source wins"
            );
        }

        let publish_url = self.registry.publish_url(&self.camera.id);
        let start_deadline = Duration::from_secs(self.tuning.start_timeout_secs);

        let mut started = false;
        for with_audio in attempts(self.camera.audio_enabled) {
            let desc = builder::ingest(&self.camera, &profile, source_res, &publish_url, with_audio);
            match runtime::spawn(&desc) {
                Ok(handle) => {
                    match handle.start(start_deadline, self.shutdown.child_token()).await {
                        Ok(()) => {
                            if self.camera.audio_enabled && !with_audio {
                                warn!(camera = %self.camera.id, "Audio refused to start, running video only");
                            }
                            self.pipeline = Some(handle);
                            started = true;
                            break;
                        }
                        Err(e) => {
                            handle.stop().await;
                            if !with_audio {
                                self.fail_start(e.to_string()).await;
                                return;
                            }
                            debug!(camera = %self.camera.id, "Start with audio failed ({}), retrying without", e);
                        }
                    }
                }
                Err(e) => {
                    if !with_audio {
                        self.fail_start(e.to_string()).await;
                        return;
                    }
                }
            }
        }
        if !started {
            return;
        }

        let effective = builder::effective_resolution(self.camera.resolution, source_res);
        self.negotiated = Some(source_res);
        self.publish_deadline =
            Some(Instant::now() + Duration::from_secs(self.tuning.publish_timeout_secs));
        self.mutate(|s| {
            s.actual_resolution = Some(effective);
        });
    }

    async fn fail_start(&mut self, message: String) {
        let delay = self.backoff.next_delay();
        self.retry_at = Some(Instant::now() + delay);
        warn!(
            camera = %self.camera.id,
            error = %message,
            retry_in_secs = delay.as_secs(),
            "Ingest start failed"
        );
        self.mutate(|s| {
            s.status = CameraStatus::Error;
            s.last_error = Some(ComponentError::now("start_failed", &message));
        });
    }

    async fn teardown_pipeline(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.stop().await;
        }
        self.negotiated = None;
    }

    /// Apply a mutation; publish snapshot, notify and event exactly once
    /// when the observable state actually changed.
    fn mutate(&mut self, f: impl FnOnce(&mut CameraRuntimeState)) {
        let state = &mut self.state;
        let before_status = state.status;
        let before_signal = state.has_signal;
        let before_res = state.actual_resolution;
        f(state);
        let changed = state.status != before_status
            || state.has_signal != before_signal
            || state.actual_resolution != before_res;

        let published = state.clone();
        self.snapshot.store(Arc::new(published.clone()));
        if changed {
            let _ = self.notify.send(published.clone());
            self.events.publish(SystemEvent::Camera {
                camera_id: published.camera_id.clone(),
                status: published.status.as_str().to_string(),
                has_signal: published.has_signal,
                actual_resolution: published.actual_resolution.map(|r| r.to_string()),
                restart_count: published.restart_count,
                error: published.last_error.as_ref().map(|e| e.message.clone()),
            });
        }
    }
}

/// Start attempts: with audio first when enabled, then without
fn attempts(audio_enabled: bool) -> Vec<bool> {
    if audio_enabled {
        vec![true, false]
    } else {
        vec![false]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_walks_schedule_and_caps() {
        let mut b = Backoff::new(&[1, 2, 5, 10, 30]);
        assert_eq!(b.next_delay(), Duration::from_secs(1));
        assert_eq!(b.next_delay(), Duration::from_secs(2));
        assert_eq!(b.next_delay(), Duration::from_secs(5));
        assert_eq!(b.next_delay(), Duration::from_secs(10));
        assert_eq!(b.next_delay(), Duration::from_secs(30));
        // capped at the last entry
        assert_eq!(b.next_delay(), Duration::from_secs(30));
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_survives_empty_schedule() {
        let mut b = Backoff::new(&[]);
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debouncer_escalates_within_window() {
        let mut d = ChangeDebouncer::new(1000, 5000, 30);
        let t0 = Instant::now();
        assert_eq!(d.delay_for_change(t0), Duration::from_millis(1000));
        // second change a moment later waits longer
        assert_eq!(d.delay_for_change(t0), Duration::from_millis(2000));
        assert_eq!(d.delay_for_change(t0), Duration::from_millis(3000));
        // ceiling
        assert_eq!(d.delay_for_change(t0), Duration::from_millis(4000));
        assert_eq!(d.delay_for_change(t0), Duration::from_millis(5000));
        assert_eq!(d.delay_for_change(t0), Duration::from_millis(5000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debouncer_forgets_outside_window() {
        let mut d = ChangeDebouncer::new(1000, 5000, 30);
        let t0 = Instant::now();
        assert_eq!(d.delay_for_change(t0), Duration::from_millis(1000));
        // a change long after the window is a fresh first change
        let t1 = t0 + Duration::from_secs(31);
        assert_eq!(d.delay_for_change(t1), Duration::from_millis(1000));
    }

    #[test]
    fn test_attempts_order() {
        assert_eq!(attempts(true), vec![true, false]);
        assert_eq!(attempts(false), vec![false]);
    }

    #[test]
    fn test_camera_status_strings() {
        assert_eq!(CameraStatus::NoSignal.as_str(), "no_signal");
        assert_eq!(CameraStatus::Streaming.as_str(), "streaming");
    }
}
