//! Mixer engine
//!
//! Composite video mixer with scene presets, transitions, a graphics
//! overlay layer and per-slot audio. The engine owns the program pipeline
//! directly (unlike ingest and recording it has to perform live graph
//! surgery: branches come and go while the output keeps running). Branch
//! failures degrade the slot to a placeholder; only program-side failures
//! move the mixer to `error`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_video as gst_video;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Codec, ConfigStore, Resolution};
use crate::error::{AppError, Result};
use crate::events::{ComponentError, EventBus, SystemEvent};
use crate::pipeline::runtime::{self, PipelineEvent};
use crate::pipeline::{builder, SourceRef};
use crate::platform::PlatformProbe;
use crate::recording::MIXER_PROGRAM_PATH;
use crate::registry::{PathKind, RegistryClient};

use super::graphics::{GraphicsRenderer, OverlaySurface};
use super::scene::{Scene, SceneStore, Slot, Transition, WipeDirection};

const START_DEADLINE: Duration = Duration::from_secs(10);
/// Z-order of the graphics layer, above any scene slot
const GRAPHICS_ZORDER: u32 = 1000;

/// Mixer output state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MixerOutputState {
    Null,
    Ready,
    Playing,
    Error,
}

impl MixerOutputState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Ready => "ready",
            Self::Playing => "playing",
            Self::Error => "error",
        }
    }
}

/// Transition progress as observed from outside
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TransitionStatus {
    None,
    InProgress { kind: String, remaining_ms: u64 },
}

/// Snapshot of the mixer
#[derive(Debug, Clone, Serialize)]
pub struct MixerState {
    pub output_state: MixerOutputState,
    pub current_scene: Option<String>,
    pub previous_scene: Option<String>,
    pub transition: TransitionStatus,
    pub overlays: Vec<String>,
    pub last_error: Option<ComponentError>,
}

impl Default for MixerState {
    fn default() -> Self {
        Self {
            output_state: MixerOutputState::Null,
            current_scene: None,
            previous_scene: None,
            transition: TransitionStatus::None,
            overlays: Vec::new(),
            last_error: None,
        }
    }
}

struct Branch {
    source: SourceRef,
    slot: Slot,
    bin: gst::Bin,
    video_pad: gst::Pad,
    audio_pad: Option<gst::Pad>,
    placeholder: bool,
    /// Scheduled for removal when the running transition completes
    removing: bool,
}

struct RunningTransition {
    transition: Transition,
    started: Instant,
    duration: Duration,
    incoming: Vec<String>,
}

struct DriverGuard {
    cancel: CancellationToken,
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Active {
    pipeline: gst::Pipeline,
    compositor: gst::Element,
    audio_mixer: gst::Element,
    gfx: gstreamer_app::AppSrc,
    renderer: GraphicsRenderer,
    branches: HashMap<String, Branch>,
    current_scene: Option<Arc<Scene>>,
    previous_scene: Option<Arc<Scene>>,
    transition: Option<RunningTransition>,
    canvas: Resolution,
    framerate: u32,
    error: Option<String>,
    poll_countdown: u32,
    _driver: DriverGuard,
}

#[derive(Default)]
struct Inner {
    active: Option<Active>,
    last_error: Option<ComponentError>,
}

pub struct MixerEngine {
    config: Arc<ConfigStore>,
    scenes: Arc<SceneStore>,
    probe: Arc<PlatformProbe>,
    registry: Arc<RegistryClient>,
    events: Arc<EventBus>,
    inner: Mutex<Inner>,
    snapshot: Arc<ArcSwap<MixerState>>,
}

impl MixerEngine {
    pub fn new(
        config: Arc<ConfigStore>,
        scenes: Arc<SceneStore>,
        probe: Arc<PlatformProbe>,
        registry: Arc<RegistryClient>,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            scenes,
            probe,
            registry,
            events,
            inner: Mutex::new(Inner::default()),
            snapshot: Arc::new(ArcSwap::from_pointee(MixerState::default())),
        })
    }

    /// Value-copy snapshot
    pub fn snapshot(&self) -> MixerState {
        self.snapshot.load().as_ref().clone()
    }

    /// Bring composition and output encoder online. Idempotent while
    /// healthy; a mixer in `error` must be stopped first.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(active) = &inner.active {
            if active.error.is_some() {
                return Err(AppError::Busy("mixer is in error state, stop it first".into()));
            }
            return Ok(());
        }

        let cfg = self.config.get();
        let mixer_cfg = cfg.mixer.clone();
        let canvas = mixer_cfg.output_resolution;
        info!(resolution = %canvas, codec = %mixer_cfg.output_codec, "Starting mixer");

        let profile = self.probe.resolve(
            mixer_cfg.output_codec,
            canvas.is_4k(),
            mixer_cfg.output_bitrate,
            mixer_cfg.output_framerate,
        )?;

        if let Err(e) = self
            .registry
            .ensure_path(MIXER_PROGRAM_PATH, PathKind::Publisher)
            .await
        {
            warn!("ensure_path for program output failed: {}", e);
        }

        runtime::ensure_gst_init();
        let desc = builder::mixer_program(
            &mixer_cfg,
            &profile,
            &self.registry.publish_url(MIXER_PROGRAM_PATH),
        );
        let pipeline = runtime::realize_pipeline(&desc)?;

        let missing = |what: &str| AppError::PipelineFatal {
            pipeline: "mixer_program".into(),
            reason: format!("program graph has no '{}'", what),
        };
        let compositor = pipeline.by_name("comp").ok_or_else(|| missing("comp"))?;
        let audio_mixer = pipeline.by_name("amix").ok_or_else(|| missing("amix"))?;
        let gfx = pipeline
            .by_name("gfx_src")
            .and_then(|el| el.dynamic_cast::<gstreamer_app::AppSrc>().ok())
            .ok_or_else(|| missing("gfx_src"))?;

        let video_info = gst_video::VideoInfo::builder(
            gst_video::VideoFormat::Rgba,
            canvas.width,
            canvas.height,
        )
        .fps(gst::Fraction::new(mixer_cfg.output_framerate.max(1) as i32, 1))
        .build()
        .map_err(|e| AppError::PipelineFatal {
            pipeline: "mixer_program".into(),
            reason: format!("graphics video info: {}", e),
        })?;
        gfx.set_caps(Some(&video_info.to_caps().map_err(|e| {
            AppError::PipelineFatal {
                pipeline: "mixer_program".into(),
                reason: format!("graphics caps: {}", e),
            }
        })?));

        // the graphics pad sits above every scene slot
        if let Some(peer) = gfx_compositor_pad(&pipeline) {
            peer.set_property("zorder", GRAPHICS_ZORDER);
        }

        // the graph is realized and linked: ready, not yet playing
        self.snapshot.store(Arc::new(MixerState {
            output_state: MixerOutputState::Ready,
            ..MixerState::default()
        }));
        self.publish_mixer_event();

        if let Err(e) = wait_for_playing(&pipeline, START_DEADLINE).await {
            let _ = pipeline.set_state(gst::State::Null);
            let _ = pipeline.state(gst::ClockTime::from_seconds(3));
            inner.last_error = Some(ComponentError::now(e.kind(), e.to_string()));
            self.store_snapshot(&inner);
            return Err(e);
        }

        let cancel = CancellationToken::new();
        let driver = DriverGuard {
            cancel: cancel.clone(),
        };
        inner.active = Some(Active {
            pipeline,
            compositor,
            audio_mixer,
            gfx,
            renderer: GraphicsRenderer::new(canvas),
            branches: HashMap::new(),
            current_scene: None,
            previous_scene: None,
            transition: None,
            canvas,
            framerate: mixer_cfg.output_framerate.max(1),
            error: None,
            poll_countdown: 0,
            _driver: driver,
        });
        inner.last_error = None;
        self.store_snapshot(&inner);
        self.publish_mixer_event();
        drop(inner);

        self.spawn_driver(cancel, mixer_cfg.output_framerate.max(1));
        Ok(())
    }

    /// Tear down composition, branches and the output encoder. Idempotent.
    pub async fn stop(self: &Arc<Self>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(active) = inner.active.take() else {
            return Ok(());
        };
        info!("Stopping mixer");
        // branches live inside the pipeline, one null transition covers all
        let _ = active.pipeline.set_state(gst::State::Null);
        let _ = active.pipeline.state(gst::ClockTime::from_seconds(3));
        self.store_snapshot(&inner);
        self.publish_mixer_event();
        Ok(())
    }

    /// Apply a scene. Additions come up before the transition starts;
    /// branches leaving the composition are stopped when it completes.
    pub async fn set_scene(self: &Arc<Self>, scene_id: &str, transition: Transition) -> Result<()> {
        let scene = self
            .scenes
            .get(scene_id)
            .ok_or_else(|| AppError::NotFound(format!("scene {}", scene_id)))?;

        let cfg = self.config.get();
        let mut inner = self.inner.lock().await;
        let active = inner
            .active
            .as_mut()
            .ok_or_else(|| AppError::Busy("mixer is not running".into()))?;
        if active.error.is_some() {
            return Err(AppError::Busy("mixer is in error state".into()));
        }

        // idempotent: re-applying the current scene outside a transition
        // leaves everything untouched
        if active.transition.is_none()
            && active
                .current_scene
                .as_ref()
                .is_some_and(|s| s.scene_id == scene_id)
        {
            return Ok(());
        }

        info!(scene = %scene_id, kind = transition.kind_str(), "Applying scene");

        // a transition already in flight jumps to its end state first
        if active.transition.take().is_some() {
            finalize_transition(active);
        }

        // graphics slots define overlay z-order
        for slot in scene.graphics_slots() {
            if let SourceRef::Graphics(id) = &slot.source {
                if !active.renderer.exists(id) {
                    active.renderer.create(id, slot.z);
                } else {
                    active.renderer.set_z(id, slot.z);
                }
            }
        }

        let required: HashMap<String, Slot> = scene
            .media_slots()
            .map(|slot| (slot.source.key(), slot.clone()))
            .collect();

        let fade_like = !matches!(transition, Transition::Cut);

        // additions: bring new branches to playing before the transition
        let mut incoming = Vec::new();
        for (key, slot) in &required {
            if active.branches.contains_key(key) {
                continue;
            }
            let initial_alpha = if fade_like { 0.0 } else { slot.opacity };
            match self
                .create_branch(active, &cfg, key, slot, initial_alpha, false)
                .await
            {
                Ok(branch) => {
                    if let Transition::Wipe { direction, .. } = transition {
                        offset_pad_for_wipe(&branch.video_pad, slot, active.canvas, direction, 0.0);
                    }
                    active.branches.insert(key.clone(), branch);
                    incoming.push(key.clone());
                }
                Err(e) => {
                    // the slot becomes live when its source appears
                    warn!(slot = %key, "Branch creation failed ({}), using placeholder", e);
                    if let Ok(branch) = self
                        .create_branch(active, &cfg, key, slot, initial_alpha, true)
                        .await
                    {
                        active.branches.insert(key.clone(), branch);
                        incoming.push(key.clone());
                    }
                }
            }
        }

        // shared branches: new geometry applies directly
        for (key, slot) in &required {
            if incoming.contains(key) {
                continue;
            }
            if let Some(branch) = active.branches.get_mut(key) {
                branch.slot = slot.clone();
                branch.removing = false;
                apply_slot_to_pad(&branch.video_pad, slot, active.canvas, slot.opacity);
                if let Some(audio_pad) = &branch.audio_pad {
                    audio_pad.set_property("volume", slot.gain);
                }
            }
        }

        // removals
        let mut outgoing = Vec::new();
        for (key, branch) in active.branches.iter_mut() {
            if !required.contains_key(key) {
                branch.removing = true;
                outgoing.push(key.clone());
            }
        }

        active.previous_scene = active.current_scene.take();
        active.current_scene = Some(scene);

        match transition {
            Transition::Cut => {
                for key in outgoing {
                    if let Some(branch) = active.branches.remove(&key) {
                        remove_branch(active, branch);
                    }
                }
                self.store_snapshot(&inner);
                self.publish_mixer_event();
            }
            _ => {
                let active = inner.active.as_mut().expect("still active");
                active.transition = Some(RunningTransition {
                    transition,
                    started: Instant::now(),
                    duration: transition.duration(),
                    incoming,
                });
                self.store_snapshot(&inner);
                self.publish_mixer_event();
            }
        }
        Ok(())
    }

    /// Toggle a graphics layer. Unknown ids are created on first use so a
    /// control surface can toggle before pushing content.
    pub async fn set_overlay(self: &Arc<Self>, graphics_id: &str, visible: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let active = inner
            .active
            .as_mut()
            .ok_or_else(|| AppError::Busy("mixer is not running".into()))?;
        active.renderer.set_visible(graphics_id, visible);
        self.store_snapshot(&inner);
        self.publish_mixer_event();
        Ok(())
    }

    /// Stage new raster content for an overlay (tear-free swap)
    pub async fn update_overlay(
        self: &Arc<Self>,
        graphics_id: &str,
        surface: OverlaySurface,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let active = inner
            .active
            .as_mut()
            .ok_or_else(|| AppError::Busy("mixer is not running".into()))?;
        if !active.renderer.exists(graphics_id) {
            active.renderer.create(graphics_id, 0);
        }
        active.renderer.update(graphics_id, surface)
    }

    pub async fn delete_overlay(self: &Arc<Self>, graphics_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let active = inner
            .active
            .as_mut()
            .ok_or_else(|| AppError::Busy("mixer is not running".into()))?;
        active.renderer.delete(graphics_id);
        self.store_snapshot(&inner);
        Ok(())
    }

    fn spawn_driver(self: &Arc<Self>, cancel: CancellationToken, framerate: u32) {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_millis(1000 / framerate as u64));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tick.tick() => engine.driver_tick().await,
                }
            }
        });
    }

    /// One frame of housekeeping: bus, transition, graphics, placeholders
    async fn driver_tick(self: &Arc<Self>) {
        let cfg = self.config.get();
        let mut inner = self.inner.lock().await;
        let Some(active) = inner.active.as_mut() else {
            return;
        };
        if active.error.is_some() {
            return;
        }

        // 1. bus: branch errors degrade the slot, program errors are fatal
        let mut failed_branches = Vec::new();
        let mut program_error = None;
        if let Some(bus) = active.pipeline.bus() {
            for event in runtime::pop_bus_events(&bus) {
                match event {
                    PipelineEvent::FatalError { message, source } => {
                        match source.as_deref().and_then(|s| branch_key_from_path(s, &active.branches)) {
                            Some(key) => failed_branches.push((key, message)),
                            None => program_error = Some(message),
                        }
                    }
                    PipelineEvent::Eos => program_error = Some("unexpected end of stream".into()),
                    PipelineEvent::Warning { message } => {
                        debug!(warning = %message, "Mixer bus warning");
                    }
                }
            }
        }

        if let Some(message) = program_error {
            warn!(error = %message, "Program pipeline failed, mixer requires stop/start");
            active.error = Some(message.clone());
            let _ = active.pipeline.set_state(gst::State::Null);
            inner.last_error = Some(ComponentError::now("pipeline_fatal", message));
            self.store_snapshot(&inner);
            self.publish_mixer_event();
            return;
        }

        for (key, message) in failed_branches {
            warn!(slot = %key, error = %message, "Branch failed, degrading to placeholder");
            self.degrade_to_placeholder(active, &cfg, &key).await;
        }

        // 2. transition progress
        if let Some(running) = active.transition.take() {
            let elapsed = running.started.elapsed();
            if elapsed >= running.duration {
                finalize_transition(active);
                self.push_graphics(active);
                self.store_snapshot(&inner);
                self.publish_mixer_event();
            } else {
                let progress =
                    elapsed.as_secs_f64() / running.duration.as_secs_f64().max(f64::EPSILON);
                active.transition = Some(running);
                advance_transition(active, progress);
                self.push_graphics(active);
                self.store_snapshot(&inner);
            }
            return;
        }

        // 3. graphics frame
        self.push_graphics(active);

        // 4. placeholder poll at its own cadence
        if active.poll_countdown == 0 {
            active.poll_countdown =
                (cfg.mixer.placeholder_poll_secs.max(1) as u32) * active.framerate;
            let placeholders: Vec<String> = active
                .branches
                .iter()
                .filter(|(_, b)| b.placeholder && !b.removing)
                .map(|(k, _)| k.clone())
                .collect();
            for key in placeholders {
                let Some(path) = active
                    .branches
                    .get(&key)
                    .and_then(|b| b.source.stream_path().map(str::to_string))
                else {
                    continue;
                };
                if self.registry.is_ready(&path).await {
                    info!(slot = %key, "Source became ready, replacing placeholder");
                    self.promote_placeholder(active, &cfg, &key).await;
                }
            }
        } else {
            active.poll_countdown -= 1;
        }
    }

    fn push_graphics(&self, active: &mut Active) {
        let frame = active.renderer.render();
        let buffer = gst::Buffer::from_slice(frame.to_vec());
        // Flushing while paused or tearing down is expected noise
        let _ = active.gfx.push_buffer(buffer);
    }

    /// Replace a failed or missing-source branch with a placeholder on the
    /// same slot. Never propagates an error.
    async fn degrade_to_placeholder(
        &self,
        active: &mut Active,
        cfg: &crate::config::AppConfig,
        key: &str,
    ) {
        let Some(old) = active.branches.remove(key) else {
            return;
        };
        if old.placeholder {
            active.branches.insert(key.to_string(), old);
            return;
        }
        let slot = old.slot.clone();
        remove_branch(active, old);
        match self.create_branch(active, cfg, key, &slot, slot.opacity, true).await {
            Ok(branch) => {
                active.branches.insert(key.to_string(), branch);
            }
            Err(e) => warn!(slot = %key, "Placeholder creation failed: {}", e),
        }
    }

    /// Swap a placeholder for a real branch now that the source publishes
    async fn promote_placeholder(
        &self,
        active: &mut Active,
        cfg: &crate::config::AppConfig,
        key: &str,
    ) {
        let Some(old) = active.branches.remove(key) else {
            return;
        };
        let slot = old.slot.clone();
        match self.create_branch(active, cfg, key, &slot, slot.opacity, false).await {
            Ok(branch) => {
                remove_branch(active, old);
                active.branches.insert(key.to_string(), branch);
            }
            Err(e) => {
                debug!(slot = %key, "Promotion failed, keeping placeholder: {}", e);
                active.branches.insert(key.to_string(), old);
            }
        }
    }

    /// Create a branch bin and attach it to the composition
    async fn create_branch(
        &self,
        active: &mut Active,
        cfg: &crate::config::AppConfig,
        key: &str,
        slot: &Slot,
        initial_alpha: f64,
        force_placeholder: bool,
    ) -> Result<Branch> {
        let path = slot
            .source
            .stream_path()
            .ok_or_else(|| AppError::Internal(format!("slot {} has no stream path", key)))?
            .to_string();
        let target = slot.pixel_size(active.canvas);

        let placeholder = force_placeholder || !self.registry.is_ready(&path).await;
        let desc = if placeholder {
            builder::placeholder_branch(key, target, active.framerate)
        } else {
            let (codec, audio) = match (&slot.source, cfg.camera(&path)) {
                (SourceRef::Camera(_), Some(camera)) => (camera.codec, camera.audio_enabled),
                // guests and presentations publish H.264 over WHIP/RTSP
                _ => (Codec::H264, false),
            };
            let decoder = self.probe.resolve_decoder(codec)?;
            let crop = slot
                .crop_px(active.canvas)
                .map(|c| [c.left, c.top, c.right, c.bottom]);
            builder::mixer_branch(
                key,
                codec,
                &decoder,
                &self.registry.read_url(&path),
                target,
                crop,
                audio,
            )
        };

        let bin = runtime::realize_branch_bin(&desc)?;
        let graph_error = |reason: String| AppError::PipelineFatal {
            pipeline: desc.name.clone(),
            reason,
        };

        active
            .pipeline
            .add(&bin)
            .map_err(|e| graph_error(format!("adding branch: {}", e)))?;

        let video_pad = active
            .compositor
            .request_pad_simple("sink_%u")
            .ok_or_else(|| graph_error("compositor refused a pad".into()))?;
        let src_pad = bin
            .static_pad("src")
            .ok_or_else(|| graph_error("branch bin has no src ghost pad".into()))?;
        if let Err(e) = src_pad.link(&video_pad) {
            active.compositor.release_request_pad(&video_pad);
            let _ = active.pipeline.remove(&bin);
            return Err(graph_error(format!("linking branch: {:?}", e)));
        }

        let audio_pad = match bin.static_pad("audio_src") {
            Some(audio_src) => {
                let pad = active
                    .audio_mixer
                    .request_pad_simple("sink_%u")
                    .ok_or_else(|| graph_error("audio mixer refused a pad".into()))?;
                pad.set_property("volume", slot.gain);
                audio_src
                    .link(&pad)
                    .map_err(|e| graph_error(format!("linking branch audio: {:?}", e)))?;
                Some(pad)
            }
            None => None,
        };

        apply_slot_to_pad(&video_pad, slot, active.canvas, initial_alpha);
        bin.sync_state_with_parent()
            .map_err(|e| graph_error(format!("branch refused to start: {}", e)))?;

        Ok(Branch {
            source: slot.source.clone(),
            slot: slot.clone(),
            bin,
            video_pad,
            audio_pad,
            placeholder,
            removing: false,
        })
    }

    fn store_snapshot(&self, inner: &Inner) {
        let state = match &inner.active {
            Some(active) => MixerState {
                output_state: if active.error.is_some() {
                    MixerOutputState::Error
                } else {
                    MixerOutputState::Playing
                },
                current_scene: active.current_scene.as_ref().map(|s| s.scene_id.clone()),
                previous_scene: active.previous_scene.as_ref().map(|s| s.scene_id.clone()),
                transition: match &active.transition {
                    Some(running) => TransitionStatus::InProgress {
                        kind: running.transition.kind_str().to_string(),
                        remaining_ms: running
                            .duration
                            .saturating_sub(running.started.elapsed())
                            .as_millis() as u64,
                    },
                    None => TransitionStatus::None,
                },
                overlays: active.renderer.visible_ids(),
                last_error: inner.last_error.clone(),
            },
            None => MixerState {
                last_error: inner.last_error.clone(),
                ..MixerState::default()
            },
        };
        self.snapshot.store(Arc::new(state));
    }

    fn publish_mixer_event(&self) {
        let snap = self.snapshot.load();
        let transition = match &snap.transition {
            TransitionStatus::None => None,
            TransitionStatus::InProgress { kind, .. } => Some(kind.clone()),
        };
        self.events.publish(SystemEvent::Mixer {
            output_state: snap.output_state.as_str().to_string(),
            current_scene: snap.current_scene.clone(),
            transition,
        });
    }
}

/// Set compositor pad geometry, z-order and alpha for a slot
fn apply_slot_to_pad(pad: &gst::Pad, slot: &Slot, canvas: Resolution, alpha: f64) {
    let (x, y, w, h) = slot.pixel_rect(canvas);
    pad.set_property("xpos", x);
    pad.set_property("ypos", y);
    pad.set_property("width", w);
    pad.set_property("height", h);
    pad.set_property("alpha", alpha.clamp(0.0, 1.0));
    pad.set_property("zorder", (100 + slot.z.max(-100)) as u32);
}

/// Start position for a wipe: the slot offset off the given edge,
/// interpolated back to its place as `progress` goes 0 → 1
fn offset_pad_for_wipe(
    pad: &gst::Pad,
    slot: &Slot,
    canvas: Resolution,
    direction: WipeDirection,
    progress: f64,
) {
    let (x, y, w, h) = slot.pixel_rect(canvas);
    let t = progress.clamp(0.0, 1.0);
    let (start_x, start_y) = match direction {
        WipeDirection::Left => (canvas.width as i32, y),
        WipeDirection::Right => (-w, y),
        WipeDirection::Up => (x, canvas.height as i32),
        WipeDirection::Down => (x, -h),
    };
    let cur_x = start_x + ((x - start_x) as f64 * t).round() as i32;
    let cur_y = start_y + ((y - start_y) as f64 * t).round() as i32;
    pad.set_property("xpos", cur_x);
    pad.set_property("ypos", cur_y);
}

/// Animate pads for one transition step
fn advance_transition(active: &mut Active, progress: f64) {
    let Some(running) = &active.transition else {
        return;
    };
    let t = progress.clamp(0.0, 1.0);
    let kind = running.transition;
    let incoming = running.incoming.clone();

    for (key, branch) in active.branches.iter() {
        if branch.removing {
            // previous scene's branches stay alive and fade out
            let alpha = branch.slot.opacity * (1.0 - t);
            branch.video_pad.set_property("alpha", alpha);
            continue;
        }
        if !incoming.contains(key) {
            continue;
        }
        match kind {
            Transition::Fade { .. } => {
                branch
                    .video_pad
                    .set_property("alpha", branch.slot.opacity * t);
            }
            Transition::Wipe { direction, .. } => {
                branch
                    .video_pad
                    .set_property("alpha", branch.slot.opacity);
                offset_pad_for_wipe(&branch.video_pad, &branch.slot, active.canvas, direction, t);
            }
            Transition::Cut => {}
        }
    }
}

/// Jump to the transition's end state: final geometry and alpha for the
/// survivors, removal of everything that left the scene
fn finalize_transition(active: &mut Active) {
    let keys: Vec<String> = active.branches.keys().cloned().collect();
    for key in keys {
        let Some(branch) = active.branches.get(&key) else {
            continue;
        };
        if branch.removing {
            let branch = active.branches.remove(&key).expect("key from map");
            remove_branch(active, branch);
        } else {
            let slot = branch.slot.clone();
            apply_slot_to_pad(&branch.video_pad, &slot, active.canvas, slot.opacity);
        }
    }
}

/// Detach and destroy one branch; the composition keeps running
fn remove_branch(active: &mut Active, branch: Branch) {
    let _ = branch.bin.set_state(gst::State::Null);
    if let Some(src_pad) = branch.bin.static_pad("src") {
        let _ = src_pad.unlink(&branch.video_pad);
    }
    active.compositor.release_request_pad(&branch.video_pad);
    if let Some(audio_pad) = &branch.audio_pad {
        if let Some(audio_src) = branch.bin.static_pad("audio_src") {
            let _ = audio_src.unlink(audio_pad);
        }
        active.audio_mixer.release_request_pad(audio_pad);
    }
    let _ = active.pipeline.remove(&branch.bin);
}

/// Compositor pad fed by the graphics chain, if wired
fn gfx_compositor_pad(pipeline: &gst::Pipeline) -> Option<gst::Pad> {
    let gfx_out = pipeline.by_name("gfx_out")?;
    gfx_out.static_pad("src")?.peer()
}

/// Map a bus message source path to the branch that owns it
fn branch_key_from_path(path: &str, branches: &HashMap<String, Branch>) -> Option<String> {
    branches
        .iter()
        .find(|(_, b)| path.contains(&b.bin.name().to_string()))
        .map(|(k, _)| k.clone())
}

/// Wait until the pipeline reports playing, watching the bus for errors
async fn wait_for_playing(pipeline: &gst::Pipeline, deadline: Duration) -> Result<()> {
    let started = Instant::now();
    pipeline
        .set_state(gst::State::Playing)
        .map_err(|e| AppError::PipelineFatal {
            pipeline: pipeline.name().to_string(),
            reason: format!("refused playing state: {}", e),
        })?;

    loop {
        if let Some(bus) = pipeline.bus() {
            for event in runtime::pop_bus_events(&bus) {
                if let PipelineEvent::FatalError { message, .. } = event {
                    return Err(AppError::PipelineFatal {
                        pipeline: pipeline.name().to_string(),
                        reason: message,
                    });
                }
            }
        }
        let (_, current, _) = pipeline.state(gst::ClockTime::ZERO);
        if current == gst::State::Playing {
            return Ok(());
        }
        if started.elapsed() >= deadline {
            return Err(AppError::StartTimeout {
                what: pipeline.name().to_string(),
                deadline_secs: deadline.as_secs(),
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_is_null() {
        let state = MixerState::default();
        assert_eq!(state.output_state, MixerOutputState::Null);
        assert_eq!(state.transition, TransitionStatus::None);
        assert!(state.overlays.is_empty());
    }

    #[test]
    fn test_transition_status_serializes_with_kind() {
        let status = TransitionStatus::InProgress {
            kind: "fade".into(),
            remaining_ms: 150,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "in_progress");
        assert_eq!(json["kind"], "fade");
        assert_eq!(json["remaining_ms"], 150);
    }

    #[test]
    fn test_output_state_strings() {
        assert_eq!(MixerOutputState::Null.as_str(), "null");
        assert_eq!(MixerOutputState::Ready.as_str(), "ready");
        assert_eq!(MixerOutputState::Playing.as_str(), "playing");
        assert_eq!(MixerOutputState::Error.as_str(), "error");
    }

    #[test]
    fn test_ready_snapshot_between_null_and_playing() {
        let state = MixerState {
            output_state: MixerOutputState::Ready,
            ..MixerState::default()
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["output_state"], "ready");
        assert_eq!(json["current_scene"], serde_json::Value::Null);
    }
}
