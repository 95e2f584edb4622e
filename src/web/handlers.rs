//! REST handlers
//!
//! Thin translation from HTTP to arbiter and supervisor calls. Handlers
//! never hold supervisor state; every read goes through snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::arbiter::Mode;
use crate::error::{AppError, Result};
use crate::ingest::CameraRuntimeState;
use crate::mixer::Transition;
use crate::pipeline::{builder, runtime};
use crate::recording::Session;
use crate::state::AppState;

const PREVIEW_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
pub struct HealthResponse {
    pub success: bool,
    pub version: &'static str,
    pub uptime_secs: u64,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        success: true,
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.uptime_secs(),
    })
}

// ---------------------------------------------------------------------------
// mode

#[derive(Serialize)]
pub struct ModeResponse {
    pub mode: Option<String>,
    pub switching: bool,
}

pub async fn mode_get(State(state): State<Arc<AppState>>) -> Json<ModeResponse> {
    Json(ModeResponse {
        mode: state
            .arbiter
            .current_mode()
            .await
            .map(|m| m.as_str().to_string()),
        switching: state.arbiter.is_switching(),
    })
}

pub async fn mode_set(
    State(state): State<Arc<AppState>>,
    Path(mode): Path<String>,
) -> Result<Json<ModeResponse>> {
    let target = Mode::parse(&mode)?;
    let mode = state.arbiter.switch_to(target).await?;
    Ok(Json(ModeResponse {
        mode: Some(mode.as_str().to_string()),
        switching: false,
    }))
}

// ---------------------------------------------------------------------------
// ingest

pub async fn ingest_status(
    State(state): State<Arc<AppState>>,
) -> Json<BTreeMap<String, CameraRuntimeState>> {
    let cameras = state
        .arbiter
        .ingest()
        .snapshot_all()
        .await
        .into_iter()
        .map(|s| (s.camera_id.clone(), s))
        .collect();
    Json(cameras)
}

/// Require recorder mode for operations that drive capture devices
async fn require_recorder(state: &AppState) -> Result<()> {
    match state.arbiter.current_mode().await {
        Some(Mode::Recorder) => Ok(()),
        Some(Mode::PeerWebrtc) => Err(AppError::Busy(
            "capture devices are owned by the peer WebRTC stack".into(),
        )),
        None => Err(AppError::Degraded),
    }
}

pub async fn ingest_start(
    State(state): State<Arc<AppState>>,
    Path(cam): Path<String>,
) -> Result<Json<CameraRuntimeState>> {
    require_recorder(&state).await?;
    let cfg = state.config.get();
    let camera = cfg
        .camera(&cam)
        .ok_or_else(|| AppError::NotFound(format!("camera {}", cam)))?;
    state.arbiter.ingest().ensure_camera(camera).await;
    let snapshot = state
        .arbiter
        .ingest()
        .get(&cam)
        .await
        .map(|s| s.snapshot())
        .ok_or_else(|| AppError::Internal("supervisor vanished after ensure".into()))?;
    Ok(Json(snapshot))
}

pub async fn ingest_stop(
    State(state): State<Arc<AppState>>,
    Path(cam): Path<String>,
) -> Result<Json<CameraRuntimeState>> {
    match state.arbiter.ingest().get(&cam).await {
        Some(supervisor) => {
            supervisor.stop().await;
            Ok(Json(supervisor.snapshot()))
        }
        // configured but never started: stopping is a no-op
        None if state.config.get().camera(&cam).is_some() => {
            Ok(Json(CameraRuntimeState {
                camera_id: cam,
                status: crate::ingest::CameraStatus::Idle,
                actual_resolution: None,
                has_signal: false,
                last_error: None,
                restart_count: 0,
            }))
        }
        None => Err(AppError::NotFound(format!("camera {}", cam))),
    }
}

/// One JPEG frame pulled from the camera's stream path
pub async fn camera_snapshot(
    State(state): State<Arc<AppState>>,
    Path(cam): Path<String>,
) -> Result<impl IntoResponse> {
    let cfg = state.config.get();
    let camera = cfg
        .camera(&cam)
        .ok_or_else(|| AppError::NotFound(format!("camera {}", cam)))?;
    if !state.arbiter.ingest().is_streaming(&cam).await {
        return Err(AppError::NoSignal(cam));
    }

    let decoder = state.probe.resolve_decoder(camera.codec)?;
    let desc = builder::preview(&cam, camera.codec, &decoder, &state.registry.read_url(&cam));
    let jpeg = runtime::capture_preview_frame(desc, PREVIEW_TIMEOUT).await?;
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], jpeg))
}

// ---------------------------------------------------------------------------
// recording

#[derive(Deserialize)]
pub struct StartRecordingRequest {
    pub cameras: Vec<String>,
}

pub async fn recording_start(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartRecordingRequest>,
) -> Result<Json<Session>> {
    require_recorder(&state).await?;
    let session = state.arbiter.recording().start(request.cameras).await?;
    Ok(Json(session))
}

pub async fn recording_stop(State(state): State<Arc<AppState>>) -> Result<Json<Session>> {
    let session = state.arbiter.recording().stop().await?;
    Ok(Json(session))
}

pub async fn recording_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.arbiter.recording().status().await)
}

pub async fn recording_sessions(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Session>>> {
    Ok(Json(state.arbiter.recording().list_sessions()?))
}

// ---------------------------------------------------------------------------
// mixer

pub async fn mixer_start(State(state): State<Arc<AppState>>) -> Result<Json<crate::mixer::MixerState>> {
    require_recorder(&state).await?;
    state.arbiter.mixer().start().await?;
    Ok(Json(state.arbiter.mixer().snapshot()))
}

pub async fn mixer_stop(State(state): State<Arc<AppState>>) -> Result<Json<crate::mixer::MixerState>> {
    state.arbiter.mixer().stop().await?;
    Ok(Json(state.arbiter.mixer().snapshot()))
}

#[derive(Deserialize, Default)]
pub struct SceneRequest {
    #[serde(default)]
    pub transition: Option<Transition>,
}

pub async fn mixer_scene(
    State(state): State<Arc<AppState>>,
    Path(scene_id): Path<String>,
    body: Option<Json<SceneRequest>>,
) -> Result<Json<crate::mixer::MixerState>> {
    let transition = body
        .and_then(|Json(r)| r.transition)
        .unwrap_or(Transition::Cut);
    state.arbiter.mixer().set_scene(&scene_id, transition).await?;
    Ok(Json(state.arbiter.mixer().snapshot()))
}

#[derive(Serialize)]
pub struct ScenesResponse {
    pub scenes: Vec<String>,
    pub current: Option<String>,
}

pub async fn mixer_scenes(State(state): State<Arc<AppState>>) -> Json<ScenesResponse> {
    Json(ScenesResponse {
        scenes: state.scenes.list(),
        current: state.arbiter.mixer().snapshot().current_scene,
    })
}

#[derive(Deserialize)]
pub struct OverlayRequest {
    pub visible: bool,
}

pub async fn mixer_overlay(
    State(state): State<Arc<AppState>>,
    Path(graphics_id): Path<String>,
    Json(request): Json<OverlayRequest>,
) -> Result<Json<crate::mixer::MixerState>> {
    state
        .arbiter
        .mixer()
        .set_overlay(&graphics_id, request.visible)
        .await?;
    Ok(Json(state.arbiter.mixer().snapshot()))
}

// ---------------------------------------------------------------------------
// aggregate / config

pub async fn aggregate_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.aggregate_status().await)
}

#[derive(Serialize)]
pub struct ReloadResponse {
    pub success: bool,
    pub cameras: usize,
    pub scenes: usize,
}

/// Re-read configuration and scenes, then reconcile the running mode
pub async fn config_reload(State(state): State<Arc<AppState>>) -> Result<Json<ReloadResponse>> {
    let config = state.config.reload()?;
    let scenes = state.scenes.load_all()?;
    state.arbiter.reconcile_config().await;
    Ok(Json(ReloadResponse {
        success: true,
        cameras: config.cameras.len(),
        scenes,
    }))
}
