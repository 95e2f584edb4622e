//! Scenes
//!
//! A scene is a named composition of slots over sources with normalized
//! geometry and ordering. Scenes are configuration: loaded from the scenes
//! directory, immutable at runtime, replaced whole by id on reload.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::Resolution;
use crate::error::{AppError, Result};
use crate::pipeline::SourceRef;

/// Normalized crop rectangle inside a slot's source, in [0,1]²
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Crop {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

/// Pixel crop for the branch builder: left, top, right, bottom
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropPx {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

fn default_opacity() -> f64 {
    1.0
}

fn default_gain() -> f64 {
    1.0
}

/// One rectangle in a scene, bound to one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub source: SourceRef,
    /// Normalized position and size in [0,1]²
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    #[serde(default)]
    pub z: i32,
    #[serde(default = "default_opacity")]
    pub opacity: f64,
    /// Audio gain for this slot's source
    #[serde(default = "default_gain")]
    pub gain: f64,
    #[serde(default)]
    pub crop: Option<Crop>,
}

impl Slot {
    /// Pixel rectangle on the program canvas
    pub fn pixel_rect(&self, canvas: Resolution) -> (i32, i32, i32, i32) {
        let x = (self.x * canvas.width as f64).round() as i32;
        let y = (self.y * canvas.height as f64).round() as i32;
        let w = (self.w * canvas.width as f64).round() as i32;
        let h = (self.h * canvas.height as f64).round() as i32;
        (x, y, w.max(1), h.max(1))
    }

    /// Slot size as a resolution, for branch scaling
    pub fn pixel_size(&self, canvas: Resolution) -> Resolution {
        let (_, _, w, h) = self.pixel_rect(canvas);
        Resolution::new(w as u32, h as u32)
    }

    /// Crop translated into pixels of the scaled slot
    pub fn crop_px(&self, canvas: Resolution) -> Option<CropPx> {
        let crop = self.crop?;
        let size = self.pixel_size(canvas);
        let left = (crop.x * size.width as f64).round() as u32;
        let top = (crop.y * size.height as f64).round() as u32;
        let right = ((1.0 - crop.x - crop.w).max(0.0) * size.width as f64).round() as u32;
        let bottom = ((1.0 - crop.y - crop.h).max(0.0) * size.height as f64).round() as u32;
        Some(CropPx {
            left,
            top,
            right,
            bottom,
        })
    }
}

/// A named composition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub scene_id: String,
    pub slots: Vec<Slot>,
}

impl Scene {
    pub fn validate(&self) -> Result<()> {
        if self.scene_id.is_empty() {
            return Err(AppError::ConfigInvalid("scene with empty id".into()));
        }
        for slot in &self.slots {
            let in_unit = |v: f64| (0.0..=1.0).contains(&v);
            if !in_unit(slot.x) || !in_unit(slot.y) || !in_unit(slot.w) || !in_unit(slot.h) {
                return Err(AppError::ConfigInvalid(format!(
                    "scene '{}': slot {} geometry out of [0,1]",
                    self.scene_id, slot.source
                )));
            }
            if slot.w == 0.0 || slot.h == 0.0 {
                return Err(AppError::ConfigInvalid(format!(
                    "scene '{}': slot {} has zero size",
                    self.scene_id, slot.source
                )));
            }
            if !(0.0..=1.0).contains(&slot.opacity) {
                return Err(AppError::ConfigInvalid(format!(
                    "scene '{}': slot {} opacity out of [0,1]",
                    self.scene_id, slot.source
                )));
            }
        }
        Ok(())
    }

    /// Slots that need a media branch (everything but graphics)
    pub fn media_slots(&self) -> impl Iterator<Item = &Slot> {
        self.slots
            .iter()
            .filter(|s| s.source.stream_path().is_some())
    }

    /// Graphics slots, composited by the overlay renderer
    pub fn graphics_slots(&self) -> impl Iterator<Item = &Slot> {
        self.slots
            .iter()
            .filter(|s| matches!(s.source, SourceRef::Graphics(_)))
    }
}

/// Transition between scenes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    Cut,
    Fade { duration_ms: u64 },
    Wipe { direction: WipeDirection, duration_ms: u64 },
}

impl Default for Transition {
    fn default() -> Self {
        Self::Cut
    }
}

impl Transition {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Cut => "cut",
            Self::Fade { .. } => "fade",
            Self::Wipe { .. } => "wipe",
        }
    }

    /// Duration clamped to the supported 200–1000 ms band; cuts are zero
    pub fn duration(&self) -> std::time::Duration {
        match self {
            Self::Cut => std::time::Duration::ZERO,
            Self::Fade { duration_ms } | Self::Wipe { duration_ms, .. } => {
                std::time::Duration::from_millis((*duration_ms).clamp(200, 1000))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WipeDirection {
    Left,
    Right,
    Up,
    Down,
}

/// Scene storage, backed by `scenes/{scene_id}.json`
pub struct SceneStore {
    dir: PathBuf,
    scenes: RwLock<HashMap<String, Arc<Scene>>>,
}

impl SceneStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            scenes: RwLock::new(HashMap::new()),
        }
    }

    /// Load every scene file; invalid files are skipped with a warning,
    /// valid ones replace any previous scene with the same id.
    pub fn load_all(&self) -> Result<usize> {
        if !self.dir.exists() {
            return Ok(0);
        }
        let mut loaded = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_scene(&path) {
                Ok(scene) => {
                    self.scenes
                        .write()
                        .insert(scene.scene_id.clone(), Arc::new(scene));
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(file = %path.display(), "Skipping invalid scene: {}", e)
                }
            }
        }
        tracing::info!(count = loaded, dir = %self.dir.display(), "Scenes loaded");
        Ok(loaded)
    }

    fn read_scene(path: &Path) -> Result<Scene> {
        let raw = std::fs::read(path)?;
        let scene: Scene = serde_json::from_slice(&raw)?;
        scene.validate()?;
        Ok(scene)
    }

    pub fn get(&self, scene_id: &str) -> Option<Arc<Scene>> {
        self.scenes.read().get(scene_id).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.scenes.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Insert directly (tests)
    pub fn insert(&self, scene: Scene) {
        self.scenes
            .write()
            .insert(scene.scene_id.clone(), Arc::new(scene));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(source: SourceRef, x: f64, y: f64, w: f64, h: f64) -> Slot {
        Slot {
            source,
            x,
            y,
            w,
            h,
            z: 0,
            opacity: 1.0,
            gain: 1.0,
            crop: None,
        }
    }

    #[test]
    fn test_pixel_rect() {
        let s = slot(SourceRef::Camera("cam0".into()), 0.5, 0.0, 0.5, 0.5);
        assert_eq!(s.pixel_rect(Resolution::HD1080), (960, 0, 960, 540));
        assert_eq!(s.pixel_size(Resolution::HD1080), Resolution::new(960, 540));
    }

    #[test]
    fn test_crop_px() {
        let mut s = slot(SourceRef::Camera("cam0".into()), 0.0, 0.0, 1.0, 1.0);
        s.crop = Some(Crop {
            x: 0.25,
            y: 0.0,
            w: 0.5,
            h: 1.0,
        });
        let crop = s.crop_px(Resolution::HD1080).unwrap();
        assert_eq!(crop.left, 480);
        assert_eq!(crop.right, 480);
        assert_eq!(crop.top, 0);
        assert_eq!(crop.bottom, 0);
    }

    #[test]
    fn test_validate_rejects_bad_geometry() {
        let scene = Scene {
            scene_id: "s".into(),
            slots: vec![slot(SourceRef::Camera("cam0".into()), 1.5, 0.0, 0.5, 0.5)],
        };
        assert!(scene.validate().is_err());
    }

    #[test]
    fn test_media_and_graphics_slots() {
        let scene = Scene {
            scene_id: "s".into(),
            slots: vec![
                slot(SourceRef::Camera("cam0".into()), 0.0, 0.0, 1.0, 1.0),
                slot(SourceRef::Graphics("lower_third".into()), 0.0, 0.7, 1.0, 0.3),
                slot(SourceRef::Guest("guest1".into()), 0.6, 0.6, 0.4, 0.4),
            ],
        };
        assert_eq!(scene.media_slots().count(), 2);
        assert_eq!(scene.graphics_slots().count(), 1);
    }

    #[test]
    fn test_transition_duration_clamped() {
        assert_eq!(Transition::Cut.duration().as_millis(), 0);
        assert_eq!(
            Transition::Fade { duration_ms: 50 }.duration().as_millis(),
            200
        );
        assert_eq!(
            Transition::Fade { duration_ms: 5000 }.duration().as_millis(),
            1000
        );
        assert_eq!(
            Transition::Wipe {
                direction: WipeDirection::Left,
                duration_ms: 400
            }
            .duration()
            .as_millis(),
            400
        );
    }

    #[test]
    fn test_store_replaces_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = SceneStore::new(dir.path());

        let scene = Scene {
            scene_id: "full".into(),
            slots: vec![slot(SourceRef::Camera("cam0".into()), 0.0, 0.0, 1.0, 1.0)],
        };
        std::fs::write(
            dir.path().join("full.json"),
            serde_json::to_vec(&scene).unwrap(),
        )
        .unwrap();
        store.load_all().unwrap();
        assert_eq!(store.list(), vec!["full".to_string()]);
        assert_eq!(store.get("full").unwrap().slots.len(), 1);

        // a reload replaces the scene wholesale
        let replacement = Scene {
            scene_id: "full".into(),
            slots: vec![
                slot(SourceRef::Camera("cam0".into()), 0.0, 0.0, 0.5, 0.5),
                slot(SourceRef::Camera("cam1".into()), 0.5, 0.5, 0.5, 0.5),
            ],
        };
        std::fs::write(
            dir.path().join("full.json"),
            serde_json::to_vec(&replacement).unwrap(),
        )
        .unwrap();
        store.load_all().unwrap();
        assert_eq!(store.get("full").unwrap().slots.len(), 2);
    }

    #[test]
    fn test_invalid_scene_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
        let store = SceneStore::new(dir.path());
        assert_eq!(store.load_all().unwrap(), 0);
    }
}
