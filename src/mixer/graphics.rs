//! Broadcast graphics renderer
//!
//! Raster overlays composited into a single RGBA layer at program
//! resolution. Overlays are double-buffered: `update` draws into the back
//! surface and swaps it in whole, so a visible graphic never tears. The
//! visual content itself comes from outside as raw RGBA tiles; this module
//! owns placement, z-order, visibility and the enter/live/exit animation
//! state machine.

use std::collections::HashMap;

use serde::Serialize;

use crate::config::Resolution;
use crate::error::{AppError, Result};

/// Overlay animation state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayAnimation {
    Enter,
    Live,
    Exit,
}

/// An RGBA tile with a position on the program canvas
#[derive(Debug, Clone, PartialEq)]
pub struct OverlaySurface {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Straight-alpha RGBA, row-major, `width * height * 4` bytes
    pub pixels: Vec<u8>,
}

impl OverlaySurface {
    pub fn is_consistent(&self) -> bool {
        self.pixels.len() == (self.width * self.height * 4) as usize
    }
}

struct Overlay {
    z: i32,
    visible: bool,
    animation: OverlayAnimation,
    front: Option<OverlaySurface>,
    back: Option<OverlaySurface>,
}

/// Composites overlays into one RGBA frame
pub struct GraphicsRenderer {
    canvas: Resolution,
    overlays: HashMap<String, Overlay>,
    frame: Vec<u8>,
    dirty: bool,
}

impl GraphicsRenderer {
    pub fn new(canvas: Resolution) -> Self {
        let len = (canvas.width * canvas.height * 4) as usize;
        Self {
            canvas,
            overlays: HashMap::new(),
            frame: vec![0u8; len],
            dirty: false,
        }
    }

    /// Create an overlay; replaces any previous one with the same id
    pub fn create(&mut self, id: &str, z: i32) {
        self.overlays.insert(
            id.to_string(),
            Overlay {
                z,
                visible: false,
                animation: OverlayAnimation::Enter,
                front: None,
                back: None,
            },
        );
    }

    pub fn exists(&self, id: &str) -> bool {
        self.overlays.contains_key(id)
    }

    /// Stage new content for an overlay and swap it in atomically
    pub fn update(&mut self, id: &str, surface: OverlaySurface) -> Result<()> {
        if !surface.is_consistent() {
            return Err(AppError::Internal(format!(
                "overlay '{}' surface size mismatch",
                id
            )));
        }
        let overlay = self
            .overlays
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("overlay {}", id)))?;
        overlay.back = Some(surface);
        // swap: the back surface becomes visible in one step
        overlay.front = overlay.back.take();
        if overlay.visible {
            self.dirty = true;
        }
        Ok(())
    }

    pub fn set_z(&mut self, id: &str, z: i32) {
        if let Some(overlay) = self.overlays.get_mut(id) {
            if overlay.z != z {
                overlay.z = z;
                if overlay.visible {
                    self.dirty = true;
                }
            }
        }
    }

    /// Toggle visibility; creates the overlay on first reference
    pub fn set_visible(&mut self, id: &str, visible: bool) {
        let overlay = self.overlays.entry(id.to_string()).or_insert(Overlay {
            z: 0,
            visible: false,
            animation: OverlayAnimation::Enter,
            front: None,
            back: None,
        });
        if overlay.visible != visible {
            overlay.visible = visible;
            overlay.animation = if visible {
                OverlayAnimation::Live
            } else {
                OverlayAnimation::Exit
            };
            self.dirty = true;
        }
    }

    pub fn set_animation(&mut self, id: &str, animation: OverlayAnimation) {
        if let Some(overlay) = self.overlays.get_mut(id) {
            overlay.animation = animation;
        }
    }

    pub fn delete(&mut self, id: &str) {
        if let Some(overlay) = self.overlays.remove(id) {
            if overlay.visible {
                self.dirty = true;
            }
        }
    }

    /// Ids of currently visible overlays, sorted
    pub fn visible_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .overlays
            .iter()
            .filter(|(_, o)| o.visible)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Recomposite if needed and return the RGBA layer
    pub fn render(&mut self) -> &[u8] {
        if self.dirty {
            self.composite();
            self.dirty = false;
        }
        &self.frame
    }

    fn composite(&mut self) {
        self.frame.fill(0);

        let mut visible: Vec<&Overlay> =
            self.overlays.values().filter(|o| o.visible).collect();
        visible.sort_by_key(|o| o.z);

        for overlay in visible {
            let Some(surface) = &overlay.front else {
                continue;
            };
            blend_surface(&mut self.frame, self.canvas, surface);
        }
    }
}

/// Source-over blend of a surface onto the frame, clipped to the canvas
fn blend_surface(frame: &mut [u8], canvas: Resolution, surface: &OverlaySurface) {
    let cw = canvas.width as usize;
    let ch = canvas.height as usize;
    for row in 0..surface.height as usize {
        let fy = surface.y as usize + row;
        if fy >= ch {
            break;
        }
        for col in 0..surface.width as usize {
            let fx = surface.x as usize + col;
            if fx >= cw {
                break;
            }
            let src = (row * surface.width as usize + col) * 4;
            let dst = (fy * cw + fx) * 4;
            let sa = surface.pixels[src + 3] as u32;
            if sa == 0 {
                continue;
            }
            let da = frame[dst + 3] as u32;
            let out_a = sa + da * (255 - sa) / 255;
            for c in 0..3 {
                let sc = surface.pixels[src + c] as u32;
                let dc = frame[dst + c] as u32;
                frame[dst + c] = ((sc * sa + dc * da * (255 - sa) / 255) / out_a.max(1)) as u8;
            }
            frame[dst + 3] = out_a as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(x: u32, y: u32, w: u32, h: u32, rgba: [u8; 4]) -> OverlaySurface {
        OverlaySurface {
            x,
            y,
            width: w,
            height: h,
            pixels: rgba.repeat((w * h) as usize),
        }
    }

    fn px(frame: &[u8], canvas: Resolution, x: usize, y: usize) -> [u8; 4] {
        let i = (y * canvas.width as usize + x) * 4;
        [frame[i], frame[i + 1], frame[i + 2], frame[i + 3]]
    }

    #[test]
    fn test_hidden_overlay_not_rendered() {
        let canvas = Resolution::new(16, 16);
        let mut r = GraphicsRenderer::new(canvas);
        r.create("a", 0);
        r.update("a", solid(0, 0, 4, 4, [255, 0, 0, 255])).unwrap();
        let frame = r.render().to_vec();
        assert_eq!(px(&frame, canvas, 0, 0), [0, 0, 0, 0]);

        r.set_visible("a", true);
        let frame = r.render().to_vec();
        assert_eq!(px(&frame, canvas, 0, 0), [255, 0, 0, 255]);
    }

    #[test]
    fn test_z_order() {
        let canvas = Resolution::new(8, 8);
        let mut r = GraphicsRenderer::new(canvas);
        r.create("below", 0);
        r.create("above", 10);
        r.update("below", solid(0, 0, 4, 4, [255, 0, 0, 255])).unwrap();
        r.update("above", solid(0, 0, 4, 4, [0, 255, 0, 255])).unwrap();
        r.set_visible("below", true);
        r.set_visible("above", true);
        let frame = r.render().to_vec();
        assert_eq!(px(&frame, canvas, 0, 0), [0, 255, 0, 255]);
    }

    #[test]
    fn test_update_rejects_inconsistent_surface() {
        let mut r = GraphicsRenderer::new(Resolution::new(8, 8));
        r.create("a", 0);
        let bad = OverlaySurface {
            x: 0,
            y: 0,
            width: 4,
            height: 4,
            pixels: vec![0; 7],
        };
        assert!(r.update("a", bad).is_err());
    }

    #[test]
    fn test_update_unknown_overlay_is_not_found() {
        let mut r = GraphicsRenderer::new(Resolution::new(8, 8));
        assert!(matches!(
            r.update("ghost", solid(0, 0, 1, 1, [0, 0, 0, 255])),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn test_set_visible_creates_implicitly() {
        let mut r = GraphicsRenderer::new(Resolution::new(8, 8));
        r.set_visible("scoreboard", true);
        assert!(r.exists("scoreboard"));
        assert_eq!(r.visible_ids(), vec!["scoreboard".to_string()]);
        r.set_visible("scoreboard", false);
        assert!(r.visible_ids().is_empty());
    }

    #[test]
    fn test_surface_clipped_at_canvas_edge() {
        let canvas = Resolution::new(4, 4);
        let mut r = GraphicsRenderer::new(canvas);
        r.create("a", 0);
        r.update("a", solid(2, 2, 4, 4, [255, 255, 255, 255])).unwrap();
        r.set_visible("a", true);
        // must not panic; clipped to canvas
        let frame = r.render().to_vec();
        assert_eq!(px(&frame, canvas, 3, 3), [255, 255, 255, 255]);
    }

    #[test]
    fn test_delete_clears_layer() {
        let canvas = Resolution::new(4, 4);
        let mut r = GraphicsRenderer::new(canvas);
        r.create("a", 0);
        r.update("a", solid(0, 0, 2, 2, [9, 9, 9, 255])).unwrap();
        r.set_visible("a", true);
        r.render();
        r.delete("a");
        let frame = r.render().to_vec();
        assert_eq!(px(&frame, canvas, 0, 0), [0, 0, 0, 0]);
    }
}
