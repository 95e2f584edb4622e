//! Live video mixer
//!
//! Scene presets, the program composition engine and the broadcast
//! graphics renderer.

pub mod engine;
pub mod graphics;
pub mod scene;

pub use engine::{MixerEngine, MixerOutputState, MixerState, TransitionStatus};
pub use graphics::{GraphicsRenderer, OverlayAnimation, OverlaySurface};
pub use scene::{Scene, SceneStore, Slot, Transition, WipeDirection};
