//! Backend abstraction layer
//!
//! Passes record work through [`GraphicsBackend`]; [`wgpu_backend::WgpuBackend`]
//! drives a real device and [`recording::RecordingBackend`] records commands
//! without one.

pub mod recording;
pub mod shader;
pub mod traits;
pub mod types;
pub mod wgpu_backend;

pub use recording::{RecordedCommand, RecordingBackend};
pub use traits::*;
pub use types::*;
