//! Meshes and materials shared by scene models

mod material;
mod mesh;

pub use material::*;
pub use mesh::*;
