//! Post-processing effects

mod bloom;
mod gaussian_blur;

pub use bloom::{bloom_size, BloomInputs, BloomPass};
pub use gaussian_blur::{compute_blur_samples, compute_gaussian, GaussianBlur};
