//! Shadow map slot cache
//!
//! A fixed pool of shadow map array layers handed out to lights each frame.
//! Lights keep their layer across frames while they stay in use; when demand
//! exceeds the pool, the least recently used retained layer is taken over.

mod cache;

pub use cache::{ShadowEntry, ShadowSlotCache, ShadowStamp};
