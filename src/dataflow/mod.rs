//! Dataflow ports connecting render passes
//!
//! A pass owns its output ports and `set`s them; downstream passes hold input
//! ports wired to those outputs with [`Port::bind_from`] and poll
//! [`Port::updated`] to decide whether GPU resources need rebuilding.

mod port;

pub use port::{Port, PortError};
