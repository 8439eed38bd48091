//! Crate-level error type

use crate::backend::BackendError;
use crate::dataflow::PortError;
use thiserror::Error;

/// Errors surfaced by renderer construction and frame submission
///
/// Quality degradations (shadow slot exhaustion, per-tile light overflow,
/// pending timer queries) are absorbed inside the passes and never show up here.
#[derive(Error, Debug)]
pub enum RendererError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error("Shader '{name}' failed: {message}")]
    Shader { name: String, message: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type RendererResult<T> = Result<T, RendererError>;

impl RendererError {
    /// Wrap a shader validation failure under the program's logical name
    pub fn shader(name: &str, err: BackendError) -> Self {
        match err {
            BackendError::ShaderCreationFailed(message) => RendererError::Shader {
                name: name.to_string(),
                message,
            },
            other => RendererError::Backend(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shader_error_keeps_name() {
        let err = RendererError::shader("tile cull", BackendError::ShaderCreationFailed("bad".into()));
        assert_eq!(err.to_string(), "Shader 'tile cull' failed: bad");
    }

    #[test]
    fn test_port_error_converts() {
        let err: RendererError = PortError::NotProduced { generation: 0 }.into();
        assert!(matches!(err, RendererError::Port(PortError::NotProduced { .. })));
    }
}
