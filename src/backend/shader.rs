//! WGSL validation
//!
//! Every program the renderer needs is parsed and validated with naga before a
//! pipeline is created from it, so a broken shader aborts construction with a
//! readable message on every backend instead of surfacing as a device error
//! on the first frame.

use crate::backend::traits::{BackendError, BackendResult};
use crate::backend::types::ShaderStage;

/// Parse and validate `source`, then check that each entry point exists with
/// the expected stage.
pub fn validate_wgsl(
    label: &str,
    source: &str,
    entry_points: &[(&str, ShaderStage)],
) -> BackendResult<()> {
    let module = naga::front::wgsl::parse_str(source).map_err(|e| {
        BackendError::ShaderCreationFailed(format!(
            "{label}: WGSL parse error: {}",
            e.emit_to_string(source)
        ))
    })?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    validator.validate(&module).map_err(|e| {
        BackendError::ShaderCreationFailed(format!("{label}: validation error: {e}"))
    })?;

    for (name, stage) in entry_points {
        let naga_stage = match stage {
            ShaderStage::Vertex => naga::ShaderStage::Vertex,
            ShaderStage::Fragment => naga::ShaderStage::Fragment,
            ShaderStage::Compute => naga::ShaderStage::Compute,
        };
        let found = module
            .entry_points
            .iter()
            .any(|ep| ep.name == *name && ep.stage == naga_stage);
        if !found {
            return Err(BackendError::ShaderCreationFailed(format!(
                "{label}: entry point '{name}' ({stage:?}) not found"
            )));
        }
    }

    log::debug!("Validated shader '{}'", label);
    Ok(())
}

/// Validate a render program exposing `vs_main` and optionally `fs_main`
pub fn validate_render_program(label: &str, source: &str, has_fragment: bool) -> BackendResult<()> {
    if has_fragment {
        validate_wgsl(
            label,
            source,
            &[("vs_main", ShaderStage::Vertex), ("fs_main", ShaderStage::Fragment)],
        )
    } else {
        validate_wgsl(label, source, &[("vs_main", ShaderStage::Vertex)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_compute_shader() {
        let source = r#"
@group(0) @binding(0) var<storage, read_write> data: array<u32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    data[id.x] = id.x;
}
"#;
        assert!(validate_wgsl("test", source, &[("main", ShaderStage::Compute)]).is_ok());
    }

    #[test]
    fn test_parse_error_is_reported() {
        let err = validate_wgsl("broken", "fn main( {", &[]).unwrap_err();
        match err {
            BackendError::ShaderCreationFailed(msg) => assert!(msg.starts_with("broken")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_missing_entry_point() {
        let source = r#"
@compute @workgroup_size(1)
fn other() {}
"#;
        let err = validate_wgsl("missing", source, &[("main", ShaderStage::Compute)]);
        assert!(matches!(err, Err(BackendError::ShaderCreationFailed(_))));
    }

    #[test]
    fn test_wrong_stage() {
        let source = r#"
@compute @workgroup_size(1)
fn main() {}
"#;
        let err = validate_wgsl("stage", source, &[("main", ShaderStage::Fragment)]);
        assert!(err.is_err());
    }
}
