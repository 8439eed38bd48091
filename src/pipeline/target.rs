//! Render targets shared between passes through ports

use crate::backend::traits::{BackendResult, GraphicsBackend, TextureHandle, TextureViewHandle};
use crate::backend::types::{
    TextureDescriptor, TextureDimension, TextureFormat, TextureUsage, TextureViewDescriptor,
};

/// Output surface size in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn aspect(&self) -> f32 {
        self.width.max(1) as f32 / self.height.max(1) as f32
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Number of tiles of `tile_size` pixels needed to cover the viewport
    pub fn tiles(&self, tile_size: u32) -> (u32, u32) {
        let tile_size = tile_size.max(1);
        (
            self.width.div_ceil(tile_size),
            self.height.div_ceil(tile_size),
        )
    }
}

/// A 2D texture and the view passes bind it through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTarget {
    pub texture: TextureHandle,
    pub view: TextureViewHandle,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

impl RenderTarget {
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        label: &str,
        width: u32,
        height: u32,
        format: TextureFormat,
        usage: TextureUsage,
    ) -> BackendResult<Self> {
        let texture = backend.create_texture(&TextureDescriptor {
            label: Some(label.to_string()),
            width: width.max(1),
            height: height.max(1),
            format,
            usage,
            ..Default::default()
        })?;
        let view = backend.create_texture_view(texture, &TextureViewDescriptor::default())?;
        Ok(Self {
            texture,
            view,
            width: width.max(1),
            height: height.max(1),
            format,
        })
    }

    pub fn destroy(&self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_texture(self.texture);
    }
}

/// Layered shadow map storage, one layer per slot of the shadow cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowMapArray {
    pub texture: TextureHandle,
    /// All layers, for sampling
    pub array_view: TextureViewHandle,
    /// One view per layer, for rendering into a slot
    pub layer_views: Vec<TextureViewHandle>,
    pub depth: RenderTarget,
    pub size: u32,
}

impl ShadowMapArray {
    pub const FORMAT: TextureFormat = TextureFormat::Rg32Float;

    pub fn new(backend: &mut dyn GraphicsBackend, layers: u32, size: u32) -> BackendResult<Self> {
        let layers = layers.max(1);
        let size = size.max(1);
        let texture = backend.create_texture(&TextureDescriptor {
            label: Some("Shadow Maps".to_string()),
            width: size,
            height: size,
            depth_or_array_layers: layers,
            dimension: TextureDimension::D2Array,
            mip_levels: 1,
            format: Self::FORMAT,
            usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
        })?;
        let array_view = backend.create_texture_view(texture, &TextureViewDescriptor::array())?;
        let layer_views = (0..layers)
            .map(|layer| backend.create_texture_view(texture, &TextureViewDescriptor::layer(layer)))
            .collect::<BackendResult<Vec<_>>>()?;
        let depth = RenderTarget::new(
            backend,
            "Shadow Depth",
            size,
            size,
            TextureFormat::Depth32Float,
            TextureUsage::RENDER_ATTACHMENT,
        )?;
        log::debug!("Allocated {} shadow maps of {}x{}", layers, size, size);
        Ok(Self {
            texture,
            array_view,
            layer_views,
            depth,
            size,
        })
    }

    pub fn layers(&self) -> u32 {
        self.layer_views.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBackend;

    #[test]
    fn test_tiles_round_up() {
        assert_eq!(Viewport::new(640, 480).tiles(16), (40, 30));
        assert_eq!(Viewport::new(641, 481).tiles(16), (41, 31));
        assert_eq!(Viewport::new(1, 1).tiles(16), (1, 1));
    }

    #[test]
    fn test_shadow_map_array_has_view_per_layer() {
        let mut backend = RecordingBackend::new(8, 8);
        let maps = ShadowMapArray::new(&mut backend, 4, 128).unwrap();
        assert_eq!(maps.layers(), 4);
        let desc = backend.texture_descriptor(maps.texture).unwrap();
        assert_eq!(desc.depth_or_array_layers, 4);
        assert_eq!(desc.format, TextureFormat::Rg32Float);
    }
}
