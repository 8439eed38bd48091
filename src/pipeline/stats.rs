//! Per-frame draw statistics

/// Counters collected while a frame is recorded, reset at frame start
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub models_drawn: u32,
    pub instances_drawn: u32,
    pub draw_calls: u32,
    pub triangles_drawn: u64,
    pub scene_visits: u32,
    pub lights_gathered: u32,
    pub shadow_maps_rendered: u32,
    pub particles_drawn: u32,
}

impl FrameStats {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Record one instanced draw of a mesh
    pub fn record_draw(&mut self, index_count: u32, instances: u32) {
        self.draw_calls += 1;
        self.models_drawn += 1;
        self.instances_drawn += instances;
        self.triangles_drawn += (index_count / 3) as u64 * instances as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_reset() {
        let mut stats = FrameStats::default();
        stats.record_draw(36, 4);
        stats.record_draw(6, 1);
        assert_eq!(stats.draw_calls, 2);
        assert_eq!(stats.instances_drawn, 5);
        assert_eq!(stats.triangles_drawn, 50);
        stats.reset();
        assert_eq!(stats, FrameStats::default());
    }
}
