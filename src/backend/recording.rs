//! Recording backend for testing and tooling.
//!
//! This backend doesn't touch a GPU. Every resource creation hands out a fresh
//! handle and every command is appended to a log, so the pass ordering and the
//! data a frame uploads can be inspected. Buffer writes are kept in CPU memory
//! and timestamp queries produce synthetic, monotonically increasing ticks that
//! become readable after a configurable number of submitted frames.

use crate::backend::traits::*;
use crate::backend::types::*;
use std::collections::{HashMap, HashSet};
use std::ops::Range;

/// Command captured by [`RecordingBackend`]
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    BeginRenderPass {
        label: Option<String>,
        color_targets: Vec<TextureViewHandle>,
        depth_target: Option<TextureViewHandle>,
    },
    EndRenderPass,
    BeginComputePass {
        label: Option<String>,
    },
    EndComputePass,
    SetRenderPipeline(RenderPipelineHandle),
    SetComputePipeline(ComputePipelineHandle),
    SetBindGroup {
        index: u32,
        bind_group: BindGroupHandle,
    },
    SetVertexBuffer {
        slot: u32,
        buffer: BufferHandle,
    },
    SetIndexBuffer {
        buffer: BufferHandle,
    },
    SetViewport {
        width: f32,
        height: f32,
        min_depth: f32,
        max_depth: f32,
    },
    Draw {
        vertices: Range<u32>,
        instances: Range<u32>,
    },
    DrawIndexed {
        indices: Range<u32>,
        instances: Range<u32>,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    WriteTimestamp {
        query_set: QuerySetHandle,
        index: u32,
    },
}

struct PendingRead {
    buffer: BufferHandle,
    frames_left: Option<u32>,
}

/// GPU-less backend that records commands
pub struct RecordingBackend {
    width: u32,
    height: u32,
    readback_latency: u32,
    timestamps_supported: bool,
    next_id: u64,
    tick: u64,
    in_frame: bool,
    swapchain_view: TextureViewHandle,

    buffers: HashMap<u64, Vec<u8>>,
    textures: HashMap<u64, TextureDescriptor>,
    views: HashMap<u64, (TextureHandle, TextureViewDescriptor)>,
    bind_groups: HashSet<u64>,
    query_sets: HashMap<u64, Vec<u64>>,
    pending_reads: Vec<PendingRead>,
    stalled_reads: HashSet<BufferHandle>,
    failing_reads: HashSet<BufferHandle>,

    commands: Vec<RecordedCommand>,
    submitted: Vec<RecordedCommand>,
    frames_submitted: u64,
}

impl RecordingBackend {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            readback_latency: 1,
            timestamps_supported: true,
            next_id: 1,
            tick: 0,
            in_frame: false,
            swapchain_view: TextureViewHandle(0),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            views: HashMap::new(),
            bind_groups: HashSet::new(),
            query_sets: HashMap::new(),
            pending_reads: Vec::new(),
            stalled_reads: HashSet::new(),
            failing_reads: HashSet::new(),
            commands: Vec::new(),
            submitted: Vec::new(),
            frames_submitted: 0,
        }
    }

    /// Number of submitted frames a requested read waits before it is readable
    pub fn with_readback_latency(mut self, frames: u32) -> Self {
        self.readback_latency = frames;
        self
    }

    /// Pretend the device has no timestamp support
    pub fn without_timestamps(mut self) -> Self {
        self.timestamps_supported = false;
        self
    }

    fn next_handle(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn record(&mut self, command: RecordedCommand) {
        log::trace!("RecordingBackend: {:?}", command);
        self.commands.push(command);
    }

    /// Commands recorded since the last `begin_frame`
    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted
    }

    /// Commands of the last submitted frame
    pub fn submitted_commands(&self) -> &[RecordedCommand] {
        &self.submitted
    }

    /// Labels of every render and compute pass in the last submitted frame, in order
    pub fn submitted_pass_labels(&self) -> Vec<String> {
        self.submitted
            .iter()
            .filter_map(|cmd| match cmd {
                RecordedCommand::BeginRenderPass { label, .. }
                | RecordedCommand::BeginComputePass { label } => {
                    Some(label.clone().unwrap_or_default())
                }
                _ => None,
            })
            .collect()
    }

    /// Current CPU-side contents of a buffer
    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(&buffer.0).map(|b| b.as_slice())
    }

    pub fn texture_descriptor(&self, texture: TextureHandle) -> Option<&TextureDescriptor> {
        self.textures.get(&texture.0)
    }

    /// Hold back reads of `buffer` as if the GPU had not finished with it
    pub fn stall_reads(&mut self, buffer: BufferHandle, stalled: bool) {
        if stalled {
            self.stalled_reads.insert(buffer);
        } else {
            self.stalled_reads.remove(&buffer);
        }
    }

    /// Make the next completed read of `buffer` fail to map
    pub fn fail_next_read(&mut self, buffer: BufferHandle) {
        self.failing_reads.insert(buffer);
    }

    pub fn live_texture_count(&self) -> usize {
        self.textures.len()
    }

    pub fn live_view_count(&self) -> usize {
        self.views.len()
    }

    pub fn live_bind_group_count(&self) -> usize {
        self.bind_groups.len()
    }

    /// Descriptor of the live texture behind a view
    pub fn view_texture_descriptor(&self, view: TextureViewHandle) -> Option<&TextureDescriptor> {
        let (texture, _) = self.views.get(&view.0)?;
        self.textures.get(&texture.0)
    }
}

impl GraphicsBackend for RecordingBackend {
    fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.width = width;
            self.height = height;
        }
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn begin_frame(&mut self) -> BackendResult<FrameContext> {
        self.commands.clear();
        self.in_frame = true;
        let view = self.next_handle();
        self.swapchain_view = TextureViewHandle(view);
        Ok(FrameContext {
            swapchain_view: self.swapchain_view,
            width: self.width,
            height: self.height,
        })
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        self.in_frame = false;
        self.frames_submitted += 1;
        self.submitted = std::mem::take(&mut self.commands);

        let latency = self.readback_latency;
        for read in &mut self.pending_reads {
            read.frames_left = Some(match read.frames_left {
                None => latency,
                Some(n) => n.saturating_sub(1),
            });
        }
        Ok(())
    }

    fn swapchain_format(&self) -> TextureFormat {
        TextureFormat::Bgra8UnormSrgb
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        let id = self.next_handle();
        self.buffers.insert(id, vec![0; desc.size as usize]);
        log::trace!("RecordingBackend: creating buffer {:?} (size: {})", desc.label, desc.size);
        Ok(BufferHandle(id))
    }

    fn create_buffer_init(
        &mut self,
        desc: &BufferDescriptor,
        data: &[u8],
    ) -> BackendResult<BufferHandle> {
        let handle = self.create_buffer(desc)?;
        self.write_buffer(handle, 0, data);
        Ok(handle)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        if let Some(contents) = self.buffers.get_mut(&buffer.0) {
            let start = offset as usize;
            let end = start + data.len();
            if contents.len() < end {
                contents.resize(end, 0);
            }
            contents[start..end].copy_from_slice(data);
        }
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        if desc.width == 0 || desc.height == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "{:?}: zero-sized texture",
                desc.label
            )));
        }
        let id = self.next_handle();
        log::trace!(
            "RecordingBackend: creating texture {:?} ({}x{}x{})",
            desc.label,
            desc.width,
            desc.height,
            desc.depth_or_array_layers
        );
        self.textures.insert(id, desc.clone());
        Ok(TextureHandle(id))
    }

    fn create_texture_view(
        &mut self,
        texture: TextureHandle,
        desc: &TextureViewDescriptor,
    ) -> BackendResult<TextureViewHandle> {
        if !self.textures.contains_key(&texture.0) {
            return Err(BackendError::TextureCreationFailed("Texture not found".into()));
        }
        let id = self.next_handle();
        self.views.insert(id, (texture, desc.clone()));
        Ok(TextureViewHandle(id))
    }

    fn write_texture(&mut self, texture: TextureHandle, data: &[u8], width: u32, height: u32) {
        log::trace!(
            "RecordingBackend: writing {} bytes to texture {:?} ({}x{})",
            data.len(),
            texture,
            width,
            height
        );
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        log::trace!("RecordingBackend: creating sampler {:?}", desc.label);
        Ok(SamplerHandle(self.next_handle()))
    }

    fn create_bind_group_layout(
        &mut self,
        _entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        Ok(BindGroupLayoutHandle(self.next_handle()))
    }

    fn create_bind_group(
        &mut self,
        _layout: BindGroupLayoutHandle,
        _entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        let id = self.next_handle();
        self.bind_groups.insert(id);
        Ok(BindGroupHandle(id))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        log::trace!("RecordingBackend: creating render pipeline {:?}", desc.label);
        Ok(RenderPipelineHandle(self.next_handle()))
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<ComputePipelineHandle> {
        log::trace!("RecordingBackend: creating compute pipeline {:?}", desc.label);
        Ok(ComputePipelineHandle(self.next_handle()))
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        self.record(RecordedCommand::BeginRenderPass {
            label: desc.label.clone(),
            color_targets: desc.color_attachments.iter().map(|a| a.view).collect(),
            depth_target: desc.depth_stencil_attachment.as_ref().map(|d| d.view),
        });
    }

    fn end_render_pass(&mut self) {
        self.record(RecordedCommand::EndRenderPass);
    }

    fn begin_compute_pass(&mut self, label: Option<&str>) {
        self.record(RecordedCommand::BeginComputePass {
            label: label.map(|s| s.to_string()),
        });
    }

    fn end_compute_pass(&mut self) {
        self.record(RecordedCommand::EndComputePass);
    }

    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.record(RecordedCommand::SetRenderPipeline(pipeline));
    }

    fn set_compute_pipeline(&mut self, pipeline: ComputePipelineHandle) {
        self.record(RecordedCommand::SetComputePipeline(pipeline));
    }

    fn set_bind_group(&mut self, index: u32, bind_group: BindGroupHandle) {
        self.record(RecordedCommand::SetBindGroup { index, bind_group });
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, _offset: u64) {
        self.record(RecordedCommand::SetVertexBuffer { slot, buffer });
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, _offset: u64, _format: IndexFormat) {
        self.record(RecordedCommand::SetIndexBuffer { buffer });
    }

    fn set_viewport(&mut self, _x: f32, _y: f32, width: f32, height: f32, min_depth: f32, max_depth: f32) {
        self.record(RecordedCommand::SetViewport {
            width,
            height,
            min_depth,
            max_depth,
        });
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        self.record(RecordedCommand::Draw { vertices, instances });
    }

    fn draw_indexed(&mut self, indices: Range<u32>, _base_vertex: i32, instances: Range<u32>) {
        self.record(RecordedCommand::DrawIndexed { indices, instances });
    }

    fn dispatch_compute(&mut self, x: u32, y: u32, z: u32) {
        self.record(RecordedCommand::Dispatch { x, y, z });
    }

    fn timestamp_period(&self) -> Option<f32> {
        self.timestamps_supported.then_some(1.0)
    }

    fn create_query_set(&mut self, count: u32) -> BackendResult<QuerySetHandle> {
        let id = self.next_handle();
        self.query_sets.insert(id, vec![0; count as usize]);
        Ok(QuerySetHandle(id))
    }

    fn write_timestamp(&mut self, query_set: QuerySetHandle, index: u32) {
        // 1000 ticks per timestamp: every timed scope measures exactly 1 microsecond
        self.tick += 1000;
        let tick = self.tick;
        if let Some(slot) = self
            .query_sets
            .get_mut(&query_set.0)
            .and_then(|set| set.get_mut(index as usize))
        {
            *slot = tick;
        }
        self.record(RecordedCommand::WriteTimestamp { query_set, index });
    }

    fn resolve_query_set(
        &mut self,
        query_set: QuerySetHandle,
        queries: Range<u32>,
        destination: BufferHandle,
        offset: u64,
    ) {
        let Some(set) = self.query_sets.get(&query_set.0) else {
            return;
        };
        let start = (queries.start as usize).min(set.len());
        let end = (queries.end as usize).min(set.len());
        let bytes: Vec<u8> = bytemuck::cast_slice(&set[start..end]).to_vec();
        self.write_buffer(destination, offset, &bytes);
    }

    fn copy_buffer_to_buffer(
        &mut self,
        source: BufferHandle,
        source_offset: u64,
        destination: BufferHandle,
        destination_offset: u64,
        size: u64,
    ) {
        let Some(src) = self.buffers.get(&source.0) else {
            return;
        };
        let start = source_offset as usize;
        let end = (start + size as usize).min(src.len());
        let bytes = src[start..end].to_vec();
        self.write_buffer(destination, destination_offset, &bytes);
    }

    fn request_buffer_read(&mut self, buffer: BufferHandle) {
        self.pending_reads.push(PendingRead {
            buffer,
            frames_left: None,
        });
    }

    fn try_read_buffer(&mut self, buffer: BufferHandle) -> BackendResult<Option<Vec<u8>>> {
        if self.stalled_reads.contains(&buffer) {
            return Ok(None);
        }
        let Some(position) = self
            .pending_reads
            .iter()
            .position(|r| r.buffer == buffer && r.frames_left == Some(0))
        else {
            return Ok(None);
        };
        self.pending_reads.remove(position);
        if self.failing_reads.remove(&buffer) {
            return Err(BackendError::ReadbackFailed(format!("{:?} failed to map", buffer)));
        }
        Ok(self.buffers.get(&buffer.0).cloned())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(&texture.0);
        self.views.retain(|_, (t, _)| *t != texture);
    }

    fn destroy_bind_group(&mut self, bind_group: BindGroupHandle) {
        self.bind_groups.remove(&bind_group.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readback_desc() -> BufferDescriptor {
        BufferDescriptor {
            label: Some("readback".into()),
            size: 16,
            usage: BufferUsage::MAP_READ | BufferUsage::COPY_DST,
            mapped_at_creation: false,
        }
    }

    #[test]
    fn test_commands_move_to_submitted_on_end_frame() {
        let mut backend = RecordingBackend::new(64, 64);
        backend.begin_frame().unwrap();
        backend.begin_compute_pass(Some("cull"));
        backend.dispatch_compute(1, 2, 1);
        backend.end_compute_pass();
        backend.end_frame().unwrap();

        assert!(backend.commands().is_empty());
        assert_eq!(backend.submitted_pass_labels(), vec!["cull".to_string()]);
        assert_eq!(backend.frames_submitted(), 1);
    }

    #[test]
    fn test_buffer_write_is_visible() {
        let mut backend = RecordingBackend::new(8, 8);
        let buffer = backend
            .create_buffer_init(&readback_desc(), &[1, 2, 3, 4])
            .unwrap();
        backend.write_buffer(buffer, 2, &[9, 9]);
        assert_eq!(&backend.buffer_contents(buffer).unwrap()[..4], &[1, 2, 9, 9]);
    }

    #[test]
    fn test_read_is_not_ready_until_latency_elapsed() {
        let mut backend = RecordingBackend::new(8, 8).with_readback_latency(1);
        let buffer = backend.create_buffer(&readback_desc()).unwrap();

        backend.begin_frame().unwrap();
        backend.request_buffer_read(buffer);
        assert!(backend.try_read_buffer(buffer).unwrap().is_none());
        backend.end_frame().unwrap();
        assert!(backend.try_read_buffer(buffer).unwrap().is_none());

        backend.begin_frame().unwrap();
        backend.end_frame().unwrap();
        assert!(backend.try_read_buffer(buffer).unwrap().is_some());
        // Consumed
        assert!(backend.try_read_buffer(buffer).unwrap().is_none());
    }

    #[test]
    fn test_failed_read_is_reported_once() {
        let mut backend = RecordingBackend::new(8, 8).with_readback_latency(0);
        let buffer = backend.create_buffer(&readback_desc()).unwrap();
        backend.fail_next_read(buffer);

        backend.begin_frame().unwrap();
        backend.request_buffer_read(buffer);
        backend.end_frame().unwrap();
        assert!(matches!(
            backend.try_read_buffer(buffer),
            Err(BackendError::ReadbackFailed(_))
        ));
        // The request is dropped with the failure
        assert!(backend.try_read_buffer(buffer).unwrap().is_none());
    }

    #[test]
    fn test_destroying_texture_drops_its_views() {
        let mut backend = RecordingBackend::new(8, 8);
        let desc = TextureDescriptor {
            width: 4,
            height: 4,
            ..Default::default()
        };
        let texture = backend.create_texture(&desc).unwrap();
        let other = backend.create_texture(&desc).unwrap();
        let view = backend
            .create_texture_view(texture, &TextureViewDescriptor::default())
            .unwrap();
        backend
            .create_texture_view(other, &TextureViewDescriptor::default())
            .unwrap();
        let layout = backend.create_bind_group_layout(&[]).unwrap();
        let group = backend
            .create_bind_group(layout, &[(0, BindGroupEntry::Texture(view))])
            .unwrap();
        assert_eq!(backend.live_view_count(), 2);
        assert_eq!(backend.live_bind_group_count(), 1);

        backend.destroy_texture(texture);
        backend.destroy_bind_group(group);
        assert_eq!(backend.live_view_count(), 1);
        assert_eq!(backend.live_bind_group_count(), 0);
        assert!(backend.view_texture_descriptor(view).is_none());
    }

    #[test]
    fn test_zero_sized_texture_fails() {
        let mut backend = RecordingBackend::new(8, 8);
        let desc = TextureDescriptor {
            width: 0,
            ..Default::default()
        };
        assert!(backend.create_texture(&desc).is_err());
    }
}
