//! Non-blocking GPU pass timing
//!
//! Each frame writes a timestamp before and after every pass into one query
//! set from a small ring. Results are resolved into a buffer, copied to a
//! mappable buffer and read back frames later. Polling never waits: until a
//! newer frame completes, [`GpuTimer::results`] keeps returning the last one.

use crate::backend::traits::{BackendResult, BufferHandle, GraphicsBackend, QuerySetHandle};
use crate::backend::types::{BufferDescriptor, BufferUsage};

/// Passes timed per frame at most
pub const MAX_TIMED_SCOPES: u32 = 32;

/// Elapsed GPU time of one pass
#[derive(Debug, Clone, PartialEq)]
pub struct GpuTimeResult {
    pub name: String,
    pub time_ms: f32,
}

#[derive(Debug)]
struct TimerFrame {
    query_set: QuerySetHandle,
    resolve: BufferHandle,
    readback: BufferHandle,
    names: Vec<String>,
    /// Order in which this query set was last handed to a frame
    sequence: u64,
    in_flight: bool,
}

#[derive(Debug)]
pub struct GpuTimer {
    frames: Vec<TimerFrame>,
    /// Nanoseconds per tick
    period: f32,
    current: Option<usize>,
    next: usize,
    open_scope: bool,
    frames_started: u64,
    results: Vec<GpuTimeResult>,
    results_sequence: u64,
}

impl GpuTimer {
    /// Create `frame_count` query sets; a device without timestamp queries
    /// gets a timer that records nothing
    pub fn new(backend: &mut dyn GraphicsBackend, frame_count: u32) -> BackendResult<Self> {
        let mut timer = Self {
            frames: Vec::new(),
            period: 0.0,
            current: None,
            next: 0,
            open_scope: false,
            frames_started: 0,
            results: Vec::new(),
            results_sequence: 0,
        };

        let Some(period) = backend.timestamp_period() else {
            log::warn!("Device has no timestamp queries, GPU pass timing disabled");
            return Ok(timer);
        };
        timer.period = period;

        let bytes = MAX_TIMED_SCOPES as u64 * 2 * 8;
        for _ in 0..frame_count.max(1) {
            let query_set = backend.create_query_set(MAX_TIMED_SCOPES * 2)?;
            let resolve = backend.create_buffer(&BufferDescriptor {
                label: Some("Timestamp Resolve".into()),
                size: bytes,
                usage: BufferUsage::QUERY_RESOLVE | BufferUsage::COPY_SRC,
                mapped_at_creation: false,
            })?;
            let readback = backend.create_buffer(&BufferDescriptor {
                label: Some("Timestamp Readback".into()),
                size: bytes,
                usage: BufferUsage::MAP_READ | BufferUsage::COPY_DST,
                mapped_at_creation: false,
            })?;
            timer.frames.push(TimerFrame {
                query_set,
                resolve,
                readback,
                names: Vec::new(),
                sequence: 0,
                in_flight: false,
            });
        }
        Ok(timer)
    }

    pub fn is_enabled(&self) -> bool {
        !self.frames.is_empty()
    }

    /// Collect finished frames and pick a free query set for this frame
    pub fn begin_frame(&mut self, backend: &mut dyn GraphicsBackend) {
        self.poll(backend);

        self.current = None;
        self.open_scope = false;
        if self.frames.is_empty() {
            return;
        }
        let index = self.next;
        if self.frames[index].in_flight {
            // Every query set is still waiting on the GPU; skip timing this frame
            log::trace!("GPU timer ring full, frame not timed");
            return;
        }
        self.frames_started += 1;
        self.frames[index].names.clear();
        self.frames[index].sequence = self.frames_started;
        self.current = Some(index);
        self.next = (index + 1) % self.frames.len();
    }

    pub fn begin_scope(&mut self, backend: &mut dyn GraphicsBackend, name: &str) {
        let Some(frame) = self.current.map(|i| &mut self.frames[i]) else {
            return;
        };
        if self.open_scope || frame.names.len() as u32 >= MAX_TIMED_SCOPES {
            return;
        }
        let query = frame.names.len() as u32 * 2;
        backend.write_timestamp(frame.query_set, query);
        frame.names.push(name.to_string());
        self.open_scope = true;
    }

    pub fn end_scope(&mut self, backend: &mut dyn GraphicsBackend) {
        let Some(frame) = self.current.map(|i| &self.frames[i]) else {
            return;
        };
        if !self.open_scope {
            return;
        }
        let query = (frame.names.len() as u32 - 1) * 2 + 1;
        backend.write_timestamp(frame.query_set, query);
        self.open_scope = false;
    }

    /// Resolve this frame's queries and schedule the readback
    pub fn end_frame(&mut self, backend: &mut dyn GraphicsBackend) {
        let Some(index) = self.current.take() else {
            return;
        };
        let frame = &mut self.frames[index];
        if frame.names.is_empty() {
            return;
        }
        let count = frame.names.len() as u32 * 2;
        backend.resolve_query_set(frame.query_set, 0..count, frame.resolve, 0);
        backend.copy_buffer_to_buffer(frame.resolve, 0, frame.readback, 0, count as u64 * 8);
        backend.request_buffer_read(frame.readback);
        frame.in_flight = true;
    }

    fn poll(&mut self, backend: &mut dyn GraphicsBackend) {
        for frame in self.frames.iter_mut().filter(|f| f.in_flight) {
            let bytes = match backend.try_read_buffer(frame.readback) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("GPU timestamps of frame {} lost: {}", frame.sequence, e);
                    frame.in_flight = false;
                    continue;
                }
            };
            frame.in_flight = false;
            if frame.sequence < self.results_sequence {
                continue;
            }

            let ticks: Vec<u64> = bytes
                .chunks_exact(8)
                .take(frame.names.len() * 2)
                .map(|chunk| {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(chunk);
                    u64::from_le_bytes(raw)
                })
                .collect();
            self.results = frame
                .names
                .iter()
                .zip(ticks.chunks_exact(2))
                .map(|(name, pair)| GpuTimeResult {
                    name: name.clone(),
                    time_ms: pair[1].saturating_sub(pair[0]) as f32 * self.period / 1.0e6,
                })
                .collect();
            self.results_sequence = frame.sequence;
        }
    }

    /// Timings of the newest frame read back so far
    pub fn results(&self) -> &[GpuTimeResult] {
        &self.results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBackend;

    fn timed_frame(timer: &mut GpuTimer, backend: &mut RecordingBackend, names: &[&str]) {
        backend.begin_frame().unwrap();
        timer.begin_frame(backend);
        for name in names {
            timer.begin_scope(backend, name);
            timer.end_scope(backend);
        }
        timer.end_frame(backend);
        backend.end_frame().unwrap();
    }

    #[test]
    fn test_results_arrive_after_latency() {
        let mut backend = RecordingBackend::new(4, 4).with_readback_latency(1);
        let mut timer = GpuTimer::new(&mut backend, 4).unwrap();
        assert!(timer.is_enabled());

        timed_frame(&mut timer, &mut backend, &["gbuffer", "lightsource"]);
        assert!(timer.results().is_empty());
        timed_frame(&mut timer, &mut backend, &["gbuffer", "lightsource"]);
        assert!(timer.results().is_empty());

        // Third frame polls the first one
        timed_frame(&mut timer, &mut backend, &["gbuffer", "lightsource"]);
        let names: Vec<&str> = timer.results().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["gbuffer", "lightsource"]);
        assert!(timer.results().iter().all(|r| r.time_ms > 0.0));
    }

    #[test]
    fn test_stale_results_are_kept_while_waiting() {
        let mut backend = RecordingBackend::new(4, 4).with_readback_latency(1);
        let mut timer = GpuTimer::new(&mut backend, 2).unwrap();
        for _ in 0..3 {
            timed_frame(&mut timer, &mut backend, &["pass"]);
        }
        let first = timer.results().to_vec();
        assert_eq!(first.len(), 1);

        // A frame with no scopes leaves the previous results in place
        timed_frame(&mut timer, &mut backend, &[]);
        assert_eq!(timer.results(), first.as_slice());
    }

    fn result_names(timer: &GpuTimer) -> Vec<&str> {
        timer.results().iter().map(|r| r.name.as_str()).collect()
    }

    #[test]
    fn test_older_frame_finishing_late_does_not_replace_newer() {
        let mut backend = RecordingBackend::new(4, 4).with_readback_latency(1);
        let mut timer = GpuTimer::new(&mut backend, 2).unwrap();
        let second = timer.frames[1].readback;

        timed_frame(&mut timer, &mut backend, &["frame 1"]);
        backend.stall_reads(second, true);
        timed_frame(&mut timer, &mut backend, &["frame 2"]);
        // Frame 1 is read back and its query set reused by frame 3
        timed_frame(&mut timer, &mut backend, &["frame 3"]);
        assert_eq!(result_names(&timer), ["frame 1"]);
        // Both query sets are in flight, frame 4 goes untimed
        timed_frame(&mut timer, &mut backend, &["frame 4"]);

        // Frames 2 and 3 both complete before the next poll
        backend.stall_reads(second, false);
        timed_frame(&mut timer, &mut backend, &["frame 5"]);
        assert_eq!(result_names(&timer), ["frame 3"]);
    }

    #[test]
    fn test_failed_readback_frees_its_query_set() {
        let mut backend = RecordingBackend::new(4, 4).with_readback_latency(1);
        let mut timer = GpuTimer::new(&mut backend, 1).unwrap();
        let readback = timer.frames[0].readback;
        backend.fail_next_read(readback);

        timed_frame(&mut timer, &mut backend, &["lost"]);
        timed_frame(&mut timer, &mut backend, &["untimed"]);
        // The failed read is collected here and the query set is free again
        timed_frame(&mut timer, &mut backend, &["kept"]);
        assert!(timer.results().is_empty());
        assert!(!timer.frames[0].names.is_empty());

        timed_frame(&mut timer, &mut backend, &["untimed"]);
        timed_frame(&mut timer, &mut backend, &["next"]);
        assert_eq!(result_names(&timer), ["kept"]);
    }

    #[test]
    fn test_disabled_without_timestamp_support() {
        let mut backend = RecordingBackend::new(4, 4).without_timestamps();
        let mut timer = GpuTimer::new(&mut backend, 4).unwrap();
        assert!(!timer.is_enabled());
        timed_frame(&mut timer, &mut backend, &["pass"]);
        assert!(timer.results().is_empty());
    }
}
