// Rate-decoupling buffer between the capture driver and fixed-cadence
// consumers.
//
// Capture devices deliver blocks at irregular sizes and intervals; downstream
// stages want regular fixed-size chunks. Writes of any size are absorbed into
// a circular buffer, and complete chunks are emitted through registered
// callbacks. Chunk extraction is independent of write-call boundaries: only
// the running available total matters.

use std::sync::{Arc, Mutex};

use colored::*;
use tracing::warn;

use crate::config::SmoothingConfig;

pub type ChunkCallback = Arc<dyn Fn(&[f32]) + Send + Sync>;

struct SmoothingState {
    storage: Vec<f32>,
    write_pos: usize,
    read_pos: usize,
    available: usize,
    dropped: u64,
}

/// Circular buffer that absorbs bursty input and emits fixed-size chunks.
///
/// Overflow silently drops the excess rather than signaling the writer; this
/// is intentional lossy smoothing inherited from the capture contract. The
/// fill level is exposed so a monitoring layer can detect sustained overflow.
pub struct RateSmoothingBuffer {
    capacity: usize,
    chunk_size: usize,
    state: Mutex<SmoothingState>,
    listeners: Mutex<Vec<ChunkCallback>>,
}

impl RateSmoothingBuffer {
    pub fn new(config: &SmoothingConfig, sample_rate: u32, channels: u16) -> Self {
        // Sizing is done in whole frames and then scaled by the channel
        // count, so extracted chunks always hold complete frames and the
        // interleaved layout survives extraction at any rate/chunk-ms combo.
        let channels = channels.max(1) as usize;
        let chunk_frames =
            ((config.output_chunk_ms as usize * sample_rate as usize) / 1000).max(1);
        let capacity_frames = ((config.buffer_seconds * sample_rate as f32) as usize).max(1);
        let chunk_size = chunk_frames * channels;
        let capacity = capacity_frames * channels;

        Self {
            capacity,
            chunk_size,
            state: Mutex::new(SmoothingState {
                storage: vec![0.0; capacity],
                write_pos: 0,
                read_pos: 0,
                available: 0,
                dropped: 0,
            }),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Register a chunk-ready callback. Callbacks run on the writing thread,
    /// outside the buffer lock, so a consumer may call back into the buffer.
    pub fn on_chunk(&self, callback: ChunkCallback) {
        self.listeners.lock().unwrap().push(callback);
    }

    /// Absorb `samples`, then emit every complete chunk that became available.
    ///
    /// Two phases: the write and the chunk extraction happen under the state
    /// lock, producing a list of ready chunks; the chunk-ready notifications
    /// then run with no lock held.
    pub fn write(&self, samples: &[f32]) {
        let ready = {
            let mut state = self.state.lock().unwrap();

            let free = self.capacity - state.available;
            let accepted = samples.len().min(free);
            if accepted < samples.len() {
                let dropped_now = (samples.len() - accepted) as u64;
                state.dropped += dropped_now;
                if state.dropped == dropped_now || state.dropped % 48000 < dropped_now {
                    warn!(
                        "{}: smoothing buffer full, dropped {} samples ({} total)",
                        "SMOOTHING_OVERFLOW".yellow(),
                        dropped_now,
                        state.dropped
                    );
                }
            }

            let mut pos = state.write_pos;
            for &sample in &samples[..accepted] {
                state.storage[pos] = sample;
                pos = (pos + 1) % self.capacity;
            }
            state.write_pos = pos;
            state.available += accepted;

            let mut chunks = Vec::new();
            while state.available >= self.chunk_size {
                let mut chunk = Vec::with_capacity(self.chunk_size);
                let mut read = state.read_pos;
                for _ in 0..self.chunk_size {
                    chunk.push(state.storage[read]);
                    read = (read + 1) % self.capacity;
                }
                state.read_pos = read;
                state.available -= self.chunk_size;
                chunks.push(chunk);
            }
            chunks
        };

        if ready.is_empty() {
            return;
        }

        let listeners: Vec<ChunkCallback> = self.listeners.lock().unwrap().clone();
        for chunk in &ready {
            for listener in &listeners {
                listener(chunk);
            }
        }
    }

    /// Fill level as a percentage, read-only diagnostic.
    pub fn fill_level(&self) -> f32 {
        let state = self.state.lock().unwrap();
        state.available as f32 / self.capacity as f32 * 100.0
    }

    /// Total samples dropped to overflow since creation.
    pub fn dropped_samples(&self) -> u64 {
        self.state.lock().unwrap().dropped
    }

    /// Reset positions and zero the storage.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.storage.fill(0.0);
        state.write_pos = 0;
        state.read_pos = 0;
        state.available = 0;
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn buffer_with(chunk_ms: u32, buffer_seconds: f32) -> RateSmoothingBuffer {
        let config = SmoothingConfig {
            buffer_seconds,
            output_chunk_ms: chunk_ms,
        };
        // 1 kHz mono keeps chunk sizes easy to reason about: 10ms -> 10 samples.
        RateSmoothingBuffer::new(&config, 1000, 1)
    }

    #[test]
    fn derived_sizes_follow_config() {
        let buf = buffer_with(10, 1.0);
        assert_eq!(buf.chunk_size(), 10);
        assert_eq!(buf.capacity(), 1000);
    }

    #[test]
    fn chunks_hold_whole_frames_for_any_rate() {
        let config = SmoothingConfig {
            buffer_seconds: 2.0,
            output_chunk_ms: 15,
        };
        // 15ms at 44100Hz is 661.5 frames; rounding must happen in frames,
        // not interleaved samples, or stereo chunks land mid-frame.
        let buf = RateSmoothingBuffer::new(&config, 44100, 2);
        assert_eq!(buf.chunk_size(), 661 * 2);
        assert_eq!(buf.chunk_size() % 2, 0);
        assert_eq!(buf.capacity() % 2, 0);
    }

    #[test]
    fn chunks_are_emitted_once_enough_samples_arrive() {
        let buf = buffer_with(10, 1.0);
        let emitted = Arc::new(Mutex::new(Vec::<Vec<f32>>::new()));
        let sink = Arc::clone(&emitted);
        buf.on_chunk(Arc::new(move |chunk| {
            sink.lock().unwrap().push(chunk.to_vec());
        }));

        buf.write(&[1.0; 7]);
        assert!(emitted.lock().unwrap().is_empty());

        buf.write(&[2.0; 7]);
        let chunks = emitted.lock().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 10);
        assert_eq!(&chunks[0][..7], &[1.0; 7]);
        assert_eq!(&chunks[0][7..], &[2.0; 3]);
    }

    #[test]
    fn chunk_count_is_independent_of_write_granularity() {
        let sample_by_sample = buffer_with(10, 1.0);
        let one_shot = buffer_with(10, 1.0);

        let count_a = Arc::new(AtomicUsize::new(0));
        let count_b = Arc::new(AtomicUsize::new(0));
        let (ca, cb) = (Arc::clone(&count_a), Arc::clone(&count_b));
        sample_by_sample.on_chunk(Arc::new(move |_| {
            ca.fetch_add(1, Ordering::SeqCst);
        }));
        one_shot.on_chunk(Arc::new(move |_| {
            cb.fetch_add(1, Ordering::SeqCst);
        }));

        let data: Vec<f32> = (0..50).map(|i| i as f32).collect();
        for &sample in &data {
            sample_by_sample.write(&[sample]);
        }
        one_shot.write(&data);

        assert_eq!(count_a.load(Ordering::SeqCst), 5);
        assert_eq!(count_b.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn overflow_drops_silently_but_is_visible_in_fill_metrics() {
        let buf = buffer_with(1000, 0.01);
        // Capacity is 10 samples and chunks need 1000, so nothing drains.
        buf.write(&[1.0; 25]);

        assert_eq!(buf.dropped_samples(), 15);
        assert!((buf.fill_level() - 100.0).abs() < f32::EPSILON);
    }

    #[test]
    fn clear_resets_fill_level() {
        let buf = buffer_with(10, 1.0);
        buf.write(&[1.0; 5]);
        assert!(buf.fill_level() > 0.0);
        buf.clear();
        assert_eq!(buf.fill_level(), 0.0);
    }

    #[test]
    fn listener_may_call_back_into_the_buffer() {
        let buf = Arc::new(buffer_with(10, 1.0));
        let reentrant = Arc::clone(&buf);
        buf.on_chunk(Arc::new(move |_| {
            // Reads a lock-guarded metric from inside the notification.
            let _ = reentrant.fill_level();
        }));
        buf.write(&[0.0; 30]);
    }
}
