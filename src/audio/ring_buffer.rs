// Fixed-capacity circular sample buffer for visualization snapshotting.
//
// Lossy by design: once full, writes overwrite the oldest data. It exists
// only for "recent history" queries from UI-style pollers, never for
// lossless transport. Critical sections are memcopy-sized.

use std::sync::Mutex;

struct RingState {
    storage: Vec<f32>,
    write_pos: usize,
    available: usize,
}

/// Mutex-guarded circular buffer of f32 samples.
pub struct RingAudioBuffer {
    capacity: usize,
    state: Mutex<RingState>,
}

impl RingAudioBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            capacity,
            state: Mutex::new(RingState {
                storage: vec![0.0; capacity],
                write_pos: 0,
                available: 0,
            }),
        }
    }

    /// Append samples, overwriting the oldest data once at capacity.
    pub fn write(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }

        let mut state = self.state.lock().unwrap();

        // An input larger than the whole buffer reduces to its tail.
        let src = if samples.len() > self.capacity {
            &samples[samples.len() - self.capacity..]
        } else {
            samples
        };

        let first = (self.capacity - state.write_pos).min(src.len());
        let pos = state.write_pos;
        state.storage[pos..pos + first].copy_from_slice(&src[..first]);
        if first < src.len() {
            state.storage[..src.len() - first].copy_from_slice(&src[first..]);
        }

        state.write_pos = (state.write_pos + src.len()) % self.capacity;
        state.available = (state.available + src.len()).min(self.capacity);
    }

    /// Return the most recent `min(count, available)` samples in
    /// chronological order without consuming them. Supports repeated polling
    /// by a UI timer.
    pub fn read_latest(&self, count: usize) -> Vec<f32> {
        let state = self.state.lock().unwrap();
        let n = count.min(state.available);
        if n == 0 {
            return Vec::new();
        }

        let start = (state.write_pos + self.capacity - n) % self.capacity;
        let mut out = Vec::with_capacity(n);
        let first = (self.capacity - start).min(n);
        out.extend_from_slice(&state.storage[start..start + first]);
        if first < n {
            out.extend_from_slice(&state.storage[..n - first]);
        }
        out
    }

    /// Reset to empty and zero the backing storage.
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.storage.fill(0.0);
        state.write_pos = 0;
        state.available = 0;
    }

    pub fn available(&self) -> usize {
        self.state.lock().unwrap().available
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
