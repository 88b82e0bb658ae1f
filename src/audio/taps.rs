// Visualization fan-out: oscilloscope/spectrum-style consumers subscribe for
// copies of audio blocks. Dispatch is copy-and-forget from whatever thread
// produced the block; callbacks must not assume a UI thread and must not
// block the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::types::AudioBlock;

pub type TapId = u64;
pub type BlockCallback = Arc<dyn Fn(&AudioBlock) + Send + Sync>;

/// Explicit observer registration for block taps.
///
/// Notification never happens while the registry lock is held, so a callback
/// may subscribe or unsubscribe taps without deadlocking.
#[derive(Default)]
pub struct TapRegistry {
    next_id: AtomicU64,
    taps: Mutex<HashMap<TapId, BlockCallback>>,
}

impl TapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, callback: BlockCallback) -> TapId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.taps.lock().unwrap().insert(id, callback);
        id
    }

    pub fn unsubscribe(&self, id: TapId) -> bool {
        self.taps.lock().unwrap().remove(&id).is_some()
    }

    /// Deliver a block to every registered tap.
    pub fn notify(&self, block: &AudioBlock) {
        let callbacks: Vec<BlockCallback> = {
            let taps = self.taps.lock().unwrap();
            if taps.is_empty() {
                return;
            }
            taps.values().cloned().collect()
        };

        for callback in callbacks {
            callback(block);
        }
    }

    pub fn len(&self) -> usize {
        self.taps.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn subscribed_taps_receive_block_copies() {
        let registry = TapRegistry::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);

        registry.subscribe(Arc::new(move |block| {
            assert_eq!(block.channels, 2);
            counter.fetch_add(block.samples.len(), Ordering::SeqCst);
        }));

        registry.notify(&AudioBlock::new(vec![0.0; 8], 2));
        assert_eq!(seen.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let registry = TapRegistry::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);

        let id = registry.subscribe(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));

        registry.notify(&AudioBlock::new(vec![0.0; 4], 2));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn tap_may_mutate_the_registry_during_notify() {
        let registry = Arc::new(TapRegistry::new());
        let inner = Arc::clone(&registry);
        registry.subscribe(Arc::new(move |_| {
            inner.subscribe(Arc::new(|_| {}));
        }));

        registry.notify(&AudioBlock::new(vec![0.0; 2], 1));
        assert_eq!(registry.len(), 2);
    }
}
