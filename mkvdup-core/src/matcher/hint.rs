use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

#[derive(Default)]
struct Hint {
    valid: AtomicBool,
    file: AtomicU32,
    offset: AtomicU64,
}

/// Per-track "last matched source location", shared lock-free by workers.
///
/// A torn read (file from one update, offset from another) only changes
/// which candidates are tried first.
pub(crate) struct TrackHints {
    slots: Vec<Hint>,
}

impl TrackHints {
    pub(crate) fn new(tracks: usize) -> Self {
        Self { slots: (0..tracks).map(|_| Hint::default()).collect() }
    }

    pub(crate) fn get(&self, slot: usize) -> Option<(u32, u64)> {
        let h = self.slots.get(slot)?;
        if !h.valid.load(Ordering::Relaxed) {
            return None;
        }
        Some((h.file.load(Ordering::Relaxed), h.offset.load(Ordering::Relaxed)))
    }

    pub(crate) fn set(&self, slot: usize, file: u32, offset: u64) {
        if let Some(h) = self.slots.get(slot) {
            h.file.store(file, Ordering::Relaxed);
            h.offset.store(offset, Ordering::Relaxed);
            h.valid.store(true, Ordering::Relaxed);
        }
    }
}
