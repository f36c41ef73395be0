use crate::index::window_hash;
use crate::rangemap::LpcmFormat;
use crate::sync::{find_sync_points_any, StreamKind, LPCM_SYNC_STRIDE};

/// Bytes kept before the scan frontier so multi-byte sync patterns that
/// straddle a flush are still recognized.
const LOOKBACK: usize = 8;
/// Buffer drains keep the stream offset of `buf[0]` a multiple of this, so
/// stride-based PCM sync points stay aligned to absolute stream offsets.
const ALIGN: usize = LPCM_SYNC_STRIDE;
const FLUSH_AT: usize = 1 << 20;

/// Incremental sync-point hasher over one logical byte stream.
///
/// Bytes arrive in arbitrary pieces; every sync point whose full window is
/// present is hashed exactly once, at its absolute stream offset.
pub(crate) struct SyncScanner {
    kinds: Vec<StreamKind>,
    window: usize,
    buf: Vec<u8>,
    base: u64,
    next: usize,
    lpcm: Option<LpcmFormat>,
    pending: Vec<u8>,
}

impl SyncScanner {
    pub(crate) fn new(kinds: &[StreamKind], window: usize) -> Self {
        Self {
            kinds: kinds.to_vec(),
            window,
            buf: Vec::with_capacity(FLUSH_AT + window + ALIGN),
            base: 0,
            next: 0,
            lpcm: None,
            pending: Vec::new(),
        }
    }

    /// From now on, bytes are stored PCM frames; hash their normalized form.
    pub(crate) fn set_lpcm(&mut self, fmt: LpcmFormat) {
        self.lpcm = Some(fmt);
    }

    pub(crate) fn push(&mut self, data: &[u8], emit: &mut dyn FnMut(u64, u64)) {
        match self.lpcm {
            Some(fmt) => {
                self.pending.extend_from_slice(data);
                let pf = fmt.stored_frame_bytes();
                let whole = self.pending.len() / pf * pf;
                fmt.normalize(&self.pending[..whole], &mut self.buf);
                self.pending.drain(..whole);
            }
            None => self.buf.extend_from_slice(data),
        }
        if self.buf.len() >= FLUSH_AT + self.window {
            self.scan(false, emit);
        }
    }

    /// Hash everything left, including sync points up to the stream's end.
    pub(crate) fn finish(&mut self, emit: &mut dyn FnMut(u64, u64)) {
        let rest = std::mem::take(&mut self.pending);
        match self.lpcm {
            Some(fmt) => fmt.normalize(&rest, &mut self.buf),
            None => self.buf.extend_from_slice(&rest),
        }
        self.scan(true, emit);
    }

    fn scan(&mut self, last: bool, emit: &mut dyn FnMut(u64, u64)) {
        let limit = if last {
            self.buf.len()
        } else {
            self.buf.len().saturating_sub(self.window + LOOKBACK)
        };
        for p in find_sync_points_any(&self.buf, &self.kinds) {
            if p < self.next {
                continue;
            }
            if p >= limit {
                break;
            }
            if let Some(w) = self.buf.get(p..p + self.window) {
                emit(self.base + p as u64, window_hash(w));
            }
        }
        if last {
            self.base += self.buf.len() as u64;
            self.buf.clear();
            self.next = 0;
            return;
        }
        let drain = limit.saturating_sub(LOOKBACK) / ALIGN * ALIGN;
        self.buf.drain(..drain);
        self.base += drain as u64;
        self.next = limit - drain;
    }
}
