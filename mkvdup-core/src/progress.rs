use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, PoisonError,
};
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

/// Shared progress counters with an optional periodic reporter thread.
#[derive(Clone)]
pub struct Progress {
    enabled: bool,
    interval: Duration,
    pub stage: Arc<Mutex<String>>,
    pub items_done: Arc<AtomicU64>,
    pub items_total: Arc<AtomicU64>,
    pub bytes_done: Arc<AtomicU64>,
    pub bytes_total: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
}

impl Progress {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            interval: Duration::from_secs(5),
            stage: Arc::new(Mutex::new(String::new())),
            items_done: Arc::new(AtomicU64::new(0)),
            items_total: Arc::new(AtomicU64::new(0)),
            bytes_done: Arc::new(AtomicU64::new(0)),
            bytes_total: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_stage(&self, s: &str) {
        if self.enabled {
            *self.stage.lock().unwrap_or_else(PoisonError::into_inner) = s.to_string();
        }
    }

    pub fn set_items_total(&self, n: u64) {
        self.items_total.store(n, Ordering::Relaxed);
        self.items_done.store(0, Ordering::Relaxed);
    }

    pub fn inc_item(&self) {
        self.items_done.fetch_add(1, Ordering::Relaxed);
    }

    /// Matches the indexer's `(bytes processed, total bytes)` callback shape.
    pub fn set_bytes(&self, done: u64, total: u64) {
        self.bytes_total.store(total, Ordering::Relaxed);
        self.bytes_done.store(done, Ordering::Relaxed);
    }

    pub fn start(&self) {
        if !self.enabled {
            return;
        }
        self.running.store(true, Ordering::Relaxed);
        let this = self.clone();
        thread::spawn(move || {
            let t0 = Instant::now();
            while this.running.load(Ordering::Relaxed) {
                thread::sleep(this.interval);
                if !this.running.load(Ordering::Relaxed) {
                    break;
                }
                this.report(t0);
            }
        });
    }

    fn report(&self, t0: Instant) {
        let stage = self.stage.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let done = self.items_done.load(Ordering::Relaxed);
        let total = self.items_total.load(Ordering::Relaxed);
        let bd = self.bytes_done.load(Ordering::Relaxed);
        let bt = self.bytes_total.load(Ordering::Relaxed);
        let pct = if bt > 0 { (bd as f64 / bt as f64) * 100.0 } else { 0.0 };
        info!(
            elapsed_s = t0.elapsed().as_secs(),
            stage = %stage,
            items = format_args!("{done}/{total}"),
            bytes_pct = pct as i32,
            "progress"
        );
    }

    pub fn stop(&self) {
        if self.enabled {
            self.running.store(false, Ordering::Relaxed);
        }
    }
}
