//! Process-wide relay counters.
//! Plain atomics; a snapshot is logged at shutdown.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

static FRAMES_DECODED: AtomicU64 = AtomicU64::new(0);
static FRAMES_UNDECODABLE: AtomicU64 = AtomicU64::new(0);
static DUPLICATES: AtomicU64 = AtomicU64::new(0);
static FORWARDED: AtomicU64 = AtomicU64::new(0);
static FILTERED: AtomicU64 = AtomicU64::new(0);
static SINK_FAILURES: AtomicU64 = AtomicU64::new(0);
static QUEUE_DROPS: AtomicU64 = AtomicU64::new(0);
static RECONNECTS: AtomicU64 = AtomicU64::new(0);

static SOURCE_COUNTERS: OnceLock<Mutex<HashMap<String, SourceCounter>>> = OnceLock::new();

pub fn inc_frames_decoded() {
    FRAMES_DECODED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_frames_undecodable() {
    FRAMES_UNDECODABLE.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_duplicates() {
    DUPLICATES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_forwarded() {
    FORWARDED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_filtered() {
    FILTERED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_sink_failures() {
    SINK_FAILURES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_queue_drops() {
    QUEUE_DROPS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_reconnects() {
    RECONNECTS.fetch_add(1, Ordering::Relaxed);
}

/// Per-source packet tallies.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SourceCounter {
    pub packets: u64,
    pub forwarded: u64,
    pub duplicates: u64,
}

fn source_counter_lock() -> &'static Mutex<HashMap<String, SourceCounter>> {
    SOURCE_COUNTERS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn with_source<F: FnOnce(&mut SourceCounter)>(source: &str, f: F) {
    let mut guard = match source_counter_lock().lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    f(guard.entry(source.to_string()).or_default());
}

pub fn record_source_packet(source: &str) {
    with_source(source, |c| c.packets += 1);
}
pub fn record_source_forwarded(source: &str) {
    with_source(source, |c| c.forwarded += 1);
}
pub fn record_source_duplicate(source: &str) {
    with_source(source, |c| c.duplicates += 1);
}

pub fn source_counters_snapshot() -> HashMap<String, SourceCounter> {
    match source_counter_lock().lock() {
        Ok(g) => g.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub frames_decoded: u64,
    pub frames_undecodable: u64,
    pub duplicates: u64,
    pub forwarded: u64,
    pub filtered: u64,
    pub sink_failures: u64,
    pub queue_drops: u64,
    pub reconnects: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        frames_decoded: FRAMES_DECODED.load(Ordering::Relaxed),
        frames_undecodable: FRAMES_UNDECODABLE.load(Ordering::Relaxed),
        duplicates: DUPLICATES.load(Ordering::Relaxed),
        forwarded: FORWARDED.load(Ordering::Relaxed),
        filtered: FILTERED.load(Ordering::Relaxed),
        sink_failures: SINK_FAILURES.load(Ordering::Relaxed),
        queue_drops: QUEUE_DROPS.load(Ordering::Relaxed),
        reconnects: RECONNECTS.load(Ordering::Relaxed),
    }
}

impl std::fmt::Display for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "decoded={} undecodable={} duplicates={} forwarded={} filtered={} sink_failures={} queue_drops={} reconnects={}",
            self.frames_decoded,
            self.frames_undecodable,
            self.duplicates,
            self.forwarded,
            self.filtered,
            self.sink_failures,
            self.queue_drops,
            self.reconnects
        )
    }
}
