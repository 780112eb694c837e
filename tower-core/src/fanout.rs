//! Listener registry and the distribution loop that paces MP3 frames out to
//! every connected client without letting a slow one hold up the rest.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::manager::EncoderManager;
use crate::protocol_constants::{
    FANOUT_PACING_INTERVAL_MS, LISTENER_CHANNEL_CAPACITY, MAX_LISTENER_PENDING_BYTES, SAMPLE_RATE,
};

struct Entry {
    sender: mpsc::Sender<Bytes>,
    pending_bytes: Arc<AtomicUsize>,
    last_progress_nanos: Arc<AtomicU64>,
}

/// A registered listener's handle: the receiving half of its sink plus the
/// bookkeeping the HTTP body stream must report progress into.
pub struct ListenerHandle {
    pub id: u64,
    pub receiver: mpsc::Receiver<Bytes>,
    pending_bytes: Arc<AtomicUsize>,
    last_progress_nanos: Arc<AtomicU64>,
    reference: Instant,
}

impl ListenerHandle {
    /// Reports that `len` bytes were actually handed to the socket layer.
    /// Per the socket-write validation rule, only a strictly positive
    /// count counts as progress; zero (or a caller passing 0 because the
    /// underlying write reported no bytes written) leaves the stall timer
    /// running.
    pub fn acknowledge(&self, len: usize) {
        if len == 0 {
            return;
        }
        let _ = self
            .pending_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| Some(p.saturating_sub(len)));
        self.last_progress_nanos
            .store(self.reference.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }
}

struct Shared {
    manager: Arc<EncoderManager>,
    listeners: Mutex<HashMap<u64, Entry>>,
    next_id: AtomicU64,
    client_timeout: Duration,
    reference: Instant,
    silent_frame: Bytes,
    stop_flag: AtomicBool,
}

/// Registry of active listeners plus the pacing/distribution loop.
pub struct BroadcastFanout {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BroadcastFanout {
    pub fn new(manager: Arc<EncoderManager>, client_timeout: Duration, bitrate_kbps: u32) -> Self {
        let shared = Arc::new(Shared {
            manager,
            listeners: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            client_timeout,
            reference: Instant::now(),
            silent_frame: build_silent_mp3_frame(bitrate_kbps),
            stop_flag: AtomicBool::new(true),
        });
        Self {
            shared,
            handle: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        self.shared.stop_flag.store(false, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::spawn(move || run(shared));
        *self.handle.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.shared.stop_flag.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }

    /// Registers a new listener. Joins mid-stream: it only ever receives
    /// frames emitted from this point forward, no backfill.
    pub fn register(&self) -> ListenerHandle {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(LISTENER_CHANNEL_CAPACITY);
        let pending_bytes = Arc::new(AtomicUsize::new(0));
        let last_progress_nanos = Arc::new(AtomicU64::new(self.shared.reference.elapsed().as_nanos() as u64));

        self.shared.listeners.lock().insert(
            id,
            Entry {
                sender,
                pending_bytes: Arc::clone(&pending_bytes),
                last_progress_nanos: Arc::clone(&last_progress_nanos),
            },
        );

        ListenerHandle {
            id,
            receiver,
            pending_bytes,
            last_progress_nanos,
            reference: self.shared.reference,
        }
    }

    pub fn unregister(&self, id: u64) {
        self.shared.listeners.lock().remove(&id);
    }

    pub fn listener_count(&self) -> usize {
        self.shared.listeners.lock().len()
    }
}

fn run(shared: Arc<Shared>) {
    let pacing = Duration::from_millis(FANOUT_PACING_INTERVAL_MS);
    let mut last_emitted: Option<Bytes> = None;

    loop {
        if shared.stop_flag.load(Ordering::Acquire) {
            return;
        }

        let next_tick = Instant::now() + pacing;

        let frame = match shared.manager.poll_mp3() {
            Some(frame) => {
                last_emitted = Some(frame.clone());
                frame
            }
            None => last_emitted
                .clone()
                .unwrap_or_else(|| shared.silent_frame.clone()),
        };

        deliver(&shared, &frame);

        let now = Instant::now();
        if now < next_tick {
            std::thread::sleep(next_tick - now);
        }
    }
}

fn deliver(shared: &Arc<Shared>, frame: &Bytes) {
    let snapshot: Vec<(u64, mpsc::Sender<Bytes>, Arc<AtomicUsize>, Arc<AtomicU64>)> = shared
        .listeners
        .lock()
        .iter()
        .map(|(id, entry)| {
            (
                *id,
                entry.sender.clone(),
                Arc::clone(&entry.pending_bytes),
                Arc::clone(&entry.last_progress_nanos),
            )
        })
        .collect();

    let now_nanos = shared.reference.elapsed().as_nanos() as u64;
    let mut evict = Vec::new();

    for (id, sender, pending_bytes, last_progress_nanos) in snapshot {
        match sender.try_send(frame.clone()) {
            Ok(()) => {
                pending_bytes.fetch_add(frame.len(), Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Treated as backpressure, not an error: the pending-bytes
                // and no-progress checks below decide whether this rises
                // to eviction.
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                evict.push(id);
                continue;
            }
        }

        let pending = pending_bytes.load(Ordering::Relaxed);
        let age_ms = now_nanos.saturating_sub(last_progress_nanos.load(Ordering::Relaxed)) / 1_000_000;
        if pending > MAX_LISTENER_PENDING_BYTES || age_ms > shared.client_timeout.as_millis() as u64 {
            evict.push(id);
        }
    }

    if !evict.is_empty() {
        let mut listeners = shared.listeners.lock();
        for id in evict {
            listeners.remove(&id);
        }
    }
}

/// A structurally valid but otherwise synthetic MP3 frame used only before
/// the very first real encoder frame arrives (or if the supervisor has
/// never produced one at all, e.g. `OfflineTest` mode). Not a genuine
/// encoded silence frame — building one of those would require running the
/// encoder, which is exactly what this frame stands in for the absence of.
fn build_silent_mp3_frame(bitrate_kbps: u32) -> Bytes {
    let bitrate_bps = bitrate_kbps.max(8) * 1000;
    let frame_len = (144 * bitrate_bps / SAMPLE_RATE) as usize;
    let mut frame = vec![0u8; frame_len.max(4)];
    frame[0] = 0xFF;
    frame[1] = 0xE0 | (0b11 << 3) | (0b01 << 1);
    Bytes::from(frame)
}
