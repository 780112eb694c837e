//! Owns the encoder subprocess, drains its stdout/stderr, detects liveness
//! failures, and restarts with backoff.
//!
//! Exactly one background "restart worker" thread exists per supervisor for
//! its whole lifetime; it is responsible for spawning each successive
//! attempt, waiting out the first-frame timeout, monitoring for stall or
//! frame-interval violations once running, and sleeping the backoff window
//! between attempts. Two further threads are spawned per live attempt to
//! drain the child's stdout and stderr; they are daemon-style and are never
//! joined (they exit on their own when the pipe closes).

use std::io::{Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::{TowerError, TowerResult};
use crate::protocol_constants::{
    CANONICAL_FRAME_BYTES, DEFAULT_BACKOFF_SCHEDULE_SECS, DEFAULT_BITRATE_KBPS,
    DEFAULT_ENCODER_MAX_RESTARTS, DEFAULT_ENCODER_STALL_THRESHOLD_MS,
    DEFAULT_ENCODER_STARTUP_TIMEOUT_MS, FRAME_INTERVAL_VIOLATION_MULTIPLIER,
    FRAME_INTERVAL_VIOLATION_WINDOW, SAMPLE_RATE,
};
use crate::ring::FrameRing;

use super::packetizer::Mp3Packetizer;

/// Observable supervisor state. The externally-published sequence during a
/// restart collapses the intra-restart `Booting` into `Restarting` (see
/// [`EncoderSupervisor::state`]); the cold-start sequence surfaces `Booting`
/// directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Booting,
    Running,
    Restarting,
    Failed,
}

/// Outcome of a single, non-blocking write attempt to the encoder's stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Wrote(usize),
    WouldBlock,
    BrokenPipe,
    ProcessExited(Option<i32>),
}

#[derive(Debug, Clone)]
pub struct EncoderSupervisorConfig {
    pub encoder_path: String,
    pub bitrate_kbps: u32,
    pub startup_timeout: Duration,
    pub stall_threshold: Duration,
    pub max_restarts: u32,
    pub backoff_schedule: Vec<Duration>,
}

impl Default for EncoderSupervisorConfig {
    fn default() -> Self {
        Self {
            encoder_path: "lame".to_string(),
            bitrate_kbps: DEFAULT_BITRATE_KBPS,
            startup_timeout: Duration::from_millis(DEFAULT_ENCODER_STARTUP_TIMEOUT_MS),
            stall_threshold: Duration::from_millis(DEFAULT_ENCODER_STALL_THRESHOLD_MS),
            max_restarts: DEFAULT_ENCODER_MAX_RESTARTS,
            backoff_schedule: DEFAULT_BACKOFF_SCHEDULE_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        }
    }
}

struct InnerFsm {
    raw_state: SupervisorState,
    /// True from the moment a running encoder fails until the next
    /// successful `Running` transition (or `Failed`). Drives the
    /// cold-start-vs-restart collapse rule on the external view.
    in_restart_cycle: bool,
    restart_attempts: u32,
}

struct Shared {
    config: EncoderSupervisorConfig,
    mp3_ring: Arc<FrameRing>,
    inner: Mutex<InnerFsm>,
    state_tx: broadcast::Sender<SupervisorState>,
    /// Last external state actually sent on `state_tx`, so that a raw-state
    /// change which collapses to the same external view (e.g. the
    /// intra-restart `Restarting -> Booting` transition, both of which read
    /// externally as `Restarting`) does not re-announce it.
    last_published: Mutex<Option<SupervisorState>>,
    stop_flag: Arc<AtomicBool>,
    current_child: Mutex<Option<Child>>,
    stdin_handle: Mutex<Option<ChildStdin>>,
    reference: Instant,
    last_mp3_nanos: AtomicU64,
    avg_interval_ms: AtomicU64,
    consecutive_interval_violations: AtomicU32,
    interval_violation: AtomicBool,
    stdout_eof: AtomicBool,
}

impl Shared {
    fn external_view(inner: &InnerFsm) -> SupervisorState {
        match inner.raw_state {
            SupervisorState::Booting if inner.in_restart_cycle => SupervisorState::Restarting,
            other => other,
        }
    }

    fn publish_current(&self) {
        let inner = self.inner.lock();
        let view = Self::external_view(&inner);
        drop(inner);

        let mut last = self.last_published.lock();
        if *last == Some(view) {
            return;
        }
        *last = Some(view);
        drop(last);

        // Broadcast has no subscribers until someone calls subscribe(); a
        // send with no receivers is not an error we care about.
        let _ = self.state_tx.send(view);
    }

    fn set_raw_state(&self, state: SupervisorState) {
        let mut inner = self.inner.lock();
        inner.raw_state = state;
        drop(inner);
        self.publish_current();
    }

    fn raw_state(&self) -> SupervisorState {
        self.inner.lock().raw_state
    }

    fn now_nanos(&self) -> u64 {
        self.reference.elapsed().as_nanos() as u64
    }

    fn sleep_checking_stop(&self, total: Duration) {
        let step = Duration::from_millis(20);
        let mut remaining = total;
        while remaining > Duration::ZERO {
            if self.stop_flag.load(Ordering::Acquire) {
                return;
            }
            let this_step = step.min(remaining);
            std::thread::sleep(this_step);
            remaining = remaining.saturating_sub(this_step);
        }
    }
}

/// Owns exactly one encoder subprocess at a time and the MP3 ring it
/// populates through the packetizer.
pub struct EncoderSupervisor {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EncoderSupervisor {
    pub fn new(config: EncoderSupervisorConfig, mp3_ring: Arc<FrameRing>) -> Self {
        let (state_tx, _) = broadcast::channel(32);
        let shared = Arc::new(Shared {
            config,
            mp3_ring,
            inner: Mutex::new(InnerFsm {
                raw_state: SupervisorState::Stopped,
                in_restart_cycle: false,
                restart_attempts: 0,
            }),
            state_tx,
            last_published: Mutex::new(None),
            stop_flag: Arc::new(AtomicBool::new(true)),
            current_child: Mutex::new(None),
            stdin_handle: Mutex::new(None),
            reference: Instant::now(),
            last_mp3_nanos: AtomicU64::new(0),
            avg_interval_ms: AtomicU64::new(0),
            consecutive_interval_violations: AtomicU32::new(0),
            interval_violation: AtomicBool::new(false),
            stdout_eof: AtomicBool::new(false),
        });
        Self {
            shared,
            worker: Mutex::new(None),
        }
    }

    /// Subscribes to state transition events.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorState> {
        self.shared.state_tx.subscribe()
    }

    /// Returns the externally-collapsed current state.
    pub fn state(&self) -> SupervisorState {
        let inner = self.shared.inner.lock();
        Shared::external_view(&inner)
    }

    /// Pops the next complete MP3 frame produced by the stdout drain, if
    /// any. Never blocks.
    pub fn poll_mp3(&self) -> Option<Bytes> {
        self.shared.mp3_ring.pop()
    }

    /// Non-blocking: forwards to the encoder's stdin if currently Running
    /// or Booting (checked against the *raw*, uncollapsed state — a fresh
    /// child genuinely has a writable stdin during a restart's Booting
    /// phase even though that phase is reported externally as
    /// Restarting). Drops the frame otherwise.
    ///
    /// Issues a single `write(2)` call rather than `write_all` — on a
    /// nonblocking pipe, `write_all` loops internally and can push part of
    /// a frame through before hitting `WouldBlock`, leaving a partial PCM
    /// frame in the encoder's stdin that desyncs every frame boundary after
    /// it. A single write either fits the whole frame, fits none of it
    /// (`WouldBlock`, reported before any byte is sent), or — on a
    /// constrained pipe — fits only part; that partial count is reported
    /// back via `Wrote(n)` rather than silently retried, so the caller's
    /// accounting always matches what actually reached the encoder.
    pub fn write_pcm(&self, frame: &Bytes) -> WriteOutcome {
        match self.shared.raw_state() {
            SupervisorState::Running | SupervisorState::Booting => {
                let mut guard = self.shared.stdin_handle.lock();
                match guard.as_mut() {
                    Some(stdin) => match stdin.write(frame) {
                        Ok(n) => WriteOutcome::Wrote(n),
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            WriteOutcome::WouldBlock
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                            log::warn!("[Supervisor] stdin broken pipe");
                            WriteOutcome::BrokenPipe
                        }
                        Err(e) => {
                            log::warn!("[Supervisor] stdin write failed: {e}");
                            WriteOutcome::BrokenPipe
                        }
                    },
                    None => WriteOutcome::BrokenPipe,
                }
            }
            _ => WriteOutcome::ProcessExited(None),
        }
    }

    /// Starts the supervisor. Gated by `allow_subprocess`: test code that
    /// doesn't opt in cannot accidentally launch a real encoder. Per the
    /// startup contract, the observable state is `Booting` by the time
    /// this call returns.
    pub fn start(&self, allow_subprocess: bool) -> TowerResult<()> {
        if !allow_subprocess {
            return Err(TowerError::SubprocessNotPermitted(
                "encoder_enabled / allow_subprocess_in_tests is false".into(),
            ));
        }

        self.shared.stop_flag.store(false, Ordering::Release);
        self.shared.set_raw_state(SupervisorState::Starting);
        // Synchronous transition to Booting before returning. Any failure
        // from here on (including a spawn() error) is necessarily observed
        // after Booting is already published, so it is processed
        // immediately rather than deferred, per the startup contract.
        self.shared.set_raw_state(SupervisorState::Booting);

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::spawn(move || run_worker(shared, true));
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    /// Kills the subprocess if alive, disables restart, and returns.
    /// Drain threads are not joined (they exit on pipe EOF).
    pub fn stop(&self) {
        self.shared.stop_flag.store(true, Ordering::Release);
        if let Some(mut child) = self.shared.current_child.lock().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        *self.shared.stdin_handle.lock() = None;
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        self.shared.set_raw_state(SupervisorState::Stopped);
    }
}

/// Body of the dedicated restart-worker thread. `skip_initial_booting` is
/// true only for the very first pass after a cold-start `start()` call,
/// whose `Starting -> Booting` transition already happened synchronously
/// on the caller's thread.
fn run_worker(shared: Arc<Shared>, mut skip_initial_booting: bool) {
    loop {
        if shared.stop_flag.load(Ordering::Acquire) {
            return;
        }

        if !skip_initial_booting {
            shared.set_raw_state(SupervisorState::Booting);
        }
        skip_initial_booting = false;

        shared.last_mp3_nanos.store(0, Ordering::Relaxed);
        shared.stdout_eof.store(false, Ordering::Relaxed);
        shared.interval_violation.store(false, Ordering::Relaxed);
        shared.consecutive_interval_violations.store(0, Ordering::Relaxed);
        shared.avg_interval_ms.store(0, Ordering::Relaxed);

        let spawn_result = spawn_and_attach(&shared);

        let failed = match spawn_result {
            Ok(()) => {
                let deadline = Instant::now() + shared.config.startup_timeout;
                if !wait_for_first_frame(&shared, deadline) {
                    log::warn!("[Supervisor] encoder startup timed out");
                    true
                } else {
                    let mut inner = shared.inner.lock();
                    inner.raw_state = SupervisorState::Running;
                    inner.in_restart_cycle = false;
                    inner.restart_attempts = 0;
                    drop(inner);
                    shared.publish_current();
                    log::info!("[Supervisor] encoder live");

                    let reason = monitor_until_failure(&shared);
                    log::warn!("[Supervisor] liveness failure: {reason}");
                    true
                }
            }
            Err(e) => {
                log::warn!("[Supervisor] spawn failed: {e}");
                true
            }
        };

        if failed {
            if let Some(mut child) = shared.current_child.lock().take() {
                let _ = child.kill();
                let _ = child.wait();
            }
            *shared.stdin_handle.lock() = None;
        }

        if shared.stop_flag.load(Ordering::Acquire) {
            return;
        }

        let attempts = {
            let mut inner = shared.inner.lock();
            inner.restart_attempts += 1;
            inner.restart_attempts
        };

        if attempts > shared.config.max_restarts {
            shared.set_raw_state(SupervisorState::Failed);
            return;
        }

        {
            let mut inner = shared.inner.lock();
            inner.raw_state = SupervisorState::Restarting;
            inner.in_restart_cycle = true;
        }
        shared.publish_current();

        let backoff = shared
            .config
            .backoff_schedule
            .get((attempts as usize).saturating_sub(1))
            .copied()
            .or_else(|| shared.config.backoff_schedule.last().copied())
            .unwrap_or(Duration::from_secs(10));
        shared.sleep_checking_stop(backoff);
    }
}

fn spawn_and_attach(shared: &Arc<Shared>) -> std::io::Result<()> {
    // `-r` forces raw (headerless) PCM input so lame packetizes at the
    // canonical frame boundary immediately instead of probing a WAV
    // header; `--quiet` keeps stderr limited to genuine diagnostics.
    let mut child = Command::new(&shared.config.encoder_path)
        .args([
            "--quiet",
            "-r",
            "-s",
            &(SAMPLE_RATE as f64 / 1000.0).to_string(),
            "--bitwidth",
            "16",
            "-m",
            "s",
            "-b",
            &shared.config.bitrate_kbps.to_string(),
            "-",
            "-",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdin = child.stdin.take().expect("piped stdin");
    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    set_nonblocking(&stdin);

    *shared.stdin_handle.lock() = Some(stdin);
    *shared.current_child.lock() = Some(child);

    spawn_stdout_drain(Arc::clone(shared), stdout);
    spawn_stderr_drain(Arc::clone(shared), stderr);

    // Prime the encoder with one silence frame so the first real PCM
    // frame doesn't have to carry the cold-start latency alone.
    let silence = vec![0u8; CANONICAL_FRAME_BYTES];
    if let Some(stdin) = shared.stdin_handle.lock().as_mut() {
        let _ = stdin.write_all(&silence);
    }

    Ok(())
}

fn spawn_stdout_drain(shared: Arc<Shared>, mut stdout: impl Read + Send + 'static) {
    std::thread::spawn(move || {
        let mut packetizer = Mp3Packetizer::new();
        let mut buf = [0u8; 8192];
        loop {
            match stdout.read(&mut buf) {
                Ok(0) => {
                    shared.stdout_eof.store(true, Ordering::Relaxed);
                    return;
                }
                Ok(n) => {
                    for frame in packetizer.feed(&buf[..n]) {
                        let now = shared.now_nanos();
                        let prev = shared.last_mp3_nanos.swap(now, Ordering::Relaxed);
                        record_interval(&shared, prev, now);
                        shared.mp3_ring.push(frame);
                    }
                }
                Err(_) => {
                    shared.stdout_eof.store(true, Ordering::Relaxed);
                    return;
                }
            }
        }
    });
}

fn record_interval(shared: &Arc<Shared>, prev_nanos: u64, now_nanos: u64) {
    if prev_nanos == 0 {
        return;
    }
    let gap_ms = now_nanos.saturating_sub(prev_nanos) / 1_000_000;
    let avg = shared.avg_interval_ms.load(Ordering::Relaxed);
    if avg == 0 {
        shared.avg_interval_ms.store(gap_ms.max(1), Ordering::Relaxed);
        return;
    }
    let is_violation = (gap_ms as f64) > (avg as f64) * FRAME_INTERVAL_VIOLATION_MULTIPLIER;
    if is_violation {
        let n = shared
            .consecutive_interval_violations
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        if n >= FRAME_INTERVAL_VIOLATION_WINDOW {
            shared.interval_violation.store(true, Ordering::Relaxed);
        }
    } else {
        shared
            .consecutive_interval_violations
            .store(0, Ordering::Relaxed);
        let new_avg = (avg * 7 + gap_ms) / 8;
        shared
            .avg_interval_ms
            .store(new_avg.max(1), Ordering::Relaxed);
    }
}

fn spawn_stderr_drain(shared: Arc<Shared>, stderr: impl Read + Send + 'static) {
    std::thread::spawn(move || {
        let mut reader = std::io::BufReader::new(stderr);
        let mut line = String::new();
        loop {
            line.clear();
            match std::io::BufRead::read_line(&mut reader, &mut line) {
                Ok(0) => return,
                Ok(_) => {
                    let trimmed = line.trim_end();
                    if !trimmed.is_empty() {
                        log::info!("[ENCODER] {trimmed}");
                    }
                }
                Err(_) => {
                    let _ = &shared;
                    return;
                }
            }
        }
    });
}

fn wait_for_first_frame(shared: &Arc<Shared>, deadline: Instant) -> bool {
    loop {
        if shared.last_mp3_nanos.load(Ordering::Relaxed) != 0 {
            return true;
        }
        if shared.stop_flag.load(Ordering::Acquire) {
            return false;
        }
        if shared.stdout_eof.load(Ordering::Relaxed) {
            return false;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn monitor_until_failure(shared: &Arc<Shared>) -> &'static str {
    loop {
        if shared.stop_flag.load(Ordering::Acquire) {
            return "stop requested";
        }
        if shared.interval_violation.swap(false, Ordering::Relaxed) {
            return "frame interval violation";
        }
        if shared.stdout_eof.load(Ordering::Relaxed) {
            return "stdout eof";
        }
        {
            let mut child_guard = shared.current_child.lock();
            if let Some(child) = child_guard.as_mut() {
                match child.try_wait() {
                    Ok(Some(_status)) => return "process exited",
                    Ok(None) => {}
                    Err(_) => return "wait error",
                }
            }
        }
        let age_ms =
            shared.now_nanos().saturating_sub(shared.last_mp3_nanos.load(Ordering::Relaxed))
                / 1_000_000;
        if age_ms > shared.config.stall_threshold.as_millis() as u64 {
            return "stall";
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[cfg(unix)]
fn set_nonblocking(stdin: &ChildStdin) {
    use std::os::unix::io::AsRawFd;
    unsafe {
        let fd = stdin.as_raw_fd();
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
}

#[cfg(not(unix))]
fn set_nonblocking(_stdin: &ChildStdin) {}
