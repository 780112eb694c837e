//! Fixed protocol constants that should NOT be changed.
//!
//! These values define the canonical audio format and wire contracts used
//! throughout the broadcaster. Changing them would desynchronize the
//! metronome, the ring capacities, and the encoder's own framing.

// ─────────────────────────────────────────────────────────────────────────────
// Canonical PCM format
// ─────────────────────────────────────────────────────────────────────────────

/// Sample rate of the canonical PCM format (Hz).
pub const SAMPLE_RATE: u32 = 48_000;

/// Channel count of the canonical PCM format (stereo).
pub const CHANNELS: u32 = 2;

/// Bytes per sample (signed 16-bit little-endian).
pub const BYTES_PER_SAMPLE: u32 = 2;

/// Samples per channel in one canonical PCM frame ("current" configuration
/// per the source; the legacy 1152/24ms pair was not selected — see
/// DESIGN.md).
pub const SAMPLES_PER_FRAME: u32 = 1024;

/// Size in bytes of one canonical PCM frame.
///
/// `SAMPLES_PER_FRAME * CHANNELS * BYTES_PER_SAMPLE`. All ring capacities
/// and intermediate buffers are whole multiples of this value.
pub const CANONICAL_FRAME_BYTES: usize =
    (SAMPLES_PER_FRAME * CHANNELS * BYTES_PER_SAMPLE) as usize;

/// Tick period, i.e. `SAMPLES_PER_FRAME / SAMPLE_RATE` seconds, expressed in
/// microseconds for exact integer arithmetic (1024/48000 s = 21333.33...us,
/// so this is truncated; the pump resyncs every tick and never accumulates
/// drift from this truncation since it recomputes deadlines from `Instant`
/// addition, not repeated accumulation).
pub const TICK_PERIOD_MICROS: u64 = 21_333;

// ─────────────────────────────────────────────────────────────────────────────
// Grace / fallback
// ─────────────────────────────────────────────────────────────────────────────

/// Default max silence gap before switching from grace-silence to fallback (s).
pub const DEFAULT_GRACE_SECONDS: u64 = 5;

/// Default fallback tone frequency (Hz).
pub const DEFAULT_TONE_FREQUENCY_HZ: f32 = 440.0;

// ─────────────────────────────────────────────────────────────────────────────
// Encoder supervisor
// ─────────────────────────────────────────────────────────────────────────────

/// Default first-MP3-frame hard timeout during Booting (ms).
pub const DEFAULT_ENCODER_STARTUP_TIMEOUT_MS: u64 = 1500;

/// Default post-startup stall threshold (ms).
pub const DEFAULT_ENCODER_STALL_THRESHOLD_MS: u64 = 2000;

/// Default cap on consecutive restart attempts.
pub const DEFAULT_ENCODER_MAX_RESTARTS: u32 = 5;

/// Default exponential backoff schedule (seconds), capped at 10s/5 attempts.
pub const DEFAULT_BACKOFF_SCHEDULE_SECS: &[u64] = &[1, 2, 4, 8, 10];

/// Default encoder output bitrate (kbps).
pub const DEFAULT_BITRATE_KBPS: u32 = 128;

/// Consecutive-MP3-frame spacing multiplier beyond which a frame-interval
/// violation is declared (§4.3: "spaced by more than 1.5x the expected
/// interval for a sustained window").
pub const FRAME_INTERVAL_VIOLATION_MULTIPLIER: f64 = 1.5;

/// Number of consecutive violating intervals that constitute a "sustained
/// window" for the frame-interval-violation liveness check.
pub const FRAME_INTERVAL_VIOLATION_WINDOW: u32 = 3;

// ─────────────────────────────────────────────────────────────────────────────
// Listener / fanout
// ─────────────────────────────────────────────────────────────────────────────

/// Default slow-listener eviction threshold (ms of no progress).
pub const DEFAULT_CLIENT_TIMEOUT_MS: u64 = 250;

/// Maximum pending bytes a listener may accumulate before eviction.
pub const MAX_LISTENER_PENDING_BYTES: usize = 64 * 1024;

/// Wall-clock pacing interval used by the fanout dispatcher when no fresh
/// MP3 frame is available by the deadline (ms).
pub const FANOUT_PACING_INTERVAL_MS: u64 = 24;

/// Bounded channel capacity (frames) for each listener's sink. This is a
/// depth, not a byte budget — the 64 KiB pending-bytes ceiling is tracked
/// separately and is usually the tighter constraint.
pub const LISTENER_CHANNEL_CAPACITY: usize = 32;

// ─────────────────────────────────────────────────────────────────────────────
// Packetizer
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded internal accumulator for the MP3 packetizer (bytes).
pub const PACKETIZER_BUFFER_CAPACITY: usize = 64 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Ring defaults
// ─────────────────────────────────────────────────────────────────────────────

/// Default PCM ingest ring capacity (frames). A few hundred frames at
/// ~21ms/frame is a few seconds of buffering headroom.
pub const DEFAULT_PCM_RING_CAPACITY: usize = 256;

/// Default MP3 output ring capacity (frames).
pub const DEFAULT_MP3_RING_CAPACITY: usize = 512;

// ─────────────────────────────────────────────────────────────────────────────
// Application identity
// ─────────────────────────────────────────────────────────────────────────────

/// Service identifier surfaced on `/status` and in logs.
pub const SERVICE_ID: &str = "tower";
