//! Zero-latency PCM frame source, opaque to callers.
//!
//! Priority at startup: (a) a pre-decoded canonical-PCM file, looped
//! forever; (b) a phase-continuous 440 Hz sine tone; (c) a zero-filled
//! silence frame. Decoding arbitrary audio files is out of scope (per
//! spec.md §1) — the file tier is constructed from PCM bytes the caller has
//! already decoded/resampled to the canonical format. Selection only ever
//! moves down the priority order, never back up, matching the encoder
//! supervisor's own no-recovery-within-a-run posture.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::protocol_constants::CANONICAL_FRAME_BYTES;

const TIER_FILE: u8 = 0;
const TIER_TONE: u8 = 1;
const TIER_SILENCE: u8 = 2;

struct State {
    file_pos: usize,
    tone_phase: f32,
}

/// Opaque, never-blocking, never-empty source of fallback PCM frames.
pub struct FallbackProvider {
    file_data: Option<Arc<[u8]>>,
    tone_frequency_hz: f32,
    silence_frame: Bytes,
    /// Highest-priority tier still considered usable; only ever increases.
    tier: AtomicU8,
    state: Mutex<State>,
}

impl FallbackProvider {
    /// Builds the provider. `file_pcm`, if present, must already be decoded
    /// to the canonical format (48kHz/stereo/s16le); an empty or
    /// non-frame-aligned buffer is treated as a failed file-tier
    /// initialization and the provider falls through to the tone tier.
    pub fn new(file_pcm: Option<Vec<u8>>, tone_frequency_hz: f32) -> Self {
        let file_data = file_pcm
            .filter(|data| !data.is_empty() && data.len() % CANONICAL_FRAME_BYTES == 0)
            .map(Arc::<[u8]>::from);

        let tier = if file_data.is_some() {
            TIER_FILE
        } else {
            TIER_TONE
        };

        Self {
            file_data,
            tone_frequency_hz,
            silence_frame: Bytes::from(vec![0u8; CANONICAL_FRAME_BYTES]),
            tier: AtomicU8::new(tier),
            state: Mutex::new(State {
                file_pos: 0,
                tone_phase: 0.0,
            }),
        }
    }

    /// Returns exactly one canonical PCM frame. Never blocks, never errors,
    /// never returns empty.
    pub fn next_frame(&self) -> Bytes {
        loop {
            match self.tier.load(Ordering::Relaxed) {
                TIER_FILE => {
                    if let Some(frame) = self.next_file_frame() {
                        return frame;
                    }
                    self.downgrade(TIER_FILE, TIER_TONE);
                }
                TIER_TONE => return self.next_tone_frame(),
                _ => return self.silence_frame.clone(),
            }
        }
    }

    fn next_file_frame(&self) -> Option<Bytes> {
        let data = self.file_data.as_ref()?;
        if data.is_empty() {
            return None;
        }
        let mut state = self.state.lock();
        let start = state.file_pos;
        let end = start + CANONICAL_FRAME_BYTES;
        let frame = if end <= data.len() {
            Bytes::copy_from_slice(&data[start..end])
        } else {
            // Wrap around: stitch the tail of the buffer with its head.
            let mut buf = Vec::with_capacity(CANONICAL_FRAME_BYTES);
            buf.extend_from_slice(&data[start..]);
            buf.extend_from_slice(&data[..CANONICAL_FRAME_BYTES - (data.len() - start)]);
            Bytes::from(buf)
        };
        state.file_pos = end % data.len();
        Some(frame)
    }

    fn next_tone_frame(&self) -> Bytes {
        let mut state = self.state.lock();
        let mut phase = state.tone_phase;
        let step = 2.0 * std::f32::consts::PI * self.tone_frequency_hz
            / crate::protocol_constants::SAMPLE_RATE as f32;

        let samples_per_channel = crate::protocol_constants::SAMPLES_PER_FRAME as usize;
        let mut buf = Vec::with_capacity(CANONICAL_FRAME_BYTES);
        for _ in 0..samples_per_channel {
            let sample = (phase.sin() * i16::MAX as f32 * 0.25) as i16;
            let bytes = sample.to_le_bytes();
            // Interleaved stereo: both channels carry the same tone.
            buf.extend_from_slice(&bytes);
            buf.extend_from_slice(&bytes);
            phase += step;
            if phase >= 2.0 * std::f32::consts::PI {
                phase -= 2.0 * std::f32::consts::PI;
            }
        }
        state.tone_phase = phase;
        Bytes::from(buf)
    }

    fn downgrade(&self, from: u8, to: u8) {
        let _ = self
            .tier
            .compare_exchange(from, to, Ordering::Relaxed, Ordering::Relaxed);
    }

    /// Explicit operator override (`POST /control/source`), distinct from
    /// the automatic failure-driven downgrade above but bound by the same
    /// "only ever moves down" invariant: requesting a tier at or above the
    /// one already in effect is a no-op; requesting one below it is
    /// honored. Returns the tier actually in effect afterward.
    pub fn request_tier(&self, tier: u8) -> u8 {
        self.tier.fetch_max(tier.min(TIER_SILENCE), Ordering::Relaxed);
        self.tier.load(Ordering::Relaxed)
    }

    /// Parses a `/control/source` tier name (`"file"` / `"tone"` /
    /// `"silence"`), if recognized.
    pub fn tier_from_name(name: &str) -> Option<u8> {
        match name {
            "file" => Some(TIER_FILE),
            "tone" => Some(TIER_TONE),
            "silence" => Some(TIER_SILENCE),
            _ => None,
        }
    }

    /// Name of the tier this provider would currently serve from
    /// `next_frame()`, for telemetry (`GET /status`'s source-mode field).
    pub fn current_tier_name(&self) -> &'static str {
        match self.tier.load(Ordering::Relaxed) {
            TIER_FILE => "file",
            TIER_TONE => "tone",
            _ => "silence",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_tone_when_no_file_configured() {
        let provider = FallbackProvider::new(None, 440.0);
        let frame = provider.next_frame();
        assert_eq!(frame.len(), CANONICAL_FRAME_BYTES);
    }

    #[test]
    fn falls_back_to_tone_when_file_misaligned() {
        let provider = FallbackProvider::new(Some(vec![0u8; 7]), 440.0);
        assert_eq!(provider.tier.load(Ordering::Relaxed), TIER_TONE);
    }

    #[test]
    fn silence_frame_is_all_zero() {
        let provider = FallbackProvider::new(None, 440.0);
        provider.tier.store(TIER_SILENCE, Ordering::Relaxed);
        let frame = provider.next_frame();
        assert!(frame.iter().all(|&b| b == 0));
    }

    #[test]
    fn tone_is_phase_continuous_across_frames() {
        let provider = FallbackProvider::new(None, 440.0);
        let first = provider.next_frame();
        let second = provider.next_frame();

        // The first sample of frame 2 should equal sin(phase_after_frame_1),
        // i.e. exactly where frame 1 left the phase accumulator.
        let step = 2.0 * std::f32::consts::PI * 440.0
            / crate::protocol_constants::SAMPLE_RATE as f32;
        let mut phase = 0.0f32;
        for _ in 0..crate::protocol_constants::SAMPLES_PER_FRAME {
            phase += step;
        }
        phase %= 2.0 * std::f32::consts::PI;
        let expected_sample = (phase.sin() * i16::MAX as f32 * 0.25) as i16;

        let got_sample = i16::from_le_bytes([second[0], second[1]]);
        assert_eq!(got_sample, expected_sample);
        assert_eq!(first.len(), CANONICAL_FRAME_BYTES);
    }

    #[test]
    fn file_tier_loops_forever() {
        let pcm = vec![7u8; CANONICAL_FRAME_BYTES * 2];
        let provider = FallbackProvider::new(Some(pcm.clone()), 440.0);
        let a = provider.next_frame();
        let b = provider.next_frame();
        let c = provider.next_frame();
        assert_eq!(&a[..], &pcm[..CANONICAL_FRAME_BYTES]);
        assert_eq!(&b[..], &pcm[CANONICAL_FRAME_BYTES..]);
        assert_eq!(&c[..], &pcm[..CANONICAL_FRAME_BYTES]);
    }

    #[test]
    fn request_tier_only_moves_forward() {
        let provider = FallbackProvider::new(None, 440.0);
        assert_eq!(provider.tier.load(Ordering::Relaxed), TIER_TONE);
        assert_eq!(provider.request_tier(TIER_SILENCE), TIER_SILENCE);
        assert_eq!(provider.request_tier(TIER_FILE), TIER_SILENCE);
    }

    #[test]
    fn tier_from_name_parses_known_names_only() {
        assert_eq!(FallbackProvider::tier_from_name("file"), Some(TIER_FILE));
        assert_eq!(FallbackProvider::tier_from_name("tone"), Some(TIER_TONE));
        assert_eq!(FallbackProvider::tier_from_name("silence"), Some(TIER_SILENCE));
        assert_eq!(FallbackProvider::tier_from_name("bogus"), None);
    }

    #[test]
    fn current_tier_name_reflects_active_tier() {
        let provider = FallbackProvider::new(None, 440.0);
        assert_eq!(provider.current_tier_name(), "tone");
        provider.request_tier(TIER_SILENCE);
        assert_eq!(provider.current_tier_name(), "silence");
    }
}
