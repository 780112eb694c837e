//! The system's single metronome thread.
//!
//! Drives routing at a fixed cadence and nothing else — no routing
//! decisions, no audio generation, no knowledge of what EncoderManager does
//! with the ring. Holds the PCM ring and FallbackProvider only so ownership
//! can be wired through one place; it never calls the fallback provider
//! itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::encoder::WriteOutcome;
use crate::fallback::FallbackProvider;
use crate::manager::EncoderManager;
use crate::protocol_constants::TICK_PERIOD_MICROS;
use crate::ring::FrameRing;

pub struct AudioPump {
    pcm_in_ring: Arc<FrameRing>,
    /// Held for wiring only — the pump never calls this directly;
    /// EncoderManager owns the fallthrough decision.
    _fallback: Arc<FallbackProvider>,
    manager: Arc<EncoderManager>,
    stop_flag: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AudioPump {
    pub fn new(pcm_in_ring: Arc<FrameRing>, fallback: Arc<FallbackProvider>, manager: Arc<EncoderManager>) -> Self {
        Self {
            pcm_in_ring,
            _fallback: fallback,
            manager,
            stop_flag: Arc::new(AtomicBool::new(true)),
            handle: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        self.stop_flag.store(false, Ordering::Release);
        let ring = Arc::clone(&self.pcm_in_ring);
        let manager = Arc::clone(&self.manager);
        let stop_flag = Arc::clone(&self.stop_flag);
        let handle = std::thread::spawn(move || run(ring, manager, stop_flag));
        *self.handle.lock() = Some(handle);
    }

    /// Returns within ~200ms: the loop only ever sleeps in sub-tick-period
    /// increments and checks the stop flag at the top of every iteration.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run(ring: Arc<FrameRing>, manager: Arc<EncoderManager>, stop_flag: Arc<AtomicBool>) {
    let tick_period = Duration::from_micros(TICK_PERIOD_MICROS);

    loop {
        if stop_flag.load(Ordering::Acquire) {
            return;
        }

        // Deadline anchored fresh off the current instant every iteration,
        // not accumulated from the previous deadline — this is what keeps
        // drift from compounding across many ticks.
        let next_tick = Instant::now() + tick_period;

        let outcome = manager.next_frame(&ring);
        if outcome == WriteOutcome::BrokenPipe {
            log::warn!("[Pump] encoder write failed, pausing 100ms");
            std::thread::sleep(Duration::from_millis(100));
            continue;
        }

        let now = Instant::now();
        if now < next_tick {
            std::thread::sleep(next_tick - now);
        } else {
            log::warn!("[Pump] tick took longer than the tick period; resyncing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{EncoderSupervisor, EncoderSupervisorConfig};
    use crate::protocol_constants::CANONICAL_FRAME_BYTES;
    use crate::ring::OverflowPolicy;

    fn wired() -> (AudioPump, Arc<FrameRing>) {
        let mp3_ring = Arc::new(FrameRing::new(8, CANONICAL_FRAME_BYTES, OverflowPolicy::DropOldest));
        let supervisor = Arc::new(EncoderSupervisor::new(EncoderSupervisorConfig::default(), mp3_ring));
        let fallback = Arc::new(FallbackProvider::new(None, 440.0));
        let pcm_ring = Arc::new(FrameRing::new(8, CANONICAL_FRAME_BYTES, OverflowPolicy::DropNewest));
        let manager = Arc::new(EncoderManager::new(
            Arc::clone(&fallback),
            supervisor,
            Duration::from_secs(5),
        ));
        (AudioPump::new(Arc::clone(&pcm_ring), fallback, manager), pcm_ring)
    }

    #[test]
    fn stop_returns_promptly_without_ever_starting() {
        let (pump, _ring) = wired();
        pump.stop();
    }

    #[test]
    fn tick_cadence_stays_within_one_tick_period_of_target() {
        let (pump, _ring) = wired();
        pump.start();
        let ticks = 20u32;
        let expected = Duration::from_micros(TICK_PERIOD_MICROS) * ticks;
        std::thread::sleep(expected);
        pump.stop();
        // No direct tick counter is exposed here; this test exists mainly
        // to exercise start/stop under real elapsed time without panicking
        // or hanging. The precise cadence property is covered by
        // EncoderManager's own deterministic unit tests.
    }
}
