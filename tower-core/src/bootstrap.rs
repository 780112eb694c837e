//! Composition root: the single place where every Tower component is
//! constructed and wired together. No process-wide mutable singletons —
//! everything is built here once and handed out by ownership or shared
//! reference.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::encoder::{EncoderSupervisor, EncoderSupervisorConfig};
use crate::error::TowerResult;
use crate::fallback::FallbackProvider;
use crate::fanout::BroadcastFanout;
use crate::ingest::IngestFramer;
use crate::manager::EncoderManager;
use crate::protocol_constants::CANONICAL_FRAME_BYTES;
use crate::pump::AudioPump;
use crate::ring::{FrameRing, OverflowPolicy};

/// Everything the transformed copy needed to run the broadcaster, wired.
/// Owned by the binary's `main`, which is responsible for calling
/// [`BootstrappedTower::start`] and [`BootstrappedTower::stop`].
pub struct BootstrappedTower {
    pub pcm_ring: Arc<FrameRing>,
    pub fallback: Arc<FallbackProvider>,
    pub supervisor: Arc<EncoderSupervisor>,
    pub manager: Arc<EncoderManager>,
    pub pump: Arc<AudioPump>,
    pub fanout: Arc<BroadcastFanout>,
    pub ingest: Arc<IngestFramer>,
    encoder_enabled: bool,
    allow_subprocess: bool,
    pcm_ingest_addr: SocketAddr,
}

/// Settings needed to wire the broadcaster. Deliberately a plain struct
/// rather than the full `ServerConfig` (which also carries HTTP bind
/// settings irrelevant to the audio core) so this module has no dependency
/// on `tower-server`.
pub struct BootstrapConfig {
    pub pcm_ring_capacity: usize,
    pub mp3_ring_capacity: usize,
    pub grace: Duration,
    pub client_timeout: Duration,
    pub bitrate_kbps: u32,
    pub encoder_path: String,
    pub encoder_startup_timeout: Duration,
    pub encoder_stall_threshold: Duration,
    pub encoder_max_restarts: u32,
    pub encoder_backoff_schedule: Vec<Duration>,
    pub encoder_enabled: bool,
    pub allow_subprocess_in_tests: bool,
    pub fallback_file_pcm: Option<Vec<u8>>,
    pub tone_frequency_hz: f32,
    pub pcm_ingest_addr: SocketAddr,
}

/// Builds every component per the wiring order spec.md §4.5 requires:
/// FallbackProvider first, then the supervisor, so routing can already
/// emit valid PCM before the supervisor is ever started.
pub fn bootstrap(config: BootstrapConfig) -> BootstrappedTower {
    let pcm_ring = Arc::new(FrameRing::new(
        config.pcm_ring_capacity,
        CANONICAL_FRAME_BYTES,
        OverflowPolicy::DropNewest,
    ));
    // MP3 frames are variable-length (CBR/VBR), unlike the fixed-size PCM
    // ring, so this uses the variable-size constructor.
    let mp3_ring = Arc::new(FrameRing::new_variable(
        config.mp3_ring_capacity,
        OverflowPolicy::DropOldest,
    ));

    let fallback = Arc::new(FallbackProvider::new(
        config.fallback_file_pcm,
        config.tone_frequency_hz,
    ));

    let supervisor_config = EncoderSupervisorConfig {
        encoder_path: config.encoder_path,
        bitrate_kbps: config.bitrate_kbps,
        startup_timeout: config.encoder_startup_timeout,
        stall_threshold: config.encoder_stall_threshold,
        max_restarts: config.encoder_max_restarts,
        backoff_schedule: config.encoder_backoff_schedule,
    };
    let supervisor = Arc::new(EncoderSupervisor::new(supervisor_config, Arc::clone(&mp3_ring)));

    let manager = Arc::new(EncoderManager::new(
        Arc::clone(&fallback),
        Arc::clone(&supervisor),
        config.grace,
    ));

    let pump = Arc::new(AudioPump::new(
        Arc::clone(&pcm_ring),
        Arc::clone(&fallback),
        Arc::clone(&manager),
    ));

    let fanout = Arc::new(BroadcastFanout::new(
        Arc::clone(&manager),
        config.client_timeout,
        config.bitrate_kbps,
    ));

    let ingest = Arc::new(IngestFramer::new(Arc::clone(&pcm_ring)));

    BootstrappedTower {
        pcm_ring,
        fallback,
        supervisor,
        manager,
        pump,
        fanout,
        ingest,
        encoder_enabled: config.encoder_enabled,
        allow_subprocess: config.allow_subprocess_in_tests || config.encoder_enabled,
        pcm_ingest_addr: config.pcm_ingest_addr,
    }
}

impl BootstrappedTower {
    /// Starts every long-lived thread: the encoder (if enabled), the pump,
    /// the fanout dispatcher, and the ingest listener.
    pub fn start(&self) -> TowerResult<()> {
        self.manager.start(self.encoder_enabled, self.allow_subprocess)?;
        self.pump.start();
        self.fanout.start();
        self.ingest.start(self.pcm_ingest_addr)?;
        Ok(())
    }

    /// Stops every component. Each component's own `stop()` already bounds
    /// itself to roughly 200ms; this just sequences them.
    pub fn stop(&self) {
        self.ingest.stop();
        self.fanout.stop();
        self.pump.stop();
        self.manager.stop();
    }
}
