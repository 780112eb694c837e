//! Tower Core — shared library for Tower, a 24/7 single-station MP3
//! broadcaster.
//!
//! This crate holds the whole audio core plus its thin HTTP surface. It is
//! used by the `tower-server` binary and is organized into several modules:
//!
//! - [`ring`]: bounded, thread-safe frame rings (PCM ingest, MP3 output)
//! - [`fallback`]: zero-latency PCM fallback source (file / tone / silence)
//! - [`encoder`]: subprocess supervision and MP3 packetizing
//! - [`manager`]: per-tick PCM routing decision authority
//! - [`pump`]: drift-free metronome driving the manager every tick
//! - [`fanout`]: listener registry and MP3 distribution loop
//! - [`ingest`]: upstream PCM TCP listener
//! - [`bootstrap`]: composition root wiring every component together
//! - [`api`]: HTTP surface (`/stream`, `/status`, `/tower/buffer`, `/control/source`)
//! - [`error`]: centralized error types

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod bootstrap;
pub mod encoder;
pub mod error;
pub mod fallback;
pub mod fanout;
pub mod ingest;
pub mod manager;
pub mod protocol_constants;
pub mod pump;
pub mod ring;

pub use api::{start_server, AppState, AppStateBuilder};
pub use bootstrap::{bootstrap, BootstrapConfig, BootstrappedTower};
pub use encoder::{EncoderSupervisor, EncoderSupervisorConfig, SupervisorState, WriteOutcome};
pub use error::{ErrorCode, TowerError, TowerResult};
pub use fallback::FallbackProvider;
pub use fanout::{BroadcastFanout, ListenerHandle};
pub use ingest::IngestFramer;
pub use manager::{EncoderManager, OperationalMode};
pub use pump::AudioPump;
pub use ring::{FrameRing, OverflowPolicy, PushOutcome, RingStats};
