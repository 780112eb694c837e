//! Encoder subsystem: subprocess supervision and MP3 packetizing.

pub mod packetizer;
pub mod supervisor;

pub use packetizer::Mp3Packetizer;
pub use supervisor::{
    EncoderSupervisor, EncoderSupervisorConfig, SupervisorState, WriteOutcome,
};
