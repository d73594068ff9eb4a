//! Relaycast egress
//!
//! Bridges a broadcast's SFU producers to external RTMP platforms through
//! supervised encoder processes.
//!
//! ## Architecture
//!
//! - **`FanoutBridge`**: builds and tears down per-broadcast pipelines (relay
//!   endpoints, consumers, SDP descriptor, keyframe timer, encoder jobs)
//! - **`EgressSupervisor`**: per-process state machine with bounded
//!   exponential backoff and a stability window
//! - **`EncoderLauncher`**: seam between the supervisor and the encoder
//!   binary; `FfmpegLauncher` spawns the real thing
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relaycast_egress::{BridgeConfig, EgressSupervisor, FanoutBridge, FfmpegLauncher, PipelineRequest, RetryPolicy};
//!
//! let supervisor = EgressSupervisor::new(Arc::new(FfmpegLauncher::new(Default::default())), RetryPolicy::default());
//! let bridge = FanoutBridge::new(registry, supervisor, BridgeConfig::default())?;
//! bridge.create_pipeline(PipelineRequest::new(id, video, audio, destinations)).await?;
//! ```

mod bridge;
mod descriptor;
mod encoder;
mod error;
mod ports;
mod supervisor;
mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use bridge::{BridgeConfig, BridgeEvent, CloseReason, FanoutBridge, PipelineInfo, PipelineRequest};
pub use descriptor::{DescriptorFile, MediaDescription, StreamDescriptor};
pub use encoder::{EncodeJob, EncoderConfig, EncoderExit, EncoderHandle, EncoderLauncher, FfmpegLauncher};
pub use error::{EgressError, EgressResult};
pub use ports::{PortAllocator, PortLease, PORTS_PER_BLOCK};
pub use supervisor::{
    EgressEvent, EgressStats, EgressSupervisor, RetryPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY,
    DEFAULT_MAX_RETRIES, DEFAULT_STABILITY_WINDOW,
};
pub use types::{
    validate_destinations, Destination, DestinationId, EgressKey, EgressState, EgressStrategy,
    EgressTarget,
};
