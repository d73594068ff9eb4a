//! Relaycast SFU orchestration
//!
//! Lifecycle management on top of an external WebRTC SFU library. The SFU
//! itself (ICE, DTLS, SRTP, RTP forwarding) sits behind the traits in
//! [`backend`]; this crate owns what happens around it.
//!
//! ## Architecture
//!
//! - **`WorkerPool`**: fixed-size pool of SFU worker processes, replaced on death
//! - **`RouterRegistry`**: one routing context per broadcast, deduplicating
//!   concurrent creation and evicting routers whose worker died
//! - **`RtpStreamParams`**: codec parameters validated once at the SFU boundary
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relaycast_sfu::{default_codec_capabilities, PoolConfig, RouterRegistry, WorkerPool};
//!
//! let pool = WorkerPool::init(backend, PoolConfig::default()).await?;
//! let registry = RouterRegistry::new(pool, default_codec_capabilities());
//! let router = registry.get_or_create_router(&"broadcast-1".into()).await?;
//! ```

pub mod backend;
mod config;
mod error;
mod pool;
mod registry;
mod rtp;
mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use backend::{
    RelayConsumer, RelayEndpoint, RelayEndpointOptions, SfuBackend, SfuRouter, SfuWorker,
};
pub use config::{PoolConfig, MIN_POOL_SIZE};
pub use error::{SfuError, SfuResult};
pub use pool::{PoolEvent, PoolStatus, WorkerDeathListener, WorkerPool};
pub use registry::RouterRegistry;
pub use rtp::{
    default_codec_capabilities, CodecCapability, MediaCodec, RawRtpParameters, RtpStreamParams,
};
pub use types::{BroadcastId, ConsumerId, EndpointId, MediaKind, ProducerId, RouterId, WorkerId};
