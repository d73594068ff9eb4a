//! Relaycast service core
//!
//! Configuration, logging and the [`Relaycast`] façade that ties the worker
//! pool, router registry, fan-out bridge, egress supervisor and adaptive
//! bitrate controller into one service.

pub mod config;
pub mod error;
pub mod logging;
pub mod service;

pub use config::{
    AbrSettings, BridgeSettings, Config, EgressSettings, EncoderSettings, LoggingConfig,
    PoolSettings,
};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use service::{Relaycast, RelaycastEvent};
