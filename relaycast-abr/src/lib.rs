//! Relaycast adaptive bitrate
//!
//! Closed-loop selection of an encoding profile from a fixed ladder.
//!
//! ## Components
//!
//! - **`BitrateLadder`**: ordered profiles, highest quality first
//! - **`judge`**: turns a `NetworkSample` into a quality tier and a verdict
//! - **`AdaptiveBitrateController`**: per-broadcast hysteresis, history and
//!   sampling loop; publishes `AdjustmentEvent`s for the encoder side to apply

mod config;
mod controller;
mod error;
mod ladder;
mod quality;

pub use config::{AbrConfig, DEFAULT_HISTORY_CAPACITY};
pub use controller::{
    AdaptiveBitrateController, Adjustment, AdjustmentDirection, AdjustmentEvent,
    ControllerSnapshot, Hysteresis, NetworkProbe, Step,
};
pub use error::{AbrError, AbrResult};
pub use ladder::{BitrateLadder, BitrateProfile, DEFAULT_PROFILE};
pub use quality::{classify, judge, quality_score, NetworkSample, QualityTier, SampleThresholds, Verdict};
