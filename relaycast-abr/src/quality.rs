//! Network sample classification
//!
//! ## Quality tier
//! A score starts at 5 and loses points for RTT, packet loss, encoder frame
//! drops and (when known) low available bandwidth:
//! - 5: Excellent
//! - 4: Good
//! - 3: Fair
//! - 2: Poor
//! - 0-1: Critical
//!
//! ## Verdict
//! The tier plus hard limits decide whether a sample pushes toward a
//! downgrade, toward an upgrade, or neither.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One observation of the outbound path
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NetworkSample {
    /// Packet loss rate (0.0 - 1.0)
    pub packet_loss: f32,
    /// Fraction of frames the encoder dropped (0.0 - 1.0)
    pub drop_rate: f32,
    /// Round-trip time in milliseconds
    pub rtt_ms: u32,
    /// Available bandwidth estimate, when the source provides one
    pub bandwidth_kbps: Option<u32>,
    pub jitter_ms: Option<u32>,
}

impl NetworkSample {
    #[must_use]
    pub const fn new(packet_loss: f32, drop_rate: f32, rtt_ms: u32) -> Self {
        Self {
            packet_loss,
            drop_rate,
            rtt_ms,
            bandwidth_kbps: None,
            jitter_ms: None,
        }
    }

    #[must_use]
    pub const fn with_bandwidth(mut self, bandwidth_kbps: u32) -> Self {
        self.bandwidth_kbps = Some(bandwidth_kbps);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Critical,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl QualityTier {
    #[must_use]
    pub const fn from_score(score: u8) -> Self {
        match score {
            0 | 1 => Self::Critical,
            2 => Self::Poor,
            3 => Self::Fair,
            4 => Self::Good,
            _ => Self::Excellent,
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Critical => "critical",
            Self::Poor => "poor",
            Self::Fair => "fair",
            Self::Good => "good",
            Self::Excellent => "excellent",
        };
        f.write_str(name)
    }
}

/// Limits separating a clearly bad sample from a clearly good one
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleThresholds {
    pub max_packet_loss: f32,
    pub max_drop_rate: f32,
    pub max_rtt_ms: u32,
    pub good_packet_loss: f32,
    pub good_drop_rate: f32,
    pub good_rtt_ms: u32,
}

impl Default for SampleThresholds {
    fn default() -> Self {
        Self {
            max_packet_loss: 0.05,
            max_drop_rate: 0.05,
            max_rtt_ms: 300,
            good_packet_loss: 0.01,
            good_drop_rate: 0.01,
            good_rtt_ms: 150,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Counts toward a downgrade
    Bad,
    /// Counts toward an upgrade
    Good,
    /// Neither; resets both streaks
    Stable,
}

/// Score (0-5) for a sample
#[must_use]
pub fn quality_score(sample: &NetworkSample) -> u8 {
    let mut score: i8 = 5;

    if sample.rtt_ms >= 300 {
        score -= 2;
    } else if sample.rtt_ms >= 150 {
        score -= 1;
    }

    if sample.packet_loss >= 0.10 {
        score -= 3;
    } else if sample.packet_loss >= 0.05 {
        score -= 2;
    } else if sample.packet_loss >= 0.02 {
        score -= 1;
    }

    if sample.drop_rate >= 0.10 {
        score -= 2;
    } else if sample.drop_rate >= 0.03 {
        score -= 1;
    }

    match sample.bandwidth_kbps {
        Some(bw) if bw < 300 => score -= 2,
        Some(bw) if bw < 800 => score -= 1,
        _ => {}
    }

    score.clamp(0, 5) as u8
}

#[must_use]
pub fn classify(sample: &NetworkSample) -> QualityTier {
    QualityTier::from_score(quality_score(sample))
}

/// Decide which streak a sample feeds
#[must_use]
pub fn judge(sample: &NetworkSample, thresholds: &SampleThresholds) -> (QualityTier, Verdict) {
    let tier = classify(sample);

    let bad = tier <= QualityTier::Poor
        || sample.packet_loss > thresholds.max_packet_loss
        || sample.drop_rate > thresholds.max_drop_rate
        || sample.rtt_ms > thresholds.max_rtt_ms;
    if bad {
        return (tier, Verdict::Bad);
    }

    let good = tier >= QualityTier::Good
        && sample.packet_loss < thresholds.good_packet_loss
        && sample.drop_rate < thresholds.good_drop_rate
        && sample.rtt_ms < thresholds.good_rtt_ms;
    if good {
        (tier, Verdict::Good)
    } else {
        (tier, Verdict::Stable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excellent_sample() {
        let sample = NetworkSample::new(0.0, 0.0, 30).with_bandwidth(8000);
        assert_eq!(classify(&sample), QualityTier::Excellent);
        assert_eq!(judge(&sample, &SampleThresholds::default()).1, Verdict::Good);
    }

    #[test]
    fn test_poor_sample_is_bad() {
        let sample = NetworkSample::new(0.06, 0.0, 200);
        assert_eq!(quality_score(&sample), 2);
        assert_eq!(judge(&sample, &SampleThresholds::default()), (QualityTier::Poor, Verdict::Bad));
    }

    #[test]
    fn test_critical_sample() {
        let sample = NetworkSample::new(0.25, 0.2, 450).with_bandwidth(200);
        assert_eq!(quality_score(&sample), 0);
        assert_eq!(classify(&sample), QualityTier::Critical);
    }

    #[test]
    fn test_threshold_breach_is_bad_even_with_good_tier() {
        // Score stays high but RTT alone is over the limit
        let sample = NetworkSample::new(0.0, 0.0, 320);
        assert_eq!(classify(&sample), QualityTier::Fair);
        assert_eq!(judge(&sample, &SampleThresholds::default()).1, Verdict::Bad);

        let thresholds = SampleThresholds { max_rtt_ms: 100, ..Default::default() };
        let sample = NetworkSample::new(0.0, 0.0, 120);
        assert_eq!(classify(&sample), QualityTier::Excellent);
        assert_eq!(judge(&sample, &thresholds).1, Verdict::Bad);
    }

    #[test]
    fn test_fair_sample_is_stable() {
        let sample = NetworkSample::new(0.03, 0.0, 160);
        assert_eq!(classify(&sample), QualityTier::Fair);
        assert_eq!(judge(&sample, &SampleThresholds::default()).1, Verdict::Stable);
    }

    #[test]
    fn test_good_tier_with_moderate_loss_is_stable() {
        let sample = NetworkSample::new(0.02, 0.0, 50);
        assert_eq!(classify(&sample), QualityTier::Good);
        assert_eq!(judge(&sample, &SampleThresholds::default()).1, Verdict::Stable);
    }
}
