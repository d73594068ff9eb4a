//! Encoding quality ladder
//!
//! Ordered from highest quality (index 0) to the low-bandwidth fallback.
//! Automatic adjustments only ever move to an adjacent rung.

use crate::error::{AbrError, AbrResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Profile a fresh broadcast starts on: safe for most uplinks and platforms.
pub const DEFAULT_PROFILE: &str = "720p";

/// One rung of the ladder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitrateProfile {
    pub name: String,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
}

impl BitrateProfile {
    pub fn new(
        name: impl Into<String>,
        video_bitrate_kbps: u32,
        audio_bitrate_kbps: u32,
        (width, height): (u32, u32),
        framerate: u32,
    ) -> Self {
        Self {
            name: name.into(),
            video_bitrate_kbps,
            audio_bitrate_kbps,
            width,
            height,
            framerate,
        }
    }

    #[must_use]
    pub const fn total_bitrate_kbps(&self) -> u32 {
        self.video_bitrate_kbps + self.audio_bitrate_kbps
    }
}

impl fmt::Display for BitrateProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}x{}@{} {}k/{}k)",
            self.name,
            self.width,
            self.height,
            self.framerate,
            self.video_bitrate_kbps,
            self.audio_bitrate_kbps
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitrateLadder {
    profiles: Vec<BitrateProfile>,
}

impl BitrateLadder {
    /// Build a ladder from profiles already sorted highest first.
    pub fn new(profiles: Vec<BitrateProfile>) -> AbrResult<Self> {
        if profiles.is_empty() {
            return Err(AbrError::InvalidLadder("ladder has no profiles".to_string()));
        }
        if profiles
            .windows(2)
            .any(|w| w[0].total_bitrate_kbps() < w[1].total_bitrate_kbps())
        {
            return Err(AbrError::InvalidLadder(
                "profiles must be ordered from highest to lowest bitrate".to_string(),
            ));
        }
        Ok(Self { profiles })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&BitrateProfile> {
        self.profiles.get(index)
    }

    #[must_use]
    pub fn profiles(&self) -> &[BitrateProfile] {
        &self.profiles
    }

    pub fn index_of(&self, name: &str) -> AbrResult<usize> {
        self.profiles
            .iter()
            .position(|p| p.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| AbrError::UnknownProfile(name.to_string()))
    }

    /// One rung down, if not already at the bottom
    #[must_use]
    pub fn lower(&self, index: usize) -> Option<usize> {
        (index + 1 < self.profiles.len()).then_some(index + 1)
    }

    /// One rung up, if not already at the top
    #[must_use]
    pub fn higher(&self, index: usize) -> Option<usize> {
        index.checked_sub(1)
    }
}

impl Default for BitrateLadder {
    fn default() -> Self {
        Self {
            profiles: vec![
                BitrateProfile::new("1080p60", 6000, 160, (1920, 1080), 60),
                BitrateProfile::new("1080p", 4500, 128, (1920, 1080), 30),
                BitrateProfile::new("720p60", 4000, 128, (1280, 720), 60),
                BitrateProfile::new(DEFAULT_PROFILE, 2500, 128, (1280, 720), 30),
                BitrateProfile::new("480p", 1200, 96, (854, 480), 30),
                BitrateProfile::new("360p", 800, 96, (640, 360), 30),
                BitrateProfile::new("240p", 400, 64, (426, 240), 24),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ladder_is_descending() {
        let ladder = BitrateLadder::default();
        assert!(BitrateLadder::new(ladder.profiles().to_vec()).is_ok());
        assert_eq!(ladder.get(0).unwrap().name, "1080p60");
        assert_eq!(ladder.get(ladder.len() - 1).unwrap().name, "240p");
    }

    #[test]
    fn test_default_profile_is_not_the_top() {
        let ladder = BitrateLadder::default();
        let index = ladder.index_of(DEFAULT_PROFILE).unwrap();
        assert!(index > 0);
        assert!(index < ladder.len() - 1);
    }

    #[test]
    fn test_neighbours_stop_at_the_ends() {
        let ladder = BitrateLadder::default();
        assert_eq!(ladder.higher(0), None);
        assert_eq!(ladder.higher(3), Some(2));
        assert_eq!(ladder.lower(3), Some(4));
        assert_eq!(ladder.lower(ladder.len() - 1), None);
    }

    #[test]
    fn test_rejects_unordered_ladder() {
        let result = BitrateLadder::new(vec![
            BitrateProfile::new("low", 500, 64, (640, 360), 30),
            BitrateProfile::new("high", 4000, 128, (1920, 1080), 30),
        ]);
        assert!(matches!(result, Err(AbrError::InvalidLadder(_))));
        assert!(matches!(BitrateLadder::new(Vec::new()), Err(AbrError::InvalidLadder(_))));
    }

    #[test]
    fn test_index_of_unknown_profile() {
        let ladder = BitrateLadder::default();
        assert_eq!(ladder.index_of("720P").unwrap(), 3);
        assert!(matches!(ladder.index_of("8k"), Err(AbrError::UnknownProfile(_))));
    }
}
