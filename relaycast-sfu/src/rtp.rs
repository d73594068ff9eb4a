//! Typed RTP and codec parameters
//!
//! The SFU hands back loosely-typed parameter records; they are validated once
//! here into [`RtpStreamParams`] and nothing downstream looks at the raw form.

use crate::error::{SfuError, SfuResult};
use crate::types::MediaKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Codecs the relay understands end to end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaCodec {
    Opus,
    H264,
    Vp8,
    Vp9,
}

impl MediaCodec {
    /// Parse a MIME type such as `video/H264` (case-insensitive)
    pub fn from_mime(mime_type: &str) -> SfuResult<Self> {
        match mime_type.to_ascii_lowercase().as_str() {
            "audio/opus" => Ok(Self::Opus),
            "video/h264" => Ok(Self::H264),
            "video/vp8" => Ok(Self::Vp8),
            "video/vp9" => Ok(Self::Vp9),
            other => Err(SfuError::UnsupportedCodec(other.to_string())),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        match self {
            Self::Opus => MediaKind::Audio,
            Self::H264 | Self::Vp8 | Self::Vp9 => MediaKind::Video,
        }
    }

    #[must_use]
    pub const fn mime_type(&self) -> &'static str {
        match self {
            Self::Opus => "audio/opus",
            Self::H264 => "video/H264",
            Self::Vp8 => "video/VP8",
            Self::Vp9 => "video/VP9",
        }
    }

    /// Encoding name as written in an SDP `a=rtpmap` line
    #[must_use]
    pub const fn encoding_name(&self) -> &'static str {
        match self {
            Self::Opus => "opus",
            Self::H264 => "H264",
            Self::Vp8 => "VP8",
            Self::Vp9 => "VP9",
        }
    }
}

impl fmt::Display for MediaCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encoding_name())
    }
}

/// A codec a router is willing to route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecCapability {
    pub codec: MediaCodec,
    pub clock_rate: u32,
    pub channels: Option<u8>,
    pub parameters: BTreeMap<String, String>,
}

impl CodecCapability {
    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        self.codec.kind()
    }
}

/// Codec set every broadcast router is created with
#[must_use]
pub fn default_codec_capabilities() -> Vec<CodecCapability> {
    let mut h264_params = BTreeMap::new();
    h264_params.insert("packetization-mode".to_string(), "1".to_string());
    h264_params.insert("profile-level-id".to_string(), "42e01f".to_string());
    h264_params.insert("level-asymmetry-allowed".to_string(), "1".to_string());

    vec![
        CodecCapability {
            codec: MediaCodec::Opus,
            clock_rate: 48_000,
            channels: Some(2),
            parameters: BTreeMap::new(),
        },
        CodecCapability {
            codec: MediaCodec::Vp8,
            clock_rate: 90_000,
            channels: None,
            parameters: BTreeMap::new(),
        },
        CodecCapability {
            codec: MediaCodec::H264,
            clock_rate: 90_000,
            channels: None,
            parameters: h264_params,
        },
    ]
}

/// Parameters exactly as reported by the SFU for a consumer
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawRtpParameters {
    pub mime_type: String,
    pub clock_rate: u32,
    pub payload_type: u8,
    pub ssrc: Option<u32>,
    pub channels: Option<u8>,
    pub fmtp: Option<String>,
}

/// Validated parameters of one RTP stream leaving the SFU
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpStreamParams {
    pub codec: MediaCodec,
    pub clock_rate: u32,
    pub payload_type: u8,
    pub ssrc: Option<u32>,
    pub channels: Option<u8>,
    pub fmtp: Option<String>,
}

impl RtpStreamParams {
    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        self.codec.kind()
    }
}

impl TryFrom<RawRtpParameters> for RtpStreamParams {
    type Error = SfuError;

    fn try_from(raw: RawRtpParameters) -> SfuResult<Self> {
        let codec = MediaCodec::from_mime(&raw.mime_type)?;

        // Static payload types end at 34, dynamic ones live in 96..=127
        if !(raw.payload_type <= 34 || (96..=127).contains(&raw.payload_type)) {
            return Err(SfuError::UnsupportedCodec(format!(
                "payload type {} is outside the static and dynamic RTP ranges",
                raw.payload_type
            )));
        }

        if raw.clock_rate == 0 {
            return Err(SfuError::UnsupportedCodec(format!(
                "{} reported a zero clock rate",
                raw.mime_type
            )));
        }

        let channels = match codec.kind() {
            MediaKind::Audio => Some(raw.channels.unwrap_or(2)),
            MediaKind::Video => None,
        };

        Ok(Self {
            codec,
            clock_rate: raw.clock_rate,
            payload_type: raw.payload_type,
            ssrc: raw.ssrc,
            channels,
            fmtp: raw.fmtp.filter(|f| !f.trim().is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(mime: &str, pt: u8) -> RawRtpParameters {
        RawRtpParameters {
            mime_type: mime.to_string(),
            clock_rate: 90_000,
            payload_type: pt,
            ssrc: Some(1234),
            channels: None,
            fmtp: Some("packetization-mode=1".to_string()),
        }
    }

    #[test]
    fn test_mime_parsing_is_case_insensitive() {
        assert_eq!(MediaCodec::from_mime("VIDEO/h264").unwrap(), MediaCodec::H264);
        assert_eq!(MediaCodec::from_mime("audio/OPUS").unwrap(), MediaCodec::Opus);
        assert!(matches!(
            MediaCodec::from_mime("video/AV1"),
            Err(SfuError::UnsupportedCodec(_))
        ));
    }

    #[test]
    fn test_validation_accepts_dynamic_payload_type() {
        let params = RtpStreamParams::try_from(raw("video/H264", 102)).unwrap();
        assert_eq!(params.codec, MediaCodec::H264);
        assert_eq!(params.payload_type, 102);
        assert_eq!(params.channels, None);
    }

    #[test]
    fn test_validation_rejects_reserved_payload_type() {
        let err = RtpStreamParams::try_from(raw("video/VP8", 72)).unwrap_err();
        assert!(matches!(err, SfuError::UnsupportedCodec(_)));
    }

    #[test]
    fn test_audio_defaults_to_stereo() {
        let mut opus = raw("audio/opus", 111);
        opus.clock_rate = 48_000;
        opus.fmtp = Some("  ".to_string());
        let params = RtpStreamParams::try_from(opus).unwrap();
        assert_eq!(params.channels, Some(2));
        assert_eq!(params.fmtp, None);
    }

    #[test]
    fn test_default_capabilities_cover_both_kinds() {
        let caps = default_codec_capabilities();
        assert!(caps.iter().any(|c| c.kind() == MediaKind::Audio));
        assert!(caps.iter().any(|c| c.kind() == MediaKind::Video));
    }
}
