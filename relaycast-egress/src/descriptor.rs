//! SDP stream descriptors handed to the encoder
//!
//! One descriptor covers a tap: a video and an audio media section, each
//! pointing at the local port its relay endpoint sends to.

use crate::error::{EgressError, EgressResult};
use relaycast_sfu::{MediaKind, RtpStreamParams};
use std::fmt::Write as _;
use std::io::Write as _;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// One RTP stream as the encoder should receive it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    pub params: RtpStreamParams,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub address: IpAddr,
    pub video: MediaDescription,
    pub audio: MediaDescription,
}

impl StreamDescriptor {
    pub fn new(address: IpAddr, video: MediaDescription, audio: MediaDescription) -> EgressResult<Self> {
        if video.params.kind() != MediaKind::Video {
            return Err(EgressError::UnsupportedCodec(format!(
                "{} cannot be used as the video stream",
                video.params.codec
            )));
        }
        if audio.params.kind() != MediaKind::Audio {
            return Err(EgressError::UnsupportedCodec(format!(
                "{} cannot be used as the audio stream",
                audio.params.codec
            )));
        }
        Ok(Self { address, video, audio })
    }

    #[must_use]
    pub fn to_sdp(&self) -> String {
        let family = if self.address.is_ipv6() { "IP6" } else { "IP4" };
        let mut sdp = String::new();
        let _ = writeln!(sdp, "v=0");
        let _ = writeln!(sdp, "o=- 0 0 IN {family} {}", self.address);
        let _ = writeln!(sdp, "s=relaycast");
        let _ = writeln!(sdp, "c=IN {family} {}", self.address);
        let _ = writeln!(sdp, "t=0 0");
        write_media(&mut sdp, "video", &self.video);
        write_media(&mut sdp, "audio", &self.audio);
        sdp
    }
}

fn write_media(sdp: &mut String, media: &str, description: &MediaDescription) {
    let params = &description.params;
    let pt = params.payload_type;
    let _ = writeln!(sdp, "m={media} {} RTP/AVP {pt}", description.port);
    let _ = writeln!(sdp, "a=rtcp:{}", description.port + 1);
    match params.channels {
        Some(channels) => {
            let _ = writeln!(
                sdp,
                "a=rtpmap:{pt} {}/{}/{channels}",
                params.codec.encoding_name(),
                params.clock_rate
            );
        }
        None => {
            let _ = writeln!(sdp, "a=rtpmap:{pt} {}/{}", params.codec.encoding_name(), params.clock_rate);
        }
    }
    if let Some(fmtp) = &params.fmtp {
        let _ = writeln!(sdp, "a=fmtp:{pt} {fmtp}");
    }
    let _ = writeln!(sdp, "a=recvonly");
}

/// Descriptor written to disk; the file is removed when this is dropped or closed.
#[derive(Debug)]
pub struct DescriptorFile {
    file: NamedTempFile,
}

impl DescriptorFile {
    pub fn write(dir: &Path, descriptor: &StreamDescriptor) -> EgressResult<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("relaycast-")
            .suffix(".sdp")
            .tempfile_in(dir)?;
        file.write_all(descriptor.to_sdp().as_bytes())?;
        file.flush()?;
        Ok(Self { file })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    #[must_use]
    pub fn path_buf(&self) -> PathBuf {
        self.file.path().to_path_buf()
    }

    /// Delete the artifact now, surfacing any I/O error.
    pub fn close(self) -> EgressResult<()> {
        self.file.close().map_err(EgressError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaycast_sfu::MediaCodec;

    fn video() -> MediaDescription {
        MediaDescription {
            params: RtpStreamParams {
                codec: MediaCodec::H264,
                clock_rate: 90_000,
                payload_type: 102,
                ssrc: Some(1),
                channels: None,
                fmtp: Some("packetization-mode=1".to_string()),
            },
            port: 20_000,
        }
    }

    fn audio() -> MediaDescription {
        MediaDescription {
            params: RtpStreamParams {
                codec: MediaCodec::Opus,
                clock_rate: 48_000,
                payload_type: 111,
                ssrc: Some(2),
                channels: Some(2),
                fmtp: None,
            },
            port: 20_002,
        }
    }

    #[test]
    fn test_sdp_has_both_media_sections() {
        let descriptor = StreamDescriptor::new("127.0.0.1".parse().unwrap(), video(), audio()).unwrap();
        let sdp = descriptor.to_sdp();

        assert!(sdp.contains("c=IN IP4 127.0.0.1"));
        assert!(sdp.contains("m=video 20000 RTP/AVP 102"));
        assert!(sdp.contains("a=rtpmap:102 H264/90000"));
        assert!(sdp.contains("a=fmtp:102 packetization-mode=1"));
        assert!(sdp.contains("m=audio 20002 RTP/AVP 111"));
        assert!(sdp.contains("a=rtpmap:111 opus/48000/2"));
        assert!(sdp.contains("a=rtcp:20003"));
        assert!(sdp.find("m=video").unwrap() < sdp.find("m=audio").unwrap());
    }

    #[test]
    fn test_rejects_swapped_streams() {
        let result = StreamDescriptor::new("127.0.0.1".parse().unwrap(), audio(), video());
        assert!(matches!(result, Err(EgressError::UnsupportedCodec(_))));
    }

    #[test]
    fn test_descriptor_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = StreamDescriptor::new("127.0.0.1".parse().unwrap(), video(), audio()).unwrap();

        let file = DescriptorFile::write(dir.path(), &descriptor).unwrap();
        let path = file.path_buf();
        assert!(std::fs::read_to_string(&path).unwrap().contains("m=video"));

        file.close().unwrap();
        assert!(!path.exists());

        let dropped = DescriptorFile::write(dir.path(), &descriptor).unwrap();
        let path = dropped.path_buf();
        drop(dropped);
        assert!(!path.exists());
    }
}
