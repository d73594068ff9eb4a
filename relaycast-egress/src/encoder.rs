//! External encoder process
//!
//! The encoder reads a tap's SDP descriptor, encodes once and publishes to one
//! destination (`flv`) or to several through ffmpeg's `tee` muxer.

use crate::error::{EgressError, EgressResult};
use crate::types::{Destination, EgressKey};
use async_trait::async_trait;
use parking_lot::Mutex;
use relaycast_abr::BitrateProfile;
use relaycast_sfu::MediaCodec;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub binary_path: String,
    /// An encoder that exits within this window is reported as a launch failure.
    pub startup_probe: Duration,
    pub audio_codec: String,
    pub audio_bitrate_kbps: u32,
    pub audio_sample_rate: u32,
    pub video_preset: String,
    /// Keyframe interval when transcoding video
    pub gop_seconds: u32,
    /// Appended before the output arguments
    pub extra_args: Vec<String>,
    /// stderr lines kept as the failure reason
    pub stderr_tail_lines: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            binary_path: "ffmpeg".to_string(),
            startup_probe: Duration::from_millis(1500),
            audio_codec: "aac".to_string(),
            audio_bitrate_kbps: 128,
            audio_sample_rate: 44_100,
            video_preset: "veryfast".to_string(),
            gop_seconds: 2,
            extra_args: Vec::new(),
            stderr_tail_lines: 20,
        }
    }
}

/// Everything needed to start one encoder process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeJob {
    pub key: EgressKey,
    pub descriptor_path: PathBuf,
    pub video_codec: MediaCodec,
    pub destinations: Vec<Destination>,
    /// `None` copies H264 through untouched
    pub profile: Option<BitrateProfile>,
}

impl EncodeJob {
    pub fn build_args(&self, config: &EncoderConfig) -> EgressResult<Vec<String>> {
        let urls = self
            .destinations
            .iter()
            .map(Destination::output_url)
            .collect::<EgressResult<Vec<_>>>()?;
        if urls.is_empty() {
            return Err(EgressError::NoDestinations);
        }

        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "warning".into(),
            "-protocol_whitelist".into(),
            "file,udp,rtp".into(),
            "-fflags".into(),
            "+genpts".into(),
            "-i".into(),
            self.descriptor_path.to_string_lossy().into_owned(),
            "-map".into(),
            "0:v:0".into(),
            "-map".into(),
            "0:a:0".into(),
        ];

        match (&self.profile, self.video_codec) {
            (None, MediaCodec::H264) => {
                args.extend(["-c:v".into(), "copy".into()]);
            }
            (profile, _) => {
                args.extend([
                    "-c:v".into(),
                    "libx264".into(),
                    "-preset".into(),
                    config.video_preset.clone(),
                    "-tune".into(),
                    "zerolatency".into(),
                    "-pix_fmt".into(),
                    "yuv420p".into(),
                ]);
                if let Some(profile) = profile {
                    let gop = profile.framerate.max(1) * config.gop_seconds.max(1);
                    args.extend([
                        "-b:v".into(),
                        format!("{}k", profile.video_bitrate_kbps),
                        "-maxrate".into(),
                        format!("{}k", profile.video_bitrate_kbps),
                        "-bufsize".into(),
                        format!("{}k", profile.video_bitrate_kbps * 2),
                        "-vf".into(),
                        format!("scale={}:{}", profile.width, profile.height),
                        "-r".into(),
                        profile.framerate.to_string(),
                        "-g".into(),
                        gop.to_string(),
                        "-keyint_min".into(),
                        gop.to_string(),
                    ]);
                }
            }
        }

        let audio_kbps = self
            .profile
            .as_ref()
            .map_or(config.audio_bitrate_kbps, |p| p.audio_bitrate_kbps);
        args.extend([
            "-c:a".into(),
            config.audio_codec.clone(),
            "-b:a".into(),
            format!("{audio_kbps}k"),
            "-ar".into(),
            config.audio_sample_rate.to_string(),
        ]);

        args.extend(config.extra_args.iter().cloned());

        if let [url] = urls.as_slice() {
            args.extend(["-f".into(), "flv".into(), url.clone()]);
        } else {
            let outputs = urls
                .iter()
                .map(|url| format!("[f=flv:onfail=ignore]{url}"))
                .collect::<Vec<_>>()
                .join("|");
            args.extend(["-f".into(), "tee".into(), outputs]);
        }

        Ok(args)
    }
}

/// How an encoder process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderExit {
    pub code: Option<i32>,
    pub reason: String,
    /// Ended through [`EncoderHandle::terminate`]
    pub requested: bool,
}

impl EncoderExit {
    fn lost() -> Self {
        Self {
            code: None,
            reason: "encoder monitor went away".to_string(),
            requested: false,
        }
    }
}

/// Handle to a running encoder
#[derive(Debug, Clone)]
pub struct EncoderHandle {
    pid: Option<u32>,
    cancel: CancellationToken,
    exit: watch::Receiver<Option<EncoderExit>>,
}

impl EncoderHandle {
    /// `exit` must receive `Some` once the process is gone; `cancel` asks it to go.
    #[must_use]
    pub const fn new(
        pid: Option<u32>,
        cancel: CancellationToken,
        exit: watch::Receiver<Option<EncoderExit>>,
    ) -> Self {
        Self { pid, cancel, exit }
    }

    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the process to stop. Safe to call any number of times.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn try_exit(&self) -> Option<EncoderExit> {
        self.exit.borrow().clone()
    }

    pub async fn exited(&self) -> EncoderExit {
        let mut exit = self.exit.clone();
        let observed = exit.wait_for(Option::is_some).await.ok().and_then(|v| v.clone());
        observed
            .or_else(|| exit.borrow().clone())
            .unwrap_or_else(EncoderExit::lost)
    }

    /// Terminate and wait until the process is really gone.
    pub async fn shutdown(&self) -> EncoderExit {
        self.terminate();
        self.exited().await
    }
}

/// Starts encoder processes
#[async_trait]
pub trait EncoderLauncher: Send + Sync + 'static {
    async fn launch(&self, job: &EncodeJob) -> EgressResult<EncoderHandle>;
}

/// Runs `ffmpeg` as a child process
pub struct FfmpegLauncher {
    config: EncoderConfig,
}

impl FfmpegLauncher {
    #[must_use]
    pub const fn new(config: EncoderConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &EncoderConfig {
        &self.config
    }
}

#[async_trait]
impl EncoderLauncher for FfmpegLauncher {
    async fn launch(&self, job: &EncodeJob) -> EgressResult<EncoderHandle> {
        let args = job.build_args(&self.config)?;
        let destinations: Vec<String> = job.destinations.iter().map(Destination::redacted_url).collect();
        info!(key = %job.key, ?destinations, "Starting encoder");

        let mut child = Command::new(&self.config.binary_path)
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EgressError::EncoderLaunch(format!("failed to spawn {}: {e}", self.config.binary_path)))?;

        let pid = child.id();
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EgressError::EncoderLaunch("failed to capture encoder stderr".to_string()))?;

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(self.config.stderr_tail_lines)));
        let capacity = self.config.stderr_tail_lines.max(1);
        let span = tracing::info_span!("encoder", key = %job.key, pid = ?pid);

        let reader_tail = Arc::clone(&tail);
        let reader = tokio::spawn(
            async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.to_ascii_lowercase().contains("error") {
                        warn!("{line}");
                    } else {
                        debug!("{line}");
                    }
                    let mut tail = reader_tail.lock();
                    if tail.len() >= capacity {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            .instrument(span.clone()),
        );

        let cancel = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);
        let wait_cancel = cancel.clone();

        tokio::spawn(
            async move {
                let exit = tokio::select! {
                    () = wait_cancel.cancelled() => {
                        if let Err(e) = child.kill().await {
                            warn!(error = %e, "Failed to kill encoder");
                        }
                        EncoderExit {
                            code: None,
                            reason: "terminated".to_string(),
                            requested: true,
                        }
                    }
                    status = child.wait() => {
                        // Let the reader drain what the process wrote before dying
                        let _ = reader.await;
                        let last_lines = tail.lock().iter().cloned().collect::<Vec<_>>().join("\n");
                        match status {
                            Ok(status) => EncoderExit {
                                code: status.code(),
                                reason: if last_lines.is_empty() {
                                    format!("encoder exited with {status}")
                                } else {
                                    last_lines
                                },
                                requested: false,
                            },
                            Err(e) => EncoderExit {
                                code: None,
                                reason: format!("failed to wait for encoder: {e}"),
                                requested: false,
                            },
                        }
                    }
                };
                debug!(code = ?exit.code, requested = exit.requested, "Encoder exited");
                let _ = exit_tx.send(Some(exit));
            }
            .instrument(span),
        );

        let handle = EncoderHandle::new(pid, cancel, exit_rx);

        if !self.config.startup_probe.is_zero() {
            if let Ok(exit) = tokio::time::timeout(self.config.startup_probe, handle.exited()).await {
                return Err(EgressError::EncoderLaunch(exit.reason));
            }
        }

        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EgressKey;

    fn job(destinations: Vec<Destination>, profile: Option<BitrateProfile>) -> EncodeJob {
        EncodeJob {
            key: EgressKey::fanout("b1".into()),
            descriptor_path: PathBuf::from("/tmp/relaycast-test.sdp"),
            video_codec: MediaCodec::H264,
            destinations,
            profile,
        }
    }

    fn twitch() -> Destination {
        Destination::new("tw", "twitch", "rtmp://live.twitch.tv/app", "live_1")
    }

    fn youtube() -> Destination {
        Destination::new("yt", "youtube", "rtmp://a.rtmp.youtube.com/live2", "abcd")
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_single_destination_copies_h264() {
        let args = job(vec![twitch()], None).build_args(&EncoderConfig::default()).unwrap();

        assert_eq!(value_after(&args, "-i"), Some("/tmp/relaycast-test.sdp"));
        assert_eq!(value_after(&args, "-protocol_whitelist"), Some("file,udp,rtp"));
        assert_eq!(value_after(&args, "-c:v"), Some("copy"));
        assert_eq!(value_after(&args, "-c:a"), Some("aac"));
        assert_eq!(value_after(&args, "-b:a"), Some("128k"));
        assert_eq!(value_after(&args, "-f"), Some("flv"));
        assert_eq!(args.last().unwrap(), "rtmp://live.twitch.tv/app/live_1");
    }

    #[test]
    fn test_multiple_destinations_use_one_tee_output() {
        let args = job(vec![twitch(), youtube()], None)
            .build_args(&EncoderConfig::default())
            .unwrap();

        assert_eq!(value_after(&args, "-f"), Some("tee"));
        assert_eq!(
            args.last().unwrap(),
            "[f=flv:onfail=ignore]rtmp://live.twitch.tv/app/live_1|\
             [f=flv:onfail=ignore]rtmp://a.rtmp.youtube.com/live2/abcd"
        );
        assert_eq!(args.iter().filter(|a| a.as_str() == "-i").count(), 1);
    }

    #[test]
    fn test_profile_forces_transcode() {
        let profile = BitrateProfile::new("480p", 1200, 96, (854, 480), 30);
        let args = job(vec![twitch()], Some(profile))
            .build_args(&EncoderConfig::default())
            .unwrap();

        assert_eq!(value_after(&args, "-c:v"), Some("libx264"));
        assert_eq!(value_after(&args, "-b:v"), Some("1200k"));
        assert_eq!(value_after(&args, "-bufsize"), Some("2400k"));
        assert_eq!(value_after(&args, "-vf"), Some("scale=854:480"));
        assert_eq!(value_after(&args, "-g"), Some("60"));
        assert_eq!(value_after(&args, "-b:a"), Some("96k"));
    }

    #[test]
    fn test_vp8_input_is_transcoded() {
        let mut job = job(vec![twitch()], None);
        job.video_codec = MediaCodec::Vp8;
        let args = job.build_args(&EncoderConfig::default()).unwrap();
        assert_eq!(value_after(&args, "-c:v"), Some("libx264"));
        assert_eq!(value_after(&args, "-b:v"), None);
    }

    #[test]
    fn test_no_destinations() {
        let result = job(Vec::new(), None).build_args(&EncoderConfig::default());
        assert!(matches!(result, Err(EgressError::NoDestinations)));
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_launch_failure() {
        let launcher = FfmpegLauncher::new(EncoderConfig {
            binary_path: "/nonexistent/relaycast-ffmpeg".to_string(),
            ..Default::default()
        });
        let result = launcher.launch(&job(vec![twitch()], None)).await;
        assert!(matches!(result, Err(EgressError::EncoderLaunch(_))));
    }

    #[tokio::test]
    async fn test_handle_reports_requested_exit() {
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(None);
        let handle = EncoderHandle::new(Some(42), cancel.clone(), rx);

        tokio::spawn(async move {
            cancel.cancelled().await;
            let _ = tx.send(Some(EncoderExit {
                code: None,
                reason: "terminated".to_string(),
                requested: true,
            }));
        });

        assert!(handle.try_exit().is_none());
        let exit = handle.shutdown().await;
        assert!(exit.requested);
        // Repeated shutdowns are harmless
        assert!(handle.shutdown().await.requested);
    }
}
