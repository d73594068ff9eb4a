use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use relaycast_abr::{AbrConfig, BitrateLadder, SampleThresholds, DEFAULT_HISTORY_CAPACITY, DEFAULT_PROFILE};
use relaycast_egress::{BridgeConfig, EgressStrategy, EncoderConfig, RetryPolicy, PORTS_PER_BLOCK};
use relaycast_sfu::PoolConfig;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pool: PoolSettings,
    pub bridge: BridgeSettings,
    pub encoder: EncoderSettings,
    pub egress: EgressSettings,
    pub abr: AbrSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub desired_workers: usize,
    pub exit_on_exhaustion: bool,
    pub fatal_grace_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            desired_workers: 2,
            exit_on_exhaustion: true,
            fatal_grace_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    pub listen_ip: IpAddr,
    pub rtp_port_min: u16,
    pub rtp_port_max: u16,
    pub keyframe_interval_ms: u64,
    pub keyframe_wait_ms: u64,
    pub strategy: EgressStrategy,
    /// Defaults to `relaycast` under the system temp directory
    pub artifact_dir: Option<PathBuf>,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            rtp_port_min: 20_000,
            rtp_port_max: 20_999,
            keyframe_interval_ms: 2000,
            keyframe_wait_ms: 1000,
            strategy: EgressStrategy::SharedFanout,
            artifact_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    pub binary_path: String,
    pub startup_probe_ms: u64,
    pub audio_codec: String,
    pub audio_bitrate_kbps: u32,
    pub audio_sample_rate: u32,
    pub video_preset: String,
    pub gop_seconds: u32,
    pub extra_args: Vec<String>,
    pub stderr_tail_lines: usize,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        let defaults = EncoderConfig::default();
        Self {
            binary_path: defaults.binary_path,
            startup_probe_ms: 1500,
            audio_codec: defaults.audio_codec,
            audio_bitrate_kbps: defaults.audio_bitrate_kbps,
            audio_sample_rate: defaults.audio_sample_rate,
            video_preset: defaults.video_preset,
            gop_seconds: defaults.gop_seconds,
            extra_args: defaults.extra_args,
            stderr_tail_lines: defaults.stderr_tail_lines,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EgressSettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub stability_window_secs: u64,
}

impl Default for EgressSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 2000,
            max_delay_ms: 30_000,
            stability_window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbrSettings {
    /// When false, broadcasts keep the profile they were started with
    pub enabled: bool,
    pub sample_interval_secs: u64,
    pub downgrade_after: u32,
    pub upgrade_after: u32,
    pub initial_profile: String,
    pub max_packet_loss: f32,
    pub max_drop_rate: f32,
    pub max_rtt_ms: u32,
    pub good_packet_loss: f32,
    pub good_drop_rate: f32,
    pub good_rtt_ms: u32,
    pub history_capacity: usize,
}

impl Default for AbrSettings {
    fn default() -> Self {
        let thresholds = SampleThresholds::default();
        Self {
            enabled: true,
            sample_interval_secs: 10,
            downgrade_after: 3,
            upgrade_after: 5,
            initial_profile: DEFAULT_PROFILE.to_string(),
            max_packet_loss: thresholds.max_packet_loss,
            max_drop_rate: thresholds.max_drop_rate,
            max_rtt_ms: thresholds.max_rtt_ms,
            good_packet_loss: thresholds.good_packet_loss,
            good_drop_rate: thresholds.good_drop_rate,
            good_rtt_ms: thresholds.good_rtt_ms,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // RELAYCAST_POOL__DESIRED_WORKERS, RELAYCAST_EGRESS__MAX_RETRIES, ...
        builder = builder.add_source(
            Environment::with_prefix("RELAYCAST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Every problem found, empty when the configuration is usable.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let bridge = &self.bridge;
        if bridge.rtp_port_min > bridge.rtp_port_max {
            errors.push(format!(
                "bridge.rtp_port_min ({}) is above bridge.rtp_port_max ({})",
                bridge.rtp_port_min, bridge.rtp_port_max
            ));
        } else if u32::from(bridge.rtp_port_max) - u32::from(bridge.rtp_port_min) + 1
            < u32::from(PORTS_PER_BLOCK)
        {
            errors.push(format!(
                "bridge RTP port range must hold at least {PORTS_PER_BLOCK} ports"
            ));
        }
        if bridge.rtp_port_min % 2 != 0 {
            errors.push("bridge.rtp_port_min must be even".to_string());
        }
        if bridge.keyframe_interval_ms == 0 {
            errors.push("bridge.keyframe_interval_ms must be non-zero".to_string());
        }

        if self.encoder.binary_path.trim().is_empty() {
            errors.push("encoder.binary_path must not be empty".to_string());
        }

        let egress = &self.egress;
        if egress.max_retries == 0 {
            errors.push("egress.max_retries must be at least 1".to_string());
        }
        if egress.base_delay_ms == 0 {
            errors.push("egress.base_delay_ms must be non-zero".to_string());
        }
        if egress.max_delay_ms < egress.base_delay_ms {
            errors.push("egress.max_delay_ms must not be below egress.base_delay_ms".to_string());
        }

        let abr = &self.abr;
        if abr.downgrade_after == 0 || abr.upgrade_after == 0 {
            errors.push("abr.downgrade_after and abr.upgrade_after must be at least 1".to_string());
        } else if abr.upgrade_after < abr.downgrade_after {
            errors.push("abr.upgrade_after must not be below abr.downgrade_after".to_string());
        }
        if abr.sample_interval_secs == 0 {
            errors.push("abr.sample_interval_secs must be non-zero".to_string());
        }
        if abr.history_capacity == 0 {
            errors.push("abr.history_capacity must be non-zero".to_string());
        }
        if BitrateLadder::default().index_of(&abr.initial_profile).is_err() {
            errors.push(format!("abr.initial_profile '{}' is not on the ladder", abr.initial_profile));
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }

        errors
    }

    /// [`Self::validate`] folded into one error.
    pub fn ensure_valid(&self) -> anyhow::Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("Invalid configuration:\n  {}", errors.join("\n  ")))
        }
    }

    #[must_use]
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            desired_workers: self.pool.desired_workers,
            exit_on_exhaustion: self.pool.exit_on_exhaustion,
            fatal_grace: Duration::from_millis(self.pool.fatal_grace_ms),
        }
    }

    #[must_use]
    pub fn bridge_config(&self) -> BridgeConfig {
        let bridge = &self.bridge;
        BridgeConfig {
            listen_ip: bridge.listen_ip,
            rtp_port_min: bridge.rtp_port_min,
            rtp_port_max: bridge.rtp_port_max,
            keyframe_interval: Duration::from_millis(bridge.keyframe_interval_ms),
            keyframe_wait: Duration::from_millis(bridge.keyframe_wait_ms),
            strategy: bridge.strategy,
            artifact_dir: bridge
                .artifact_dir
                .clone()
                .unwrap_or_else(|| std::env::temp_dir().join("relaycast")),
        }
    }

    #[must_use]
    pub fn encoder_config(&self) -> EncoderConfig {
        let encoder = &self.encoder;
        EncoderConfig {
            binary_path: encoder.binary_path.clone(),
            startup_probe: Duration::from_millis(encoder.startup_probe_ms),
            audio_codec: encoder.audio_codec.clone(),
            audio_bitrate_kbps: encoder.audio_bitrate_kbps,
            audio_sample_rate: encoder.audio_sample_rate,
            video_preset: encoder.video_preset.clone(),
            gop_seconds: encoder.gop_seconds,
            extra_args: encoder.extra_args.clone(),
            stderr_tail_lines: encoder.stderr_tail_lines,
        }
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.egress.max_retries,
            base_delay: Duration::from_millis(self.egress.base_delay_ms),
            max_delay: Duration::from_millis(self.egress.max_delay_ms),
            stability_window: Duration::from_secs(self.egress.stability_window_secs),
        }
    }

    #[must_use]
    pub fn abr_config(&self) -> AbrConfig {
        let abr = &self.abr;
        AbrConfig {
            sample_interval: Duration::from_secs(abr.sample_interval_secs),
            downgrade_after: abr.downgrade_after,
            upgrade_after: abr.upgrade_after,
            initial_profile: abr.initial_profile.clone(),
            thresholds: SampleThresholds {
                max_packet_loss: abr.max_packet_loss,
                max_drop_rate: abr.max_drop_rate,
                max_rtt_ms: abr.max_rtt_ms,
                good_packet_loss: abr.good_packet_loss,
                good_drop_rate: abr.good_drop_rate,
                good_rtt_ms: abr.good_rtt_ms,
            },
            history_capacity: abr.history_capacity,
        }
    }
}
