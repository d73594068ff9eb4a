use relaycast_sfu::SfuError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EgressError {
    #[error("Encoder failed to launch: {0}")]
    EncoderLaunch(String),

    #[error("Encoder failed mid-stream: {0}")]
    EncoderRuntime(String),

    #[error("Pipeline already exists for broadcast: {0}")]
    PipelineExists(String),

    #[error("Pipeline not found for broadcast: {0}")]
    PipelineNotFound(String),

    #[error("Egress stream not found: {0}")]
    StreamNotFound(String),

    #[error("Egress stream already active: {0}")]
    StreamExists(String),

    #[error("No free RTP port block in {start}-{end}")]
    PortsExhausted { start: u16, end: u16 },

    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("Invalid destination {id}: {reason}")]
    InvalidDestination { id: String, reason: String },

    #[error("At least one destination is required")]
    NoDestinations,

    #[error("Descriptor artifact error: {0}")]
    Artifact(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Sfu(#[from] SfuError),
}

pub type EgressResult<T> = Result<T, EgressError>;
