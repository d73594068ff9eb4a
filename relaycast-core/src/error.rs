use relaycast_abr::AbrError;
use relaycast_egress::EgressError;
use relaycast_sfu::SfuError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Sfu(#[from] SfuError),

    #[error(transparent)]
    Egress(#[from] EgressError),

    #[error(transparent)]
    Abr(#[from] AbrError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Service is shut down")]
    ShutDown,
}

impl Error {
    /// The caller referenced something that does not exist
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Sfu(SfuError::RouterNotFound(_) | SfuError::ProducerNotFound(_))
                | Self::Egress(EgressError::PipelineNotFound(_) | EgressError::StreamNotFound(_))
                | Self::Abr(AbrError::NotStarted(_) | AbrError::UnknownProfile(_))
        )
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
