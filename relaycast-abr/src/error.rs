use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AbrError {
    #[error("Unknown bitrate profile: {0}")]
    UnknownProfile(String),

    #[error("Invalid bitrate ladder: {0}")]
    InvalidLadder(String),

    #[error("Invalid controller configuration: {0}")]
    InvalidConfig(String),

    #[error("Broadcast is not under adaptive control: {0}")]
    NotStarted(String),
}

pub type AbrResult<T> = Result<T, AbrError>;
