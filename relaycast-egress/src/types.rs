use crate::error::{EgressError, EgressResult};
use relaycast_sfu::BroadcastId;
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

const SUPPORTED_SCHEMES: &[&str] = &["rtmp", "rtmps"];

/// Caller-assigned identifier of an outbound destination
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DestinationId(String);

impl DestinationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DestinationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DestinationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DestinationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One platform ingest point. Owned by the caller; never mutated here.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub id: DestinationId,
    /// Display label such as "twitch" or "youtube"
    pub platform: String,
    pub ingest_url: String,
    pub stream_key: String,
}

impl Destination {
    pub fn new(
        id: impl Into<DestinationId>,
        platform: impl Into<String>,
        ingest_url: impl Into<String>,
        stream_key: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            platform: platform.into(),
            ingest_url: ingest_url.into(),
            stream_key: stream_key.into(),
        }
    }

    /// Full publish URL: the ingest URL with the stream key appended as the last path segment.
    pub fn output_url(&self) -> EgressResult<String> {
        let ingest = Url::parse(&self.ingest_url).map_err(|e| self.invalid(e.to_string()))?;

        if !SUPPORTED_SCHEMES.contains(&ingest.scheme()) {
            return Err(self.invalid(format!("unsupported scheme '{}'", ingest.scheme())));
        }
        if ingest.host_str().is_none() {
            return Err(self.invalid("missing host".to_string()));
        }

        let base = self.ingest_url.trim_end_matches('/');
        let key = self.stream_key.trim_matches('/');
        if key.is_empty() {
            Ok(base.to_string())
        } else {
            Ok(format!("{base}/{key}"))
        }
    }

    /// Publish URL safe to log
    #[must_use]
    pub fn redacted_url(&self) -> String {
        format!("{}/****", self.ingest_url.trim_end_matches('/'))
    }

    fn invalid(&self, reason: String) -> EgressError {
        EgressError::InvalidDestination {
            id: self.id.to_string(),
            reason,
        }
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("id", &self.id)
            .field("platform", &self.platform)
            .field("ingest_url", &self.ingest_url)
            .field("stream_key", &"****")
            .finish()
    }
}

/// Check that a destination set is non-empty, has unique ids and usable URLs.
pub fn validate_destinations(destinations: &[Destination]) -> EgressResult<()> {
    if destinations.is_empty() {
        return Err(EgressError::NoDestinations);
    }
    for (i, destination) in destinations.iter().enumerate() {
        destination.output_url()?;
        if destinations[..i].iter().any(|d| d.id == destination.id) {
            return Err(EgressError::InvalidDestination {
                id: destination.id.to_string(),
                reason: "duplicate destination id".to_string(),
            });
        }
    }
    Ok(())
}

/// What an egress process publishes to
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EgressTarget {
    /// A single destination with its own encoder
    Destination(DestinationId),
    /// The shared tee encoder feeding every destination of a broadcast
    Fanout,
}

impl fmt::Display for EgressTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Destination(id) => write!(f, "destination:{id}"),
            Self::Fanout => f.write_str("fanout"),
        }
    }
}

/// Identity of a supervised egress process. At most one process per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EgressKey {
    pub broadcast_id: BroadcastId,
    pub target: EgressTarget,
}

impl EgressKey {
    #[must_use]
    pub const fn new(broadcast_id: BroadcastId, target: EgressTarget) -> Self {
        Self { broadcast_id, target }
    }

    #[must_use]
    pub const fn fanout(broadcast_id: BroadcastId) -> Self {
        Self::new(broadcast_id, EgressTarget::Fanout)
    }

    #[must_use]
    pub const fn destination(broadcast_id: BroadcastId, destination_id: DestinationId) -> Self {
        Self::new(broadcast_id, EgressTarget::Destination(destination_id))
    }
}

impl fmt::Display for EgressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.broadcast_id, self.target)
    }
}

/// How a broadcast's destinations map onto encoder processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EgressStrategy {
    /// One encoder muxing the same output to every destination
    #[default]
    SharedFanout,
    /// One encoder per destination, failing and retrying independently
    PerDestination,
}

impl fmt::Display for EgressStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SharedFanout => f.write_str("shared_fanout"),
            Self::PerDestination => f.write_str("per_destination"),
        }
    }
}

/// Lifecycle of a supervised egress process
///
/// ```text
/// STREAMING -> RECONNECTING -> STREAMING
///                          \-> FAILED
/// STREAMING | RECONNECTING -> STOPPED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EgressState {
    Streaming,
    Reconnecting,
    Failed,
    Stopped,
}

impl EgressState {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for EgressState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Streaming => "STREAMING",
            Self::Reconnecting => "RECONNECTING",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_url_joins_stream_key() {
        let d = Destination::new("yt", "youtube", "rtmp://a.rtmp.youtube.com/live2/", "abcd-1234");
        assert_eq!(d.output_url().unwrap(), "rtmp://a.rtmp.youtube.com/live2/abcd-1234");

        let d = Destination::new("custom", "custom", "rtmps://live.example.com:443/app", "");
        assert_eq!(d.output_url().unwrap(), "rtmps://live.example.com:443/app");
    }

    #[test]
    fn test_output_url_rejects_bad_ingest() {
        let d = Destination::new("x", "x", "http://example.com/live", "key");
        assert!(matches!(d.output_url(), Err(EgressError::InvalidDestination { .. })));

        let d = Destination::new("x", "x", "not a url", "key");
        assert!(matches!(d.output_url(), Err(EgressError::InvalidDestination { .. })));
    }

    #[test]
    fn test_stream_key_is_never_formatted() {
        let d = Destination::new("tw", "twitch", "rtmp://live.twitch.tv/app", "live_secret");
        assert!(!format!("{d:?}").contains("live_secret"));
        assert!(!d.redacted_url().contains("live_secret"));
    }

    #[test]
    fn test_validate_destinations() {
        assert!(matches!(validate_destinations(&[]), Err(EgressError::NoDestinations)));

        let a = Destination::new("a", "twitch", "rtmp://live.twitch.tv/app", "k1");
        let b = Destination::new("a", "youtube", "rtmp://a.rtmp.youtube.com/live2", "k2");
        assert!(validate_destinations(std::slice::from_ref(&a)).is_ok());
        assert!(matches!(
            validate_destinations(&[a, b]),
            Err(EgressError::InvalidDestination { .. })
        ));
    }

    #[test]
    fn test_state_display_and_terminality() {
        assert_eq!(EgressState::Reconnecting.to_string(), "RECONNECTING");
        assert!(EgressState::Failed.is_terminal());
        assert!(!EgressState::Streaming.is_terminal());
        assert_eq!(
            EgressKey::destination("b1".into(), "yt".into()).to_string(),
            "b1/destination:yt"
        );
    }
}
