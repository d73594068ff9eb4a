//! Boundary to the external SFU library
//!
//! The SFU owns ICE/DTLS/SRTP and RTP forwarding. Relaycast only drives its
//! lifecycle through these traits: spawning workers, creating per-broadcast
//! routers, opening plain RTP relay endpoints and tapping producers.

use crate::error::SfuResult;
use crate::rtp::{CodecCapability, RawRtpParameters};
use crate::types::{ConsumerId, EndpointId, MediaKind, ProducerId, RouterId, WorkerId};
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Factory for SFU worker processes
#[async_trait]
pub trait SfuBackend: Send + Sync + 'static {
    async fn create_worker(&self) -> SfuResult<Arc<dyn SfuWorker>>;
}

/// One OS-level SFU process
#[async_trait]
pub trait SfuWorker: Send + Sync + 'static {
    fn id(&self) -> &WorkerId;

    fn pid(&self) -> Option<u32>;

    /// Cancelled once the process has gone away, whatever the reason.
    fn death_signal(&self) -> CancellationToken;

    async fn create_router(&self, codecs: &[CodecCapability]) -> SfuResult<Arc<dyn SfuRouter>>;

    async fn close(&self);
}

/// How a relay endpoint learns where to exchange RTP with the external process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpointOptions {
    pub listen_ip: IpAddr,
    pub port: u16,
    /// Wait for the external sender instead of discovering the peer address.
    pub comedia: bool,
    pub rtcp_mux: bool,
}

/// Per-broadcast routing context
#[async_trait]
pub trait SfuRouter: Send + Sync + 'static {
    fn id(&self) -> &RouterId;

    fn worker_id(&self) -> &WorkerId;

    fn codecs(&self) -> &[CodecCapability];

    fn is_closed(&self) -> bool;

    /// Cancelled when the router is closed, including when its worker dies.
    fn closed_signal(&self) -> CancellationToken;

    fn has_producer(&self, producer_id: &ProducerId) -> bool;

    async fn create_relay_endpoint(
        &self,
        options: RelayEndpointOptions,
    ) -> SfuResult<Arc<dyn RelayEndpoint>>;

    async fn request_key_frame(&self, producer_id: &ProducerId) -> SfuResult<()>;

    /// Must tolerate being called on an already-closed router.
    async fn close(&self);
}

/// Plain (non-WebRTC) RTP endpoint used to pipe media to an external process
#[async_trait]
pub trait RelayEndpoint: Send + Sync + 'static {
    fn id(&self) -> &EndpointId;

    fn local_port(&self) -> u16;

    async fn consume(
        &self,
        producer_id: &ProducerId,
        kind: MediaKind,
    ) -> SfuResult<Arc<dyn RelayConsumer>>;

    async fn close(&self);
}

/// Outbound tap on a producer, bound to a relay endpoint
#[async_trait]
pub trait RelayConsumer: Send + Sync + 'static {
    fn id(&self) -> &ConsumerId;

    fn producer_id(&self) -> &ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RawRtpParameters;

    async fn close(&self);
}
