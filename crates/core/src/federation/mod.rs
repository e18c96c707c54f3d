//! Federation: signed cardinality-sketch exchange between clusters.

pub mod auth;
pub mod client;
pub mod server;
pub mod sketch;
pub mod wire;

pub use auth::{FederationKey, FederationVerifier, SIGNING_DOMAIN};
pub use client::{BroadcastReport, FederationClient, FederationTransport};
pub use server::{FederationServer, FederationServerConfig, PeerProfile};
pub use sketch::HllSketch;
pub use wire::{
    Auth, FederationErrorCode, HealthAck, HealthReport, RequestSketch, ShareSketchRequest,
    ShareSketchResponse, SketchMetadata, SketchPayload,
};
