#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Castmesh
//! Castmesh relays a live RTP ingest to any number of WebRTC viewers. An encoder sends RTP over UDP
//! to a stream port, the stream splits the packets into a video and an audio track, and every
//! viewer that connects to the signaling WebSocket of that stream gets its own peer connection
//! sending both tracks.
//!
//! Streams are created and deleted at runtime through [`registry::StreamRegistry`], and
//! [`signaling::endpoint::RelayEndpoint`] exposes them over HTTP.

/// Configuration for the relay and for [`transport::WebRTCApi`].
pub mod config;
pub mod error;
/// Peer connection and media factory traits.
pub mod peer;
/// Registry is a module that owns every stream of the process.
pub mod registry;
/// RTP packet related module.
pub mod rtp;
/// WebSocket signaling: message envelope, per-stream hub, client sessions and HTTP routes.
pub mod signaling;
/// Media sinks the demuxer writes into.
pub mod sink;
pub mod stream;
/// [`webrtc::peer_connection::RTCPeerConnection`] based implementation of [`peer::MediaApi`].
pub mod transport;

#[cfg(test)]
mod testing;
