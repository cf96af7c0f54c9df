/// Negotiation of one viewer over one WebSocket connection.
pub mod client;
/// HTTP routes for stream management and the signaling WebSocket.
pub mod endpoint;
/// Per-stream fan-out of signaling messages.
pub mod hub;
pub mod message;
