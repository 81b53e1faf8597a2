//! Connection Fabric: cross-node pub/sub, per-room broadcast registries,
//! and the websocket handshake/frame loop (spec §4.5).

pub mod fabric;
pub mod pubsub;
pub mod websocket;

pub use fabric::ConnectionFabric;
pub use pubsub::PubSubBus;
pub use websocket::connect;
