//! # homebus-adapter-mqtt
//!
//! MQTT transport: every agent publishes on one shared bus topic and owns a
//! private reply namespace.
//!
//! ## Topic layout
//! - `<base>/legacy`: bus topic, carries JSON wire envelopes
//! - `<base>/<connection-id>/replies/<seq>`: reply topic of one request
//!
//! A background task polls the rumqttc event loop, re-subscribes after every
//! (re)connection and demultiplexes publishes into the reply correlator or
//! the inbound queue.
//!
//! ## Dependency rule
//! Same as other adapters: depends on `homebus-app` and `homebus-domain`.

mod config;
mod error;
mod topics;
mod transport;

pub use config::MqttConfig;
pub use error::MqttError;
pub use topics::Topics;
pub use transport::MqttTransport;
