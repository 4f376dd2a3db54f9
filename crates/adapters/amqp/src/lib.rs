//! # homebus-adapter-amqp
//!
//! AMQP transport. All agents share one topic exchange:
//!
//! - the message body is the JSON content map
//! - the routing key carries the subject (empty for plain commands)
//! - every connection consumes a private queue bound with `#`
//!
//! A request gets its own channel and server-named reply queue; the reply
//! is published on the default exchange with the request's correlation id.
//!
//! ## Dependency rule
//! Same as other adapters: depends on `homebus-app` and `homebus-domain`.

mod config;
mod error;
mod transport;

pub use config::AmqpConfig;
pub use error::AmqpError;
pub use transport::AmqpTransport;
