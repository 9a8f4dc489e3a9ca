//! Line-protocol front end for the broker.
//!
//! - [`protocol`]: request parsing, reply formatting, scope syntax checks
//! - [`connection`]: TCP listener; one task per connection
//! - [`client`]: a small client used by the CLI and tests

pub mod client;
pub mod connection;
pub mod protocol;

pub use client::BrokerClient;
pub use connection::BrokerServer;
pub use protocol::{parse_reply, parse_request, validate_scope, Request, Response};
