pub mod broker;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod node;
pub mod scheduler;
pub mod server;
pub mod shutdown;

pub use broker::{Broker, FetchOutcome, FetchRequest, SubmitRequest};
pub use error::{BrokerError, Result};
