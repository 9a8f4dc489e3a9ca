use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Job queue is at capacity ({0} jobs)")]
    QueueFull(usize),

    #[error("Invalid scope: {0}")]
    InvalidScope(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Protocol syntax error: {0}")]
    Protocol(String),

    #[error("Queue invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Broker is shut down")]
    ShutDown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
