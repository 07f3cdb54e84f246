use thiserror::Error;

/// Result type for fault pipeline operations
pub type Result<T> = std::result::Result<T, FaultError>;

/// Errors raised while building, starting or running the pipeline
#[derive(Error, Debug)]
pub enum FaultError {
    /// Pipeline has already been started
    #[error("Pipeline has already been started")]
    AlreadyStarted,

    /// Configuration is inconsistent or a collaborator is missing
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration or reference file could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persistence layer failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Northbound or acknowledgment transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Worker pool could not accept or run work
    #[error("Worker pool error: {0}")]
    Pool(String),

    /// Startup could not complete
    #[error("Startup failed: {0}")]
    Startup(String),
}

/// Errors raised by an [`AlarmStore`](crate::dao::AlarmStore) implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The database or counter table cannot be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A batched transaction was rolled back
    #[error("Store transaction failed: {0}")]
    Transaction(String),

    /// A read query failed
    #[error("Store query failed: {0}")]
    Query(String),
}

/// Errors raised by the northbound client or the ACK sink
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer answered but refused the payload
    #[error("Transport rejected payload: {0}")]
    Rejected(String),

    /// The peer could not be reached
    #[error("Transport unreachable: {0}")]
    Unreachable(String),
}
