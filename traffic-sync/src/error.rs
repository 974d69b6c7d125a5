use thiserror::Error;

/// Synchronous refusal of a host call. Asynchronous failures arrive later as
/// `HostEvent::Exception` and never surface here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("host channel is not open")]
    Closed,
    #[error("host refused {request}: {reason}")]
    Refused { request: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid engine config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("config value `{field}` must be greater than zero")]
    Zero { field: &'static str },
}
