use thiserror::Error;

/// Top-level error type for gateway startup and runtime operation.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error in [{section}]: {message}")]
    Config { section: String, message: String },

    #[error("CAN error: {0}")]
    Can(#[from] crate::can::CanError),

    #[error("broker error: {0}")]
    Broker(#[from] rumqttc::ClientError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn config(section: &str, message: impl Into<String>) -> Self {
        GatewayError::Config {
            section: section.to_string(),
            message: message.into(),
        }
    }
}
