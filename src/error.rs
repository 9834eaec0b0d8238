use thiserror::Error;

use crate::formula::FormulaError;

#[derive(Error, Debug)]
pub enum Em2Error {
    #[error("IO error: {context}: {source}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("Unable to communicate with the electrometer, restart required: {0}")]
    CommunicationLost(String),
    #[error("No answer to command: {0}")]
    NoResponse(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Instrument error for '{command}': {message}")]
    Instrument { command: String, message: String },
    #[error("The hardware did not start the acquisition (last status: {status})")]
    StartTimeout { status: String },
    #[error("Usage error: {0}")]
    Usage(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Formula error: {0}")]
    Formula(#[from] FormulaError),
    #[error("Readout error: {context}: {source}")]
    Readout {
        context: String,
        #[source]
        source: Box<Em2Error>,
    },
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<std::io::Error> for Em2Error {
    fn from(source: std::io::Error) -> Self {
        Em2Error::Io {
            source,
            context: "I/O operation".to_string(),
        }
    }
}
