//! Error types for nvmf-rdma

use crate::fabric::{CompletionError, Direction};

/// Result type for nvmf-rdma operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for nvmf-rdma operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid argument provided
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No command identifier available
    #[error("Submission queue full")]
    QueueFull,

    /// Transport connection could not be established
    #[error("Connect failed: {message}")]
    Connect {
        /// What failed
        message: String,
        /// Underlying transport error, if any
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Fabrics connect completed with a non-success status
    #[error("Command unsuccessful (sct={sct:#x}, sc={sc:#x})")]
    UnsuccessfulCommand {
        /// Status code type
        sct: u8,
        /// Status code
        sc: u8,
    },

    /// Completion tagged with a CID that has no registry entry
    #[error("Unknown CID {cid} in {direction} completion")]
    UnknownCorrelation {
        /// Correlation value carried by the completion
        cid: u16,
        /// Which registry table was consulted
        direction: Direction,
    },

    /// Queue pair has been freed
    #[error("Queue pair closed")]
    Closed,

    /// On-wire field holds a value outside its domain
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Work completion reported a failure status
    #[error(transparent)]
    Completion(#[from] CompletionError),

    /// Transport rejected a post or poll
    #[error("Transport error: {0}")]
    Transport(String),

    /// Internal lock poisoned
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(&'static str),

    /// Operation was cancelled
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create a connect error with just a message.
    pub fn connect(msg: impl Into<String>) -> Self {
        Error::Connect {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a connect error wrapping the transport's own error.
    pub fn connect_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error::Connect {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create from an NVMe status code type / status code pair.
    ///
    /// Returns `None` for the generic success status.
    pub fn from_status(sct: u8, sc: u8) -> Option<Self> {
        if sct == 0 && sc == 0 {
            None
        } else {
            Some(Error::UnsuccessfulCommand { sct, sc })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status() {
        assert!(Error::from_status(0, 0).is_none());
        match Error::from_status(1, 0x82) {
            Some(Error::UnsuccessfulCommand { sct: 1, sc: 0x82 }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_display() {
        let e = Error::UnknownCorrelation {
            cid: 7,
            direction: Direction::Receive,
        };
        assert_eq!(e.to_string(), "Unknown CID 7 in receive completion");

        let e = Error::UnsuccessfulCommand { sct: 1, sc: 0x82 };
        assert_eq!(e.to_string(), "Command unsuccessful (sct=0x1, sc=0x82)");

        let e = Error::connect("rejected");
        assert_eq!(e.to_string(), "Connect failed: rejected");
    }

    #[test]
    fn test_connect_source() {
        use std::error::Error as _;

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let e = Error::connect_with_source("rdma_connect", io);
        assert!(e.source().is_some());
        assert!(Error::connect("x").source().is_none());
    }
}
