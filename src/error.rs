//! Error types of the command protocol core.
//!
//! [`FrameError`] covers everything that can go wrong between receiving bytes
//! and building a reply. None of these are fatal: the parser and dispatcher
//! always return to a well defined state and the frame is simply not answered.

use crate::protocol::{self as proto, Command};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// No start marker was found, or the input ended inside a frame.
    #[error("No complete frame in input")]
    Framing,

    /// The declared length is below 8, the parse failure sentinel, or not hex.
    #[error("Rejected declared length {0:?}")]
    LengthRejected(Option<u32>),

    #[error("Checksum mismatched: calculated {calculated:#X}, received {received:?}")]
    ChecksumMismatch {
        calculated: u32,
        received: Option<u32>,
    },

    #[error("Invalid command {0:?}")]
    UnknownCommand(String),

    #[error("Invalid {field} in {command} data")]
    InvalidCommandData {
        command: Command,
        field: &'static str,
    },

    /// `POLL` while frames are streamed on another transport.
    #[error("POLL rejected, a frame streaming session is active")]
    StreamingConflict,
}

/// Failures of the durable key-value store.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store format error: {0}")]
    Format(#[from] serde_yaml::Error),
}

/// Represents all errors surfaced by the library.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wraps `std::io::Error` of the underlying transport.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Protocol(#[from] proto::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("ACK checksum mismatched: calculated {calculated:04X}, received {received:?}")]
    AckChecksumMismatch {
        calculated: u16,
        received: Option<u16>,
    },

    #[error("Expected a {expected} reply, received {received:?}")]
    UnexpectedReply { expected: Command, received: String },

    #[error("Malformed {command} reply payload")]
    MalformedReply { command: Command },

    #[error("Frame has {actual} pixels, expected {expected}")]
    FrameSize { expected: usize, actual: usize },
}

/// The result type of the library.
pub type Result<T> = std::result::Result<T, Error>;
