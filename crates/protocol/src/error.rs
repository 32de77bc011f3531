//! Protocol error types

use thiserror::Error;

/// Errors raised while decoding peer-written data
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Transfer kind byte outside the wire enumeration
    #[error("invalid transfer kind: {0}")]
    InvalidKind(u8),

    /// Indirect descriptor table with a zero or oversized segment count
    #[error("bad indirect descriptor table: {count} segments")]
    IndirectTableOverflow { count: usize },

    /// Isochronous packet table larger than one page
    #[error("bad isochronous packet table: {count} packets")]
    IsoTableOverflow { count: usize },

    /// Segment count inconsistent with the transfer geometry
    #[error("bad segment count: {got} (expected {expected})")]
    BadSegmentCount { got: usize, expected: usize },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
