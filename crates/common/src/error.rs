//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("grant error: {0}")]
    Grant(#[from] crate::grants::GrantError),

    #[error("ring error: {0}")]
    Ring(#[from] crate::ring::RingError),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
