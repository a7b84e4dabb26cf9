// src/error.rs
use crate::parser::ParseError;
use std::io;
use thiserror::Error;

/// Central error type for the server core.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error while decoding an HTTP request head.
    #[error("request parse error: {0}")]
    Parse(#[from] ParseError),

    /// The listen address could not be parsed.
    #[error("invalid listen address: {0}")]
    InvalidAddr(String),

    /// The connection registry reached its configured capacity.
    #[error("connection registry is full")]
    RegistryFull,
}

pub type ServerResult<T> = Result<T, ServerError>;
