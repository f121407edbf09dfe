use std::{fmt, io, process};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid {name}: {value:?}")]
    InvalidConfig { name: &'static str, value: String },
}

/// Unrecoverable producer state, the packet would be corrupted if we continued.
pub fn fatal<D>(msg: D) -> !
where
    D: fmt::Display,
{
    log::error!("fatal: {msg}");
    process::abort()
}
