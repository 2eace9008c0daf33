use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Debug)]
pub enum CliError {
    /// Configuration file problem
    Config(String),
    /// Runtime error from the weaving core
    Engine(weft_core::Error),
    /// Smoke run found failing requests
    SmokeFailed { failed: usize, total: usize },
    /// I/O error
    Io(io::Error),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => {
                write!(f, "Configuration error: {}", msg)
            }
            CliError::Engine(e) => {
                write!(f, "Engine error: {}", e)
            }
            CliError::SmokeFailed { failed, total } => {
                write!(f, "Smoke run failed: {}/{} requests did not complete", failed, total)
            }
            CliError::Io(e) => {
                write!(f, "I/O error: {}", e)
            }
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Io(e) => Some(e),
            CliError::Engine(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        CliError::Io(e)
    }
}

impl From<weft_core::Error> for CliError {
    fn from(e: weft_core::Error) -> Self {
        CliError::Engine(e)
    }
}
