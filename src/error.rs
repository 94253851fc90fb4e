use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Event {event} is not supported by the kernel: {reason}")]
    KernelRejected { event: String, reason: String },

    #[error("Failed to open event file: {0}")]
    EventOpen(String),

    #[error("Corrupt data: {0}")]
    Corrupt(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("Symbol resolution failed: {0}")]
    SymbolResolution(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call failed: {0}")]
    Nix(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const PERMISSION_DENIED: i32 = 2;
    pub const INVALID_INPUT: i32 = 3;
    pub const CORRUPT_FILE: i32 = 4;
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::PermissionDenied(_) => exit_code::PERMISSION_DENIED,
            Error::InvalidArgument(_) | Error::KernelRejected { .. } => exit_code::INVALID_INPUT,
            Error::Corrupt(_) => exit_code::CORRUPT_FILE,
            _ => exit_code::GENERAL_ERROR,
        }
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }
}
