use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    NotInitialized,
    AlreadyInitialized,
    InitializationFailure(String),
    InternalFailure(String),
}

impl GuardError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotInitialized => "not_initialized",
            Self::AlreadyInitialized => "already_initialized",
            Self::InitializationFailure(_) => "initialization_failure",
            Self::InternalFailure(_) => "internal_failure",
        }
    }
}

impl fmt::Display for GuardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "security monitor is not initialized"),
            Self::AlreadyInitialized => write!(f, "security monitor is already initialized"),
            Self::InitializationFailure(msg) => write!(f, "initialization failed: {}", msg),
            Self::InternalFailure(msg) => write!(f, "internal failure: {}", msg),
        }
    }
}

impl std::error::Error for GuardError {}

pub type GuardResult<T> = std::result::Result<T, GuardError>;
