//! Error handling for pptrie

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Insert attempted on a `NoWriteReadOnly` or readonly trie.
    ReadOnly,
    /// `max_mem` cannot even hold the root node.
    ZeroCapacity,
    /// Value length disagrees with the trie's `valsize`.
    ValueSize { expected: usize, got: usize },
    /// The writer's `ValueHooks::init_value` refused the value.
    ValueRejected,
    /// Every token slot of the registry is in use.
    TokenSlotsExhausted,
    /// A `StateId` handed out by another trie.
    ForeignState,
    /// Failed to allocate the arena itself.
    ArenaAlloc(String),
}

impl Error {
    pub fn as_str(&self) -> &'static str {
        match self {
            Error::ReadOnly => "Read-only violation",
            Error::ZeroCapacity => "Zero capacity",
            Error::ValueSize { .. } => "Value size mismatch",
            Error::ValueRejected => "Value rejected by writer hook",
            Error::TokenSlotsExhausted => "Token slots exhausted",
            Error::ForeignState => "State of another trie",
            Error::ArenaAlloc(_) => "Arena allocation failed",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ValueSize { expected, got } => {
                write!(f, "{}: expected {} bytes, got {}", self.as_str(), expected, got)
            }
            Error::ArenaAlloc(msg) => write!(f, "{}: {}", self.as_str(), msg),
            _ => f.write_str(self.as_str()),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::alloc::LayoutError> for Error {
    fn from(e: std::alloc::LayoutError) -> Self {
        Error::ArenaAlloc(format!("{e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
